//! Echo bot over the in-memory loopback transport.
//!
//! Run with: cargo run -p echo-bot-demo [config.json]
//!
//! Echoes every text message back to its conversation, then asks one
//! contact for a reply and waits for it.

use std::{sync::Arc, time::Duration};

use botwire_core::{InboundMessage, MessageKind, Payload, SendOptions, SessionConfig};
use botwire_session::{Session, WaitOptions};
use botwire_transport::MemoryConnector;
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => SessionConfig::from_path(path)?,
        None => SessionConfig::default().with_send_delay(Duration::from_millis(200)),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .init();

    let connector = MemoryConnector::new();
    let controller = connector.controller();
    let session = Session::new(config, Arc::new(connector));
    session.start().await?;

    // Echo loop
    let (_listener, mut arrivals) = session.events().message_arrived.stream();
    let echo = Arc::clone(&session);
    tokio::spawn(async move {
        while let Some(message) = arrivals.next().await {
            let Some(body) = message.body() else {
                continue;
            };
            let reply = SendOptions::default().quoting(message.id.clone());
            match echo.send(
                message.conversation.clone(),
                Payload::text(format!("echo: {body}")),
                reply,
            ) {
                Ok(handle) => match handle.await {
                    Ok(delivery) => tracing::info!(sent = delivery.is_sent(), "Echo queued"),
                    Err(e) => tracing::warn!("Echo failed: {e}"),
                },
                Err(e) => tracing::warn!("Session unavailable: {e}"),
            }
        }
    });

    let wait = session.wait_for_direct_message(
        "alice".into(),
        MessageKind::Text,
        WaitOptions::new(Duration::from_secs(10))
            .cancel_on("cancel")
            .with_cancel_feedback("Okay, never mind.")
            .with_wrong_type_feedback("Please answer with text."),
    )?;

    controller
        .deliver(InboundMessage::text("m1", "bob", "hello there"))
        .await;
    controller
        .deliver(InboundMessage::of_kind("m2", "alice", MessageKind::Sticker))
        .await;
    controller
        .deliver(InboundMessage::text("m3", "alice", "blue"))
        .await;

    match wait.await {
        Ok(answer) => tracing::info!(answer = answer.body(), "Alice answered"),
        Err(e) => tracing::warn!("No answer: {e}"),
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    for record in controller.sent() {
        tracing::info!(conversation = %record.conversation, payload = ?record.payload, "Sent");
    }

    session.shutdown().await;
    Ok(())
}
