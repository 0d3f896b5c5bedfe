//! Bounded, paced FIFO of outbound messages.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
    time::Duration,
};

use botwire_core::{
    ConversationId, EventBroadcaster, MessageDescriptor, Payload, SendOptions, Transport,
    TransportError,
};
use tokio::sync::oneshot;

/// Send error.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Queue dropped the message before it was sent")]
    Dropped,
}

/// Outcome of a queued send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The transport accepted the message.
    Sent(MessageDescriptor),
    /// The queue was full; the message was never queued.
    NotSent,
}

impl Delivery {
    /// Whether the message reached the transport.
    #[must_use]
    pub const fn is_sent(&self) -> bool {
        matches!(self, Self::Sent(_))
    }
}

/// A message the transport accepted, as broadcast after each drained send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub descriptor: MessageDescriptor,
    pub payload: Payload,
}

/// Resolves once the queued message has been handled.
#[must_use = "dropping the handle does not cancel the send"]
pub struct SendHandle {
    rx: oneshot::Receiver<Result<Delivery, SendError>>,
}

impl SendHandle {
    fn settled(result: Result<Delivery, SendError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for SendHandle {
    type Output = Result<Delivery, SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(SendError::Dropped)))
    }
}

struct OutboundItem {
    conversation: ConversationId,
    payload: Payload,
    options: SendOptions,
    reply: oneshot::Sender<Result<Delivery, SendError>>,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<OutboundItem>,
    draining: bool,
    stopped: bool,
}

struct Inner {
    transport: Arc<dyn Transport>,
    sent: Arc<EventBroadcaster<SentMessage>>,
    capacity: usize,
    delay: Duration,
    state: Mutex<QueueState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Outbound queue bound to one transport.
///
/// Items are sent strictly in submission order with at most one transport
/// call in flight; every send is followed by the configured delay. Once
/// `capacity` items are waiting, further enqueues resolve as
/// [`Delivery::NotSent`] without touching the transport.
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<Inner>,
}

impl OutboundQueue {
    /// Create a queue draining into `transport`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        sent: Arc<EventBroadcaster<SentMessage>>,
        capacity: usize,
        delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                sent,
                capacity,
                delay,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Queue a message for sending.
    ///
    /// Must be called from within a tokio runtime; the drain loop is
    /// spawned lazily.
    pub fn enqueue(
        &self,
        conversation: ConversationId,
        payload: Payload,
        options: SendOptions,
    ) -> SendHandle {
        let (tx, rx) = oneshot::channel();

        let start = {
            let mut state = self.inner.lock();
            if state.items.len() >= self.inner.capacity {
                tracing::warn!(
                    conversation = %conversation,
                    capacity = self.inner.capacity,
                    "Outbound queue full, message not sent"
                );
                return SendHandle::settled(Ok(Delivery::NotSent));
            }
            state.items.push_back(OutboundItem {
                conversation,
                payload,
                options,
                reply: tx,
            });
            tracing::debug!(queued = state.items.len(), "Message queued");
            claim_drain(&mut state)
        };

        if start {
            self.spawn_drain();
        }
        SendHandle { rx }
    }

    /// Stop starting new sends; queued items stay queued.
    ///
    /// A send already in flight completes normally.
    pub fn stop_gracefully(&self) {
        self.inner.lock().stopped = true;
        tracing::debug!("Outbound queue stopping");
    }

    /// Resume draining after [`stop_gracefully`](Self::stop_gracefully).
    pub fn resume(&self) {
        let start = {
            let mut state = self.inner.lock();
            state.stopped = false;
            claim_drain(&mut state)
        };
        if start {
            self.spawn_drain();
        }
    }

    /// Number of items waiting to be sent.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether no item is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Maximum number of waiting items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Whether a drain loop is active.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.inner.lock().draining
    }

    /// Whether the queue was stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    fn spawn_drain(&self) {
        let queue = self.clone();
        tokio::spawn(async move { queue.drain().await });
    }

    async fn drain(self) {
        loop {
            let item = {
                let mut state = self.inner.lock();
                let next = if state.stopped {
                    None
                } else {
                    state.items.pop_front()
                };
                match next {
                    Some(item) => item,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };

            let result = self
                .inner
                .transport
                .send_message(&item.conversation, &item.payload, &item.options)
                .await;

            match result {
                Ok(descriptor) => {
                    tracing::debug!(
                        conversation = %item.conversation,
                        message_id = %descriptor.id,
                        "Message sent"
                    );
                    let _ = item.reply.send(Ok(Delivery::Sent(descriptor.clone())));
                    self.inner.sent.call_all(&SentMessage {
                        descriptor,
                        payload: item.payload,
                    });
                }
                Err(e) => {
                    tracing::warn!(conversation = %item.conversation, "Send failed: {e}");
                    let _ = item.reply.send(Err(SendError::Transport(e)));
                }
            }

            tokio::time::sleep(self.inner.delay).await;
        }
    }
}

/// Mark the queue as draining if a loop should start now.
fn claim_drain(state: &mut QueueState) -> bool {
    if state.draining || state.stopped || state.items.is_empty() {
        return false;
    }
    state.draining = true;
    true
}

#[cfg(test)]
mod tests {
    use botwire_core::{Connector, SessionConfig};
    use botwire_transport::memory::{MemoryConnector, MemoryController};

    use super::*;

    async fn queue(capacity: usize, delay: Duration) -> (OutboundQueue, MemoryController) {
        let connector = MemoryConnector::new();
        let conn = connector.connect(&SessionConfig::default()).await.unwrap();
        let queue = OutboundQueue::new(
            conn.transport,
            Arc::new(EventBroadcaster::new()),
            capacity,
            delay,
        );
        (queue, connector.controller())
    }

    fn texts(controller: &MemoryController) -> Vec<String> {
        controller
            .sent()
            .into_iter()
            .map(|r| match r.payload {
                Payload::Text { text } => text,
                other => panic!("unexpected payload {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_three_sends_in_order() {
        let (queue, controller) = queue(5, Duration::ZERO).await;

        let a = queue.enqueue("c1".into(), Payload::text("one"), SendOptions::default());
        let b = queue.enqueue("c2".into(), Payload::text("two"), SendOptions::default());
        let c = queue.enqueue("c1".into(), Payload::text("three"), SendOptions::default());

        assert!(a.await.unwrap().is_sent());
        assert!(b.await.unwrap().is_sent());
        assert!(c.await.unwrap().is_sent());

        assert_eq!(texts(&controller), vec!["one", "two", "three"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_resolves_not_sent() {
        let (queue, controller) = queue(1, Duration::ZERO).await;

        let first = queue.enqueue("c1".into(), Payload::text("first"), SendOptions::default());
        let second = queue.enqueue("c1".into(), Payload::text("second"), SendOptions::default());
        assert_eq!(queue.len(), 1);

        assert_eq!(second.await.unwrap(), Delivery::NotSent);
        assert!(first.await.unwrap().is_sent());

        assert_eq!(texts(&controller), vec!["first"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_are_paced() {
        let delay = Duration::from_millis(250);
        let (queue, controller) = queue(10, delay).await;

        let handles: Vec<_> = (0..3)
            .map(|i| queue.enqueue("c1".into(), Payload::text(format!("m{i}")), SendOptions::default()))
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let sent = controller.sent();
        assert_eq!(sent.len(), 3);
        for pair in sent.windows(2) {
            assert!(pair[1].at - pair[0].at >= delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_holds_across_drain_restarts() {
        let delay = Duration::from_millis(100);
        let (queue, controller) = queue(10, delay).await;

        queue
            .enqueue("c1".into(), Payload::text("a"), SendOptions::default())
            .await
            .unwrap();
        queue
            .enqueue("c1".into(), Payload::text("b"), SendOptions::default())
            .await
            .unwrap();

        let sent = controller.sent();
        assert!(sent[1].at - sent[0].at >= delay);
    }

    #[tokio::test]
    async fn test_failure_rejects_only_that_item() {
        let (queue, controller) = queue(5, Duration::ZERO).await;
        controller.fail_sends_to("blocked");

        let ok1 = queue.enqueue("c1".into(), Payload::text("one"), SendOptions::default());
        let bad = queue.enqueue("blocked".into(), Payload::text("two"), SendOptions::default());
        let ok2 = queue.enqueue("c1".into(), Payload::text("three"), SendOptions::default());

        assert!(ok1.await.is_ok());
        assert!(matches!(bad.await, Err(SendError::Transport(TransportError::Rejected(_)))));
        assert!(ok2.await.is_ok());
        assert_eq!(texts(&controller), vec!["one", "three"]);
    }

    #[tokio::test]
    async fn test_stop_and_resume() {
        let (queue, controller) = queue(5, Duration::ZERO).await;
        queue.stop_gracefully();

        let handle = queue.enqueue("c1".into(), Payload::text("held"), SendOptions::default());
        tokio::task::yield_now().await;
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_draining());
        assert!(controller.sent().is_empty());

        queue.resume();
        assert!(handle.await.unwrap().is_sent());
        assert!(queue.is_empty());
        assert!(!queue.is_stopped());
    }

    #[tokio::test]
    async fn test_successful_sends_are_broadcast() {
        let connector = MemoryConnector::new();
        let conn = connector.connect(&SessionConfig::default()).await.unwrap();
        let sent = Arc::new(EventBroadcaster::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        sent.listen(move |m: &SentMessage| log.lock().unwrap().push(m.descriptor.conversation.clone()));

        let queue = OutboundQueue::new(conn.transport, Arc::clone(&sent), 5, Duration::ZERO);
        connector.controller().fail_sends_to("blocked");

        let a = queue.enqueue("c1".into(), Payload::text("x"), SendOptions::default());
        let b = queue.enqueue("blocked".into(), Payload::text("y"), SendOptions::default());
        let _ = a.await;
        let _ = b.await;
        tokio::task::yield_now().await;

        assert_eq!(*seen.lock().unwrap(), vec![ConversationId::from("c1")]);
    }
}
