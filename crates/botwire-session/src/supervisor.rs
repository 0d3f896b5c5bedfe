//! Session supervisor: transport lifecycle and reconnect policy.

use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicU32, AtomicU64, Ordering},
};

use botwire_core::{
    CloseReason, ConfigError, Connection, ConnectionState, Connector, ConversationId,
    GroupMetadata, MessageDescriptor, MessageKind, ParticipantId, Payload, SendOptions,
    SessionConfig, Transport, TransportError, TransportEvent,
};
use futures::{FutureExt, future::BoxFuture};
use tokio::sync::{mpsc, oneshot};

use crate::{
    correlator::{InboundCorrelator, WaitHandle, WaitOptions},
    events::{MembershipEvent, Reconnected, SessionEvents},
    queue::{OutboundQueue, SendHandle},
};

/// Session error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is not running")]
    NotRunning,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport; terminal once reached through logout or exhaustion.
    Stopped,
    /// Bring-up done, waiting for the transport to report open.
    Starting,
    Open,
    /// A recoverable close is being handled.
    Reconnecting,
}

/// Everything bound to one live transport connection.
struct Link {
    transport: Arc<dyn Transport>,
    queue: OutboundQueue,
    stop: Option<oneshot::Sender<()>>,
}

/// Owns the transport lifecycle and exposes the engine's primitives.
pub struct Session {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    events: SessionEvents,
    /// Serialises start, restart and shutdown.
    lifecycle: tokio::sync::Mutex<()>,
    link: Mutex<Option<Link>>,
    /// Outlives connections so armed waits survive reconnects.
    correlator: Mutex<Option<InboundCorrelator>>,
    state: Mutex<SessionState>,
    attempts: AtomicU32,
    /// Bumped on every bring-up; events of older connections are stale.
    generation: AtomicU64,
    restarts: AtomicU32,
}

impl Session {
    /// Create a stopped session.
    #[must_use]
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            config,
            connector,
            events: SessionEvents::new(),
            lifecycle: tokio::sync::Mutex::new(()),
            link: Mutex::new(None),
            correlator: Mutex::new(None),
            state: Mutex::new(SessionState::Stopped),
            attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            restarts: AtomicU32::new(0),
        })
    }

    /// The session's broadcasters; identical for the session's lifetime.
    #[must_use]
    pub const fn events(&self) -> &SessionEvents {
        &self.events
    }

    /// Configuration the session was created with.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current supervisor state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    /// Consecutive recoverable closes since the last open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Restarts performed since creation, manual or automatic.
    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Bring up the transport.
    ///
    /// A running session is torn down first.
    ///
    /// # Errors
    /// Returns error if the config is invalid or the connector fails.
    pub async fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        self.config.validate()?;
        let _guard = self.lifecycle.lock().await;

        self.attempts.store(0, Ordering::SeqCst);
        self.shutdown_locked().await;
        self.set_state(SessionState::Starting);
        tracing::info!("Starting session");

        let result = self.bring_up().await;
        if result.is_err() {
            self.set_state(SessionState::Stopped);
        }
        result
    }

    /// Tear down and bring up the transport again.
    ///
    /// Broadcasters are kept; only the transport behind them changes.
    ///
    /// # Errors
    /// Returns error if the connector fails.
    pub async fn restart(self: &Arc<Self>) -> Result<(), SessionError> {
        let _guard = self.lifecycle.lock().await;
        self.set_state(SessionState::Starting);

        let result = self.restart_locked().await;
        if result.is_err() {
            self.set_state(SessionState::Stopped);
        }
        result
    }

    /// Close the transport. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        self.shutdown_locked().await;
        self.set_state(SessionState::Stopped);
    }

    /// Queue a message behind the session's rate limit.
    ///
    /// # Errors
    /// Returns error if the session is not running.
    pub fn send(
        &self,
        conversation: ConversationId,
        payload: Payload,
        options: SendOptions,
    ) -> Result<SendHandle, SessionError> {
        Ok(self.queue()?.enqueue(conversation, payload, options))
    }

    /// Send immediately, bypassing the queue.
    ///
    /// Skips pacing and backpressure entirely; meant for low-volume or
    /// urgent messages only.
    ///
    /// # Errors
    /// Returns error if the session is not running or the transport fails.
    pub async fn send_raw(
        &self,
        conversation: &ConversationId,
        payload: &Payload,
        options: &SendOptions,
    ) -> Result<MessageDescriptor, SessionError> {
        let transport = self.transport()?;
        Ok(transport
            .send_message(conversation, payload, options)
            .await?)
    }

    /// See [`InboundCorrelator::wait_for_group_message`].
    ///
    /// # Errors
    /// Returns error if the session is not running.
    pub fn wait_for_group_message(
        &self,
        conversation: ConversationId,
        participant: ParticipantId,
        kind: MessageKind,
        options: WaitOptions,
    ) -> Result<WaitHandle, SessionError> {
        Ok(self
            .correlator()?
            .wait_for_group_message(conversation, participant, kind, options))
    }

    /// See [`InboundCorrelator::wait_for_direct_message`].
    ///
    /// # Errors
    /// Returns error if the session is not running.
    pub fn wait_for_direct_message(
        &self,
        conversation: ConversationId,
        kind: MessageKind,
        options: WaitOptions,
    ) -> Result<WaitHandle, SessionError> {
        Ok(self
            .correlator()?
            .wait_for_direct_message(conversation, kind, options))
    }

    /// See [`InboundCorrelator::group_metadata`].
    ///
    /// # Errors
    /// Returns error if the session is not running or the fetch fails.
    pub async fn group_metadata(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<GroupMetadata>, SessionError> {
        let correlator = self.correlator()?;
        Ok(correlator.group_metadata(conversation).await?)
    }

    /// Outbound queue of the current connection.
    ///
    /// # Errors
    /// Returns error if the session is not running.
    pub fn queue(&self) -> Result<OutboundQueue, SessionError> {
        self.lock_link()
            .as_ref()
            .map(|link| link.queue.clone())
            .ok_or(SessionError::NotRunning)
    }

    /// The session's correlator.
    ///
    /// The same correlator serves every connection; waits armed before a
    /// reconnect keep their feedback path.
    ///
    /// # Errors
    /// Returns error if the session is not running.
    pub fn correlator(&self) -> Result<InboundCorrelator, SessionError> {
        if self.lock_link().is_none() {
            return Err(SessionError::NotRunning);
        }
        self.lock_correlator()
            .clone()
            .ok_or(SessionError::NotRunning)
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, SessionError> {
        self.lock_link()
            .as_ref()
            .map(|link| Arc::clone(&link.transport))
            .ok_or(SessionError::NotRunning)
    }

    async fn restart_locked(self: &Arc<Self>) -> Result<(), SessionError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        tracing::info!("Restarting session");

        self.shutdown_locked().await;
        self.bring_up().await
    }

    async fn bring_up(self: &Arc<Self>) -> Result<(), SessionError> {
        let Connection { transport, events } = self.connector.connect(&self.config).await?;

        let queue = OutboundQueue::new(
            Arc::clone(&transport),
            Arc::clone(&self.events.message_sent),
            self.config.queue_capacity,
            self.config.send_delay(),
        );
        self.bind_correlator(&transport, &queue);

        let (stop_tx, stop_rx) = oneshot::channel();
        *self.lock_link() = Some(Link {
            transport,
            queue,
            stop: Some(stop_tx),
        });

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(Arc::clone(self).pump(generation, events, stop_rx));
        tracing::debug!(generation, "Transport wired");
        Ok(())
    }

    fn bind_correlator(&self, transport: &Arc<dyn Transport>, queue: &OutboundQueue) {
        let mut slot = self.lock_correlator();
        if let Some(correlator) = slot.as_ref() {
            correlator.rebind(Arc::clone(transport), queue.clone());
            return;
        }
        *slot = Some(InboundCorrelator::new(
            Arc::clone(transport),
            Arc::clone(&self.events.message_arrived),
            queue.clone(),
            self.config.ignore_self_messages,
        ));
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn shutdown_locked(&self) {
        let link = self.lock_link().take();
        let Some(mut link) = link else {
            return;
        };
        if let Some(stop) = link.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = link.transport.close().await {
            tracing::warn!("Failed to close transport: {e}");
        }
        tracing::info!("Transport closed");
    }

    /// Forward one connection's events until it is superseded.
    fn pump(
        self: Arc<Self>,
        generation: u64,
        mut events: mpsc::Receiver<TransportEvent>,
        mut stop: oneshot::Receiver<()>,
    ) -> BoxFuture<'static, ()> {
        async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop => break,
                    event = events.recv() => match event {
                        Some(event) => self.dispatch(generation, event).await,
                        None => {
                            tracing::debug!(generation, "Transport event stream ended");
                            self.on_close(generation, CloseReason::ConnectionLost).await;
                            break;
                        }
                    },
                }
            }
        }
        .boxed()
    }

    async fn dispatch(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::Connection(update) => {
                let state = update.state;
                let reason = update.reason.clone();
                self.events.connection.call_all(&update);
                match state {
                    ConnectionState::Open => self.on_open(generation),
                    ConnectionState::Disconnected => {
                        self.on_close(generation, reason.unwrap_or(CloseReason::ConnectionLost))
                            .await;
                    }
                    ConnectionState::Connecting | ConnectionState::Closing => {}
                }
            }
            TransportEvent::MessageArrived(message) => {
                self.events.message_arrived.call_all(&message);
            }
            TransportEvent::MessageUpdated(update) => {
                self.events.message_updated.call_all(&update);
            }
            TransportEvent::MembershipChanged(change) => {
                self.events
                    .membership
                    .call_all(&MembershipEvent::Changed(change));
            }
        }
    }

    fn on_open(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        self.attempts.store(0, Ordering::SeqCst);
        self.set_state(SessionState::Open);
        tracing::info!("Connection open");

        let Ok(transport) = self.transport() else {
            return;
        };
        let membership = Arc::clone(&self.events.membership);
        tokio::spawn(async move {
            match transport.fetch_all_memberships().await {
                Ok(groups) => {
                    tracing::debug!(groups = groups.len(), "Fetched group memberships");
                    membership.call_all(&MembershipEvent::Snapshot(groups));
                }
                Err(e) => tracing::warn!("Failed to fetch group memberships: {e}"),
            }
        });
    }

    async fn on_close(self: &Arc<Self>, generation: u64, reason: CloseReason) {
        let _guard = self.lifecycle.lock().await;
        if !self.is_current(generation) || self.state() == SessionState::Stopped {
            tracing::debug!(generation, ?reason, "Ignoring close of a superseded connection");
            return;
        }

        if reason.is_terminal() {
            tracing::info!(?reason, "Logged out, stopping session");
            self.shutdown_locked().await;
            self.set_state(SessionState::Stopped);
            return;
        }

        let max_attempts = self.config.max_reconnect_attempts;
        loop {
            let attempts = self.attempts.load(Ordering::SeqCst);
            if attempts >= max_attempts {
                tracing::error!(attempts, "Reconnect attempts exhausted, stopping session");
                self.shutdown_locked().await;
                self.set_state(SessionState::Stopped);
                return;
            }

            let attempt = attempts + 1;
            self.attempts.store(attempt, Ordering::SeqCst);
            self.set_state(SessionState::Reconnecting);
            tracing::warn!(attempt, max_attempts, ?reason, "Connection closed, reconnecting");

            match self.restart_locked().await {
                Ok(()) => {
                    self.events.reconnected.call_all(&Reconnected { attempt });
                    return;
                }
                Err(e) => tracing::warn!(attempt, "Reconnect failed: {e}"),
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.lock_state() = state;
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_correlator(&self) -> MutexGuard<'_, Option<InboundCorrelator>> {
        self.correlator
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use botwire_core::{
        ConnectionUpdate, InboundMessage, MembershipAction, MembershipChange, MessageId,
        MessageUpdate,
    };
    use botwire_transport::memory::MemoryConnector;

    use crate::correlator::WaitState;

    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::default()
            .with_send_delay(Duration::ZERO)
            .with_max_reconnect_attempts(2)
    }

    fn session(connector: &MemoryConnector, config: SessionConfig) -> Arc<Session> {
        Session::new(config, Arc::new(connector.clone()))
    }

    async fn until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::task::yield_now().await;
        }
        assert!(cond(), "condition not reached");
    }

    /// Like `until`, for multi-threaded runtimes.
    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cond(), "condition not reached");
    }

    fn record<T: Clone + Send + 'static>(
        broadcaster: &botwire_core::EventBroadcaster<T>,
    ) -> Arc<Mutex<Vec<T>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        broadcaster.listen(move |v: &T| log.lock().unwrap().push(v.clone()));
        seen
    }

    fn group(id: &str) -> GroupMetadata {
        GroupMetadata {
            id: id.into(),
            subject: id.to_string(),
            owner: None,
            participants: Vec::new(),
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_not_running_before_start() {
        let connector = MemoryConnector::new();
        let session = session(&connector, config());

        assert_eq!(session.state(), SessionState::Stopped);
        assert!(matches!(
            session.send("c1".into(), Payload::text("hi"), SendOptions::default()),
            Err(SessionError::NotRunning)
        ));
        assert!(matches!(
            session.wait_for_direct_message("c1".into(), MessageKind::Text, WaitOptions::default()),
            Err(SessionError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let connector = MemoryConnector::new();
        let session = session(&connector, config().with_queue_capacity(0));
        assert!(matches!(session.start().await, Err(SessionError::Config(_))));
        assert_eq!(connector.controller().connects(), 0);
    }

    #[tokio::test]
    async fn test_open_broadcasts_membership_snapshot() {
        let connector = MemoryConnector::new();
        let controller = connector.controller();
        controller.add_group(group("a@group"));
        let session = session(&connector, config());
        let snapshots = record(&session.events().membership);

        session.start().await.unwrap();
        until(|| !snapshots.lock().unwrap().is_empty()).await;

        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(
            snapshots.lock().unwrap()[0],
            MembershipEvent::Snapshot(vec![group("a@group")])
        );
    }

    #[tokio::test]
    async fn test_membership_fetch_failure_is_not_fatal() {
        let connector = MemoryConnector::new();
        let controller = connector.controller();
        controller.fail_membership_fetch(true);
        let session = session(&connector, config());
        let snapshots = record(&session.events().membership);

        session.start().await.unwrap();
        until(|| session.state() == SessionState::Open).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(snapshots.lock().unwrap().is_empty());
        let handle = session
            .send("c1".into(), Payload::text("still here"), SendOptions::default())
            .unwrap();
        assert!(handle.await.unwrap().is_sent());
    }

    #[tokio::test]
    async fn test_transport_events_are_forwarded() {
        let connector = MemoryConnector::new();
        let controller = connector.controller();
        let session = session(&connector, config());
        let arrived = record(&session.events().message_arrived);
        let updated = record(&session.events().message_updated);
        let membership = record(&session.events().membership);
        let connection = record(&session.events().connection);

        session.start().await.unwrap();
        controller
            .deliver(InboundMessage::text("m1", "alice", "hello"))
            .await;
        controller
            .emit(TransportEvent::MessageUpdated(MessageUpdate {
                id: MessageId::from("m1"),
                conversation: "alice".into(),
                text: Some("hello!".into()),
                deleted: false,
            }))
            .await;
        let change = MembershipChange {
            conversation: "team@group".into(),
            participants: vec!["bob".into()],
            action: MembershipAction::Add,
        };
        controller
            .emit(TransportEvent::MembershipChanged(change.clone()))
            .await;

        until(|| updated.lock().unwrap().len() == 1).await;
        until(|| {
            membership
                .lock()
                .unwrap()
                .contains(&MembershipEvent::Changed(change.clone()))
        })
        .await;
        assert_eq!(arrived.lock().unwrap()[0].body(), Some("hello"));
        assert_eq!(connection.lock().unwrap()[0], ConnectionUpdate::open());
    }

    #[tokio::test]
    async fn test_safe_and_raw_send() {
        let connector = MemoryConnector::new();
        let controller = connector.controller();
        let session = session(&connector, config());
        let sent = record(&session.events().message_sent);
        session.start().await.unwrap();

        let handle = session
            .send("c1".into(), Payload::text("queued"), SendOptions::default())
            .unwrap();
        assert!(handle.await.unwrap().is_sent());

        let desc = session
            .send_raw(&"c2".into(), &Payload::text("direct"), &SendOptions::default())
            .await
            .unwrap();
        assert_eq!(desc.conversation, ConversationId::from("c2"));

        assert_eq!(controller.sent().len(), 2);
        // raw sends bypass the queue and are not broadcast as queued sends
        until(|| sent.lock().unwrap().len() == 1).await;
        assert_eq!(
            sent.lock().unwrap()[0].descriptor.conversation,
            ConversationId::from("c1")
        );
    }

    #[tokio::test]
    async fn test_wait_through_session() {
        let connector = MemoryConnector::new();
        let controller = connector.controller();
        let session = session(&connector, config());
        session.start().await.unwrap();

        let handle = session
            .wait_for_group_message(
                "team@group".into(),
                "U".into(),
                MessageKind::Text,
                WaitOptions::new(Duration::from_secs(30)),
            )
            .unwrap();
        controller
            .deliver(InboundMessage::text("m1", "team@group", "from V").with_sender("V"))
            .await;
        controller
            .deliver(InboundMessage::text("m2", "team@group", "hi").with_sender("U"))
            .await;

        let msg = handle.await.unwrap();
        assert_eq!(msg.id, MessageId::from("m2"));
    }

    #[tokio::test]
    async fn test_restart_keeps_broadcaster_identity() {
        let connector = MemoryConnector::new();
        let controller = connector.controller();
        let session = session(&connector, config());
        let arrived = record(&session.events().message_arrived);

        session.start().await.unwrap();
        let before = session.events().clone();

        session.restart().await.unwrap();
        assert!(session.events().same_as(&before));
        assert_eq!(controller.connects(), 2);
        assert_eq!(session.restart_count(), 1);

        controller
            .deliver(InboundMessage::text("m1", "alice", "after restart"))
            .await;
        until(|| arrived.lock().unwrap().len() == 1).await;
    }

    #[tokio::test]
    async fn test_reconnect_bound() {
        let connector = MemoryConnector::new().with_auto_open(false);
        let controller = connector.controller();
        let session = session(&connector, config());
        let reconnected = record(&session.events().reconnected);
        session.start().await.unwrap();

        for expected_connects in [2, 3] {
            controller.close(CloseReason::ConnectionLost).await;
            until(|| controller.connects() == expected_connects).await;
        }
        controller.close(CloseReason::ConnectionLost).await;
        until(|| session.state() == SessionState::Stopped).await;

        assert_eq!(session.restart_count(), 2);
        assert_eq!(
            *reconnected.lock().unwrap(),
            vec![Reconnected { attempt: 1 }, Reconnected { attempt: 2 }]
        );

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!controller.close(CloseReason::ConnectionLost).await);
        assert_eq!(controller.connects(), 3);
        assert!(matches!(session.queue(), Err(SessionError::NotRunning)));
    }

    #[tokio::test]
    async fn test_open_resets_attempts() {
        let connector = MemoryConnector::new().with_auto_open(false);
        let controller = connector.controller();
        let session = session(&connector, config().with_max_reconnect_attempts(1));
        session.start().await.unwrap();

        controller.close(CloseReason::TimedOut).await;
        until(|| controller.connects() == 2).await;
        assert_eq!(session.reconnect_attempts(), 1);

        controller.open().await;
        until(|| session.state() == SessionState::Open).await;
        assert_eq!(session.reconnect_attempts(), 0);

        controller.close(CloseReason::TimedOut).await;
        until(|| controller.connects() == 3).await;
        assert_eq!(session.state(), SessionState::Reconnecting);
    }

    #[tokio::test]
    async fn test_logout_is_terminal() {
        let connector = MemoryConnector::new();
        let controller = connector.controller();
        let session = session(&connector, config());
        session.start().await.unwrap();
        until(|| session.state() == SessionState::Open).await;

        controller.close(CloseReason::LoggedOut).await;
        until(|| session.state() == SessionState::Stopped).await;

        assert_eq!(session.restart_count(), 0);
        assert_eq!(controller.connects(), 1);
    }

    #[tokio::test]
    async fn test_failed_reconnects_count_as_attempts() {
        let connector = MemoryConnector::new();
        let controller = connector.controller();
        let session = session(&connector, config().with_max_reconnect_attempts(3));
        let reconnected = record(&session.events().reconnected);
        session.start().await.unwrap();
        until(|| session.state() == SessionState::Open).await;

        controller.refuse_next_connects(2);
        controller.close(CloseReason::ConnectionLost).await;
        until(|| !reconnected.lock().unwrap().is_empty()).await;

        assert_eq!(*reconnected.lock().unwrap(), vec![Reconnected { attempt: 3 }]);
        assert_eq!(controller.connects(), 2);
        until(|| session.state() == SessionState::Open).await;
    }

    #[tokio::test]
    async fn test_exhausted_by_refused_connects() {
        let connector = MemoryConnector::new();
        let controller = connector.controller();
        let session = session(&connector, config());
        session.start().await.unwrap();
        until(|| session.state() == SessionState::Open).await;

        controller.refuse_next_connects(5);
        controller.close(CloseReason::ConnectionLost).await;
        until(|| session.state() == SessionState::Stopped).await;

        assert_eq!(session.restart_count(), 2);
        assert_eq!(controller.connects(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let connector = MemoryConnector::new();
        let session = session(&connector, config());
        session.start().await.unwrap();

        session.shutdown().await;
        session.shutdown().await;

        assert_eq!(session.state(), SessionState::Stopped);
        assert!(matches!(
            session
                .send_raw(&"c1".into(), &Payload::text("late"), &SendOptions::default())
                .await,
            Err(SessionError::NotRunning)
        ));
        assert_eq!(session.restart_count(), 0);
    }

    #[tokio::test]
    async fn test_start_again_after_stop() {
        let connector = MemoryConnector::new();
        let controller = connector.controller();
        let session = session(&connector, config());
        session.start().await.unwrap();
        controller.close(CloseReason::LoggedOut).await;
        until(|| session.state() == SessionState::Stopped).await;

        session.start().await.unwrap();
        until(|| session.state() == SessionState::Open).await;
        assert_eq!(controller.connects(), 2);
    }

    #[tokio::test]
    async fn test_wait_keeps_feedback_across_reconnect() {
        let connector = MemoryConnector::new();
        let controller = connector.controller();
        let session = session(&connector, config());
        session.start().await.unwrap();
        until(|| session.state() == SessionState::Open).await;

        let handle = session
            .wait_for_direct_message(
                "alice".into(),
                MessageKind::Image,
                WaitOptions::new(Duration::from_secs(30)).with_wrong_type_feedback("send a picture"),
            )
            .unwrap();

        controller.close(CloseReason::ConnectionLost).await;
        until(|| controller.connects() == 2 && session.state() == SessionState::Open).await;
        assert_eq!(session.correlator().unwrap().pending_waits(), 1);

        controller
            .deliver(InboundMessage::text("m1", "alice", "a text"))
            .await;
        until(|| !controller.sent().is_empty()).await;

        let sent = controller.sent();
        assert_eq!(sent[0].payload, Payload::text("send a picture"));
        assert_eq!(sent[0].connection, 2);
        assert_eq!(handle.state(), WaitState::Armed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_right_after_reconnect_is_handled() {
        let connector = MemoryConnector::new();
        let controller = connector.controller();
        let session = session(&connector, config());
        let reconnected = record(&session.events().reconnected);
        session.start().await.unwrap();
        eventually(|| session.state() == SessionState::Open).await;

        controller.lose_next_connects(1);
        controller.close(CloseReason::ConnectionLost).await;
        eventually(|| controller.connects() == 3 && session.state() == SessionState::Open).await;

        assert_eq!(session.restart_count(), 2);
        assert_eq!(
            *reconnected.lock().unwrap(),
            vec![Reconnected { attempt: 1 }, Reconnected { attempt: 2 }]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connections_lost_on_arrival_exhaust_attempts() {
        let connector = MemoryConnector::new();
        let controller = connector.controller();
        let session = session(&connector, config());
        session.start().await.unwrap();
        eventually(|| session.state() == SessionState::Open).await;

        controller.lose_next_connects(5);
        controller.close(CloseReason::ConnectionLost).await;
        eventually(|| session.state() == SessionState::Stopped).await;

        assert_eq!(session.restart_count(), 2);
        assert_eq!(controller.connects(), 3);
    }
}
