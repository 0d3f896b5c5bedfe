//! In-memory loopback transport.
//!
//! Useful for tests, demos and single-process development. Nothing leaves
//! the process: sends are recorded, and inbound traffic is injected through
//! a [`MemoryController`].

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use botwire_core::{
    CloseReason, Connection, ConnectionUpdate, Connector, ConversationId, GroupMetadata,
    InboundMessage, MessageDescriptor, MessageId, Payload, SendOptions, SessionConfig, Transport,
    TransportError, TransportEvent,
};
use tokio::{sync::mpsc, time::Instant};
use uuid::Uuid;

/// Conversation ids ending with this suffix are groups.
pub const GROUP_SUFFIX: &str = "@group";

const EVENT_BUFFER: usize = 256;

/// A message accepted by the loopback transport.
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub conversation: ConversationId,
    pub payload: Payload,
    pub options: SendOptions,
    /// Connection that carried the send (1 for the first connect).
    pub connection: usize,
    pub at: Instant,
}

#[derive(Default)]
struct Shared {
    connects: usize,
    refuse_connects: usize,
    lose_connects: usize,
    sent: Vec<SentRecord>,
    failing: HashSet<ConversationId>,
    groups: HashMap<ConversationId, GroupMetadata>,
    fail_memberships: bool,
    send_latency: Duration,
    events: Option<mpsc::Sender<TransportEvent>>,
}

#[derive(Clone, Default)]
struct SharedHandle(Arc<Mutex<Shared>>);

impl SharedHandle {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Connector producing [`MemoryTransport`]s.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: SharedHandle,
    auto_open: bool,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    /// Create a connector whose connections report `Open` right away.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: SharedHandle::default(),
            auto_open: true,
        }
    }

    /// Choose whether new connections report `Open` on their own.
    ///
    /// With `false`, the controller decides when a connection opens.
    #[must_use]
    pub fn with_auto_open(mut self, auto_open: bool) -> Self {
        self.auto_open = auto_open;
        self
    }

    /// Handle for driving the connections this connector creates.
    #[must_use]
    pub fn controller(&self) -> MemoryController {
        MemoryController {
            shared: self.shared.clone(),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Connection, TransportError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let (connection, lost) = {
            let mut shared = self.shared.lock();
            if shared.refuse_connects > 0 {
                shared.refuse_connects -= 1;
                return Err(TransportError::Rejected("connection refused".to_string()));
            }
            let lost = shared.lose_connects > 0;
            if lost {
                shared.lose_connects -= 1;
            }
            shared.connects += 1;
            shared.events = Some(tx.clone());
            (shared.connects, lost)
        };

        tracing::debug!(connection, auth_dir = %config.auth_dir.display(), "Loopback connected");

        if lost {
            let _ = tx.try_send(TransportEvent::Connection(ConnectionUpdate::closed(
                CloseReason::ConnectionLost,
            )));
        } else if self.auto_open {
            let _ = tx.try_send(TransportEvent::Connection(ConnectionUpdate::open()));
        }

        Ok(Connection {
            transport: Arc::new(MemoryTransport {
                shared: self.shared.clone(),
                connection,
                events: tx,
                closed: AtomicBool::new(false),
            }),
            events: rx,
        })
    }
}

/// One loopback connection.
pub struct MemoryTransport {
    shared: SharedHandle,
    connection: usize,
    events: mpsc::Sender<TransportEvent>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_message(
        &self,
        conversation: &ConversationId,
        payload: &Payload,
        options: &SendOptions,
    ) -> Result<MessageDescriptor, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }

        let latency = self.shared.lock().send_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut shared = self.shared.lock();
        if shared.failing.contains(conversation) {
            return Err(TransportError::Rejected(format!(
                "sending to {conversation} is not allowed"
            )));
        }
        shared.sent.push(SentRecord {
            conversation: conversation.clone(),
            payload: payload.clone(),
            options: options.clone(),
            connection: self.connection,
            at: Instant::now(),
        });

        Ok(MessageDescriptor {
            id: MessageId::new(Uuid::new_v4().to_string()),
            conversation: conversation.clone(),
            timestamp: now(),
        })
    }

    async fn fetch_conversation_metadata(
        &self,
        conversation: &ConversationId,
    ) -> Result<GroupMetadata, TransportError> {
        self.shared
            .lock()
            .groups
            .get(conversation)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(conversation.clone()))
    }

    async fn fetch_all_memberships(&self) -> Result<Vec<GroupMetadata>, TransportError> {
        let shared = self.shared.lock();
        if shared.fail_memberships {
            return Err(TransportError::Internal("membership fetch failed".to_string()));
        }
        let mut groups: Vec<GroupMetadata> = shared.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(connection = self.connection, "Loopback closed");
        let _ = self
            .events
            .try_send(TransportEvent::Connection(ConnectionUpdate::closed(
                CloseReason::Other("closed by client".to_string()),
            )));
        Ok(())
    }

    fn is_group(&self, conversation: &ConversationId) -> bool {
        conversation.as_str().ends_with(GROUP_SUFFIX)
    }
}

/// Drives loopback connections from the outside.
#[derive(Clone)]
pub struct MemoryController {
    shared: SharedHandle,
}

impl MemoryController {
    /// Emit an event on the most recent connection.
    ///
    /// Returns false if there is no connection or nobody is listening.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        let Some(tx) = self.shared.lock().events.clone() else {
            return false;
        };
        tx.send(event).await.is_ok()
    }

    /// Report the current connection as open.
    pub async fn open(&self) -> bool {
        self.emit(TransportEvent::Connection(ConnectionUpdate::open()))
            .await
    }

    /// Report the current connection as closed.
    pub async fn close(&self, reason: CloseReason) -> bool {
        self.emit(TransportEvent::Connection(ConnectionUpdate::closed(reason)))
            .await
    }

    /// Deliver an inbound message.
    pub async fn deliver(&self, message: InboundMessage) -> bool {
        self.emit(TransportEvent::MessageArrived(message)).await
    }

    /// Every send accepted so far, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<SentRecord> {
        self.shared.lock().sent.clone()
    }

    /// Number of successful connects.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.shared.lock().connects
    }

    /// Refuse the next `count` connects.
    pub fn refuse_next_connects(&self, count: usize) {
        self.shared.lock().refuse_connects = count;
    }

    /// Let the next `count` connects succeed, then report them lost at once.
    pub fn lose_next_connects(&self, count: usize) {
        self.shared.lock().lose_connects = count;
    }

    /// Make every send to `conversation` fail.
    pub fn fail_sends_to(&self, conversation: impl Into<ConversationId>) {
        self.shared.lock().failing.insert(conversation.into());
    }

    /// Register a group the transport knows about.
    pub fn add_group(&self, metadata: GroupMetadata) {
        self.shared.lock().groups.insert(metadata.id.clone(), metadata);
    }

    /// Make `fetch_all_memberships` fail.
    pub fn fail_membership_fetch(&self, fail: bool) {
        self.shared.lock().fail_memberships = fail;
    }

    /// Delay every send by `latency`.
    pub fn set_send_latency(&self, latency: Duration) {
        self.shared.lock().send_latency = latency;
    }
}
