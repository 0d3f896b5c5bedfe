//! Request/response correlation over the message-arrived broadcast.
//!
//! Each wait is an explicit state machine:
//!
//! ```text
//! Armed ──match──────────▶ Resolved
//!   │ ──cancel keyword──▶ Cancelled
//!   └ ──timer───────────▶ TimedOut
//! ```
//!
//! A wait settles exactly once. Its timer restarts on every inbound
//! message that is not self-originated, whether or not the message
//! matches the wait.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use botwire_core::{
    ConversationId, EventBroadcaster, GroupMetadata, InboundMessage, Listener, MessageKind,
    ParticipantId, Payload, SendOptions, SessionConfig, Transport, TransportError,
    config::DEFAULT_WAIT_TIMEOUT_MS,
};
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use uuid::Uuid;

use crate::queue::OutboundQueue;

/// Options for a single wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOptions {
    /// Time without inbound traffic after which the wait fails.
    pub timeout: Duration,
    /// Text containing any of these (case-insensitive) cancels the wait.
    pub cancel_keywords: Vec<String>,
    /// Sent to the conversation when the wait is cancelled.
    pub cancel_feedback: Option<String>,
    /// Sent to the conversation when a matching message has the wrong kind.
    pub wrong_type_feedback: Option<String>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS))
    }
}

impl WaitOptions {
    /// Options with the given timeout and no keywords or feedback.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel_keywords: Vec::new(),
            cancel_feedback: None,
            wrong_type_feedback: None,
        }
    }

    /// Options using the config's default timeout.
    #[must_use]
    pub const fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.default_wait_timeout())
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a cancel keyword.
    #[must_use]
    pub fn cancel_on(mut self, keyword: impl Into<String>) -> Self {
        self.cancel_keywords.push(keyword.into());
        self
    }

    /// Reply with `text` when the user cancels.
    #[must_use]
    pub fn with_cancel_feedback(mut self, text: impl Into<String>) -> Self {
        self.cancel_feedback = Some(text.into());
        self
    }

    /// Reply with `text` when the user answers with the wrong kind.
    #[must_use]
    pub fn with_wrong_type_feedback(mut self, text: impl Into<String>) -> Self {
        self.wrong_type_feedback = Some(text.into());
        self
    }
}

/// Which wait an error belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitContext {
    pub wait_id: Uuid,
    pub conversation: ConversationId,
    pub participant: Option<ParticipantId>,
    pub expected: MessageKind,
}

/// Why a wait did not produce a message.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WaitError {
    #[error("Timed out waiting for {} in {}", .context.expected, .context.conversation)]
    TimedOut { context: WaitContext },
    #[error("Cancelled by user in {}", .context.conversation)]
    Cancelled { context: WaitContext },
    #[error("Wait in {} was abandoned", .context.conversation)]
    Abandoned { context: WaitContext },
}

impl WaitError {
    /// The user opted out with a cancel keyword.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Nobody answered in time.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// The wait this error belongs to.
    #[must_use]
    pub const fn context(&self) -> &WaitContext {
        match self {
            Self::TimedOut { context } | Self::Cancelled { context } | Self::Abandoned { context } => {
                context
            }
        }
    }
}

/// Lifecycle of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Armed,
    Resolved,
    Cancelled,
    TimedOut,
}

struct WaitRequest {
    context: WaitContext,
    timeout: Duration,
    cancel_keywords: Vec<String>,
    cancel_feedback: Option<String>,
    wrong_type_feedback: Option<String>,
    state: WaitState,
    deadline: Instant,
    listener: Option<Listener<InboundMessage>>,
    timer: Option<JoinHandle<()>>,
    reply: Option<oneshot::Sender<Result<InboundMessage, WaitError>>>,
}

impl WaitRequest {
    fn matches(&self, msg: &InboundMessage) -> bool {
        if msg.conversation != self.context.conversation {
            return false;
        }
        match &self.context.participant {
            Some(participant) => msg.sender.as_ref() == Some(participant),
            None => true,
        }
    }

    fn hits_cancel_keyword(&self, msg: &InboundMessage) -> bool {
        let Some(body) = msg.body() else {
            return false;
        };
        let body = body.to_lowercase();
        self.cancel_keywords
            .iter()
            .any(|k| !k.is_empty() && body.contains(k.as_str()))
    }

    /// Move to a terminal state and settle the handle.
    ///
    /// Returns the listener to unsubscribe once the lock is released.
    fn settle(
        &mut self,
        state: WaitState,
        result: Result<InboundMessage, WaitError>,
    ) -> Option<Listener<InboundMessage>> {
        self.state = state;
        if let Some(timer) = self.timer.take() {
            if state != WaitState::TimedOut {
                timer.abort();
            }
        }
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
        self.listener.take()
    }
}

type SharedRequest = Arc<Mutex<WaitRequest>>;

fn lock(request: &Mutex<WaitRequest>) -> MutexGuard<'_, WaitRequest> {
    request
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Resolves with the matched message or a [`WaitError`].
#[must_use = "a wait does nothing useful unless awaited"]
pub struct WaitHandle {
    rx: oneshot::Receiver<Result<InboundMessage, WaitError>>,
    context: WaitContext,
    request: SharedRequest,
}

impl WaitHandle {
    /// Current state of the wait.
    #[must_use]
    pub fn state(&self) -> WaitState {
        lock(&self.request).state
    }

    /// Which wait this is.
    #[must_use]
    pub const fn context(&self) -> &WaitContext {
        &self.context
    }
}

impl Future for WaitHandle {
    type Output = Result<InboundMessage, WaitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let context = self.context.clone();
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(WaitError::Abandoned { context })))
    }
}

/// Stand-in deadline for timeouts too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

enum TimerStep {
    Rearm,
    Done,
}

/// Transport and queue of the live connection.
struct Binding {
    transport: Arc<dyn Transport>,
    queue: OutboundQueue,
}

struct Inner {
    binding: Mutex<Binding>,
    arrivals: Arc<EventBroadcaster<InboundMessage>>,
    ignore_self: bool,
    armed: AtomicUsize,
}

impl Inner {
    fn on_message(&self, request: &Mutex<WaitRequest>, msg: &InboundMessage) {
        let mut req = lock(request);
        if req.state != WaitState::Armed {
            return;
        }
        if self.ignore_self && msg.from_self {
            return;
        }

        req.deadline = deadline_after(req.timeout);

        if !req.matches(msg) {
            return;
        }

        if req.hits_cancel_keyword(msg) {
            let context = req.context.clone();
            let feedback = req.cancel_feedback.clone();
            let listener = req.settle(
                WaitState::Cancelled,
                Err(WaitError::Cancelled {
                    context: context.clone(),
                }),
            );
            drop(req);
            tracing::debug!(wait_id = %context.wait_id, conversation = %context.conversation, "Wait cancelled by user");
            self.finish(listener);
            if let Some(text) = feedback {
                self.feedback(&context.conversation, text);
            }
            return;
        }

        if msg.kind != req.context.expected {
            let conversation = req.context.conversation.clone();
            let feedback = req.wrong_type_feedback.clone();
            drop(req);
            tracing::debug!(
                conversation = %conversation,
                got = %msg.kind,
                "Wrong message kind, still waiting"
            );
            if let Some(text) = feedback {
                self.feedback(&conversation, text);
            }
            return;
        }

        let wait_id = req.context.wait_id;
        let listener = req.settle(WaitState::Resolved, Ok(msg.clone()));
        drop(req);
        tracing::debug!(wait_id = %wait_id, "Wait resolved");
        self.finish(listener);
    }

    fn check_timer(&self, request: &Mutex<WaitRequest>) -> TimerStep {
        let mut req = lock(request);
        if req.state != WaitState::Armed {
            return TimerStep::Done;
        }
        if Instant::now() < req.deadline {
            return TimerStep::Rearm;
        }
        let context = req.context.clone();
        let listener = req.settle(
            WaitState::TimedOut,
            Err(WaitError::TimedOut {
                context: context.clone(),
            }),
        );
        drop(req);
        tracing::debug!(wait_id = %context.wait_id, conversation = %context.conversation, "Wait timed out");
        self.finish(listener);
        TimerStep::Done
    }

    fn finish(&self, listener: Option<Listener<InboundMessage>>) {
        if let Some(listener) = listener {
            self.arrivals.unsubscribe(&listener);
        }
        self.armed.fetch_sub(1, Ordering::SeqCst);
    }

    fn feedback(&self, conversation: &ConversationId, text: String) {
        let queue = self.binding().queue.clone();
        let _ = queue.enqueue(conversation.clone(), Payload::text(text), SendOptions::default());
    }

    fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.binding().transport)
    }

    fn binding(&self) -> MutexGuard<'_, Binding> {
        self.binding
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

async fn run_timer(inner: Arc<Inner>, request: SharedRequest) {
    loop {
        let deadline = lock(&request).deadline;
        tokio::time::sleep_until(deadline).await;
        match inner.check_timer(&request) {
            TimerStep::Rearm => {}
            TimerStep::Done => return,
        }
    }
}

/// Waits for inbound messages matching a predicate.
#[derive(Clone)]
pub struct InboundCorrelator {
    inner: Arc<Inner>,
}

impl InboundCorrelator {
    /// Create a correlator listening on `arrivals`.
    ///
    /// Feedback replies go through `queue`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        arrivals: Arc<EventBroadcaster<InboundMessage>>,
        queue: OutboundQueue,
        ignore_self: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                binding: Mutex::new(Binding { transport, queue }),
                arrivals,
                ignore_self,
                armed: AtomicUsize::new(0),
            }),
        }
    }

    /// Point at a new connection.
    ///
    /// Armed waits are kept; their feedback goes through `queue` from now on.
    pub fn rebind(&self, transport: Arc<dyn Transport>, queue: OutboundQueue) {
        *self.inner.binding() = Binding { transport, queue };
    }

    /// Wait for the next message of `kind` from `participant` in a group.
    pub fn wait_for_group_message(
        &self,
        conversation: ConversationId,
        participant: ParticipantId,
        kind: MessageKind,
        options: WaitOptions,
    ) -> WaitHandle {
        self.arm(conversation, Some(participant), kind, options)
    }

    /// Wait for the next message of `kind` in a one-to-one conversation.
    ///
    /// The counterpart is identified by the conversation id alone.
    pub fn wait_for_direct_message(
        &self,
        conversation: ConversationId,
        kind: MessageKind,
        options: WaitOptions,
    ) -> WaitHandle {
        self.arm(conversation, None, kind, options)
    }

    /// Fetch group metadata; `None` when `conversation` is not a group.
    ///
    /// # Errors
    /// Returns error if the transport fails to fetch the metadata.
    pub async fn group_metadata(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<GroupMetadata>, TransportError> {
        let transport = self.inner.transport();
        if !transport.is_group(conversation) {
            return Ok(None);
        }
        transport
            .fetch_conversation_metadata(conversation)
            .await
            .map(Some)
    }

    /// Number of waits still armed.
    #[must_use]
    pub fn pending_waits(&self) -> usize {
        self.inner.armed.load(Ordering::SeqCst)
    }

    fn arm(
        &self,
        conversation: ConversationId,
        participant: Option<ParticipantId>,
        expected: MessageKind,
        options: WaitOptions,
    ) -> WaitHandle {
        let context = WaitContext {
            wait_id: Uuid::new_v4(),
            conversation,
            participant,
            expected,
        };
        let (tx, rx) = oneshot::channel();

        let request = Arc::new(Mutex::new(WaitRequest {
            context: context.clone(),
            timeout: options.timeout,
            cancel_keywords: options
                .cancel_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            cancel_feedback: options.cancel_feedback,
            wrong_type_feedback: options.wrong_type_feedback,
            state: WaitState::Armed,
            deadline: deadline_after(options.timeout),
            listener: None,
            timer: None,
            reply: Some(tx),
        }));

        let listener = {
            let inner = Arc::clone(&self.inner);
            let request = Arc::clone(&request);
            Listener::new(move |msg: &InboundMessage| inner.on_message(&request, msg))
        };
        lock(&request).listener = Some(listener.clone());
        self.inner.armed.fetch_add(1, Ordering::SeqCst);
        self.inner.arrivals.subscribe(listener);

        let timer = tokio::spawn(run_timer(Arc::clone(&self.inner), Arc::clone(&request)));
        {
            let mut req = lock(&request);
            if req.state == WaitState::Armed {
                req.timer = Some(timer);
            }
        }

        tracing::debug!(
            wait_id = %context.wait_id,
            conversation = %context.conversation,
            expected = %expected,
            timeout_ms = options.timeout.as_millis(),
            "Wait armed"
        );

        WaitHandle {
            rx,
            context,
            request,
        }
    }
}
