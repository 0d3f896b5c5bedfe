//! Core traits for the transport seam.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    SessionConfig,
    message::{
        ConversationId, GroupMetadata, InboundMessage, MembershipChange, MessageDescriptor,
        MessageUpdate, Payload, SendOptions,
    },
};

/// Connection state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Why the transport closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    /// The account logged out; reconnecting cannot succeed.
    LoggedOut,
    /// The link dropped.
    ConnectionLost,
    /// The remote stopped answering.
    TimedOut,
    /// Another client took over the session.
    Replaced,
    /// Anything the transport could not classify.
    Other(String),
}

impl CloseReason {
    /// Whether reconnecting after this close is pointless.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

/// Connection state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionUpdate {
    pub state: ConnectionState,
    /// Set when `state` is `Disconnected`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<CloseReason>,
}

impl ConnectionUpdate {
    /// The connection is open.
    #[must_use]
    pub const fn open() -> Self {
        Self {
            state: ConnectionState::Open,
            reason: None,
        }
    }

    /// The connection closed for `reason`.
    #[must_use]
    pub const fn closed(reason: CloseReason) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reason: Some(reason),
        }
    }
}

/// Event emitted by a transport.
///
/// Native callback shapes are adapted into this enum by the transport
/// implementation; nothing above the session layer sees them.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connection(ConnectionUpdate),
    MessageArrived(InboundMessage),
    MessageUpdated(MessageUpdate),
    MembershipChanged(MembershipChange),
}

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport disconnected")]
    Disconnected,
    #[error("Rejected by remote: {0}")]
    Rejected(String),
    #[error("Conversation not found: {0}")]
    NotFound(ConversationId),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport error: {0}")]
    Internal(String),
}

/// A live connection to the messaging platform.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message.
    async fn send_message(
        &self,
        conversation: &ConversationId,
        payload: &Payload,
        options: &SendOptions,
    ) -> Result<MessageDescriptor, TransportError>;

    /// Fetch metadata of a group conversation.
    async fn fetch_conversation_metadata(
        &self,
        conversation: &ConversationId,
    ) -> Result<GroupMetadata, TransportError>;

    /// Fetch metadata of every group this account belongs to.
    async fn fetch_all_memberships(&self) -> Result<Vec<GroupMetadata>, TransportError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;

    /// Whether `conversation` addresses a group.
    fn is_group(&self, conversation: &ConversationId) -> bool;
}

/// Transport handle plus its event stream.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Brings up transports.
///
/// Every call to `connect` is one bring-up; the session calls it again
/// on restart.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection.
    async fn connect(&self, config: &SessionConfig) -> Result<Connection, TransportError>;
}
