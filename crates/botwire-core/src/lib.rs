//! Core abstractions for chat-bot transport sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `EventBroadcaster` - Ordered, synchronous multicast of typed events
//! - Message and group metadata types
//! - `Transport` and `Connector` traits
//! - `SessionConfig`

pub mod broadcaster;
pub mod config;
pub mod message;
pub mod traits;

pub use broadcaster::{EventBroadcaster, Listener};
pub use config::{ConfigError, SessionConfig};
pub use message::{
    ConversationId, GroupMetadata, GroupParticipant, InboundMessage, MembershipAction,
    MembershipChange, MessageDescriptor, MessageId, MessageKind, MessageUpdate, ParticipantId,
    ParticipantRole, Payload, SendOptions,
};
pub use traits::{
    CloseReason, Connection, ConnectionState, ConnectionUpdate, Connector, Transport,
    TransportError, TransportEvent,
};
