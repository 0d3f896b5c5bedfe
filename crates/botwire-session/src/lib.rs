//! Session engine on top of a botwire transport.
//!
//! Provides:
//! - `OutboundQueue` - Bounded, paced FIFO of outbound messages
//! - `InboundCorrelator` - Wait for the next matching inbound message
//! - `Session` - Transport lifecycle with bounded reconnects

pub mod correlator;
pub mod events;
pub mod queue;
pub mod supervisor;

pub use correlator::{
    InboundCorrelator, WaitContext, WaitError, WaitHandle, WaitOptions, WaitState,
};
pub use events::{MembershipEvent, Reconnected, SessionEvents};
pub use queue::{Delivery, OutboundQueue, SendError, SendHandle, SentMessage};
pub use supervisor::{Session, SessionError, SessionState};
