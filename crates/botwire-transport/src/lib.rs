//! Transport implementations for botwire sessions.
//!
//! Provides:
//! - In-memory loopback transport (feature: memory)

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::{MemoryConnector, MemoryController, MemoryTransport, SentRecord};
