//! Broadcasters a session exposes to the layers above it.

use std::sync::Arc;

use botwire_core::{
    ConnectionUpdate, EventBroadcaster, GroupMetadata, InboundMessage, MembershipChange,
    MessageUpdate,
};

use crate::queue::SentMessage;

/// Emitted after a reconnect brought the transport back up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconnected {
    /// Which attempt succeeded (1-based).
    pub attempt: u32,
}

/// Group membership news.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// Every group the account belongs to, fetched after each open.
    Snapshot(Vec<GroupMetadata>),
    /// Participants changed in one group.
    Changed(MembershipChange),
}

/// The session's broadcasters.
///
/// Created once per session. Restarts re-wire the transport into these
/// same instances, so subscriptions survive reconnects.
#[derive(Debug, Clone, Default)]
pub struct SessionEvents {
    pub reconnected: Arc<EventBroadcaster<Reconnected>>,
    pub message_sent: Arc<EventBroadcaster<SentMessage>>,
    pub message_arrived: Arc<EventBroadcaster<InboundMessage>>,
    pub message_updated: Arc<EventBroadcaster<MessageUpdate>>,
    pub membership: Arc<EventBroadcaster<MembershipEvent>>,
    pub connection: Arc<EventBroadcaster<ConnectionUpdate>>,
}

impl SessionEvents {
    /// Create empty broadcasters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every listener from every broadcaster.
    pub fn clear_all(&self) {
        self.reconnected.clear();
        self.message_sent.clear();
        self.message_arrived.clear();
        self.message_updated.clear();
        self.membership.clear();
        self.connection.clear();
    }

    /// Whether `other` shares every broadcaster instance with `self`.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.reconnected, &other.reconnected)
            && Arc::ptr_eq(&self.message_sent, &other.message_sent)
            && Arc::ptr_eq(&self.message_arrived, &other.message_arrived)
            && Arc::ptr_eq(&self.message_updated, &other.message_updated)
            && Arc::ptr_eq(&self.membership, &other.membership)
            && Arc::ptr_eq(&self.connection, &other.connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_broadcasters() {
        let events = SessionEvents::new();
        let copy = events.clone();
        assert!(events.same_as(&copy));
        assert!(!events.same_as(&SessionEvents::new()));

        copy.message_arrived.listen(|_| {});
        assert_eq!(events.message_arrived.len(), 1);

        events.clear_all();
        assert!(copy.message_arrived.is_empty());
    }
}
