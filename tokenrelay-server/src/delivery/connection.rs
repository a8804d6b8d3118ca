use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::time::Instant;

use super::subscription::Subscription;

/// Process-wide table of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, String>>,
}

impl ConnectionRegistry {
    /// Allocates the next connection id and records it until the ticket drops.
    pub fn register(self: &Arc<Self>, conversation_id: &str) -> ConnectionTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, conversation_id.to_string());
        ConnectionTicket {
            id,
            registry: Arc::clone(self),
        }
    }

    /// Live connections across all conversations.
    #[must_use]
    pub fn active(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Live connections streaming `conversation_id`.
    #[must_use]
    pub fn active_for(&self, conversation_id: &str) -> usize {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|id| id.as_str() == conversation_id)
            .count()
    }

    fn release(&self, id: u64) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Registry entry for one connection, removed on drop.
#[derive(Debug)]
pub struct ConnectionTicket {
    id: u64,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionTicket {
    /// Process-unique connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionTicket {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

/// One client stream: identity, resume point and the subscription it owns.
#[derive(Debug)]
pub struct Connection {
    pub(crate) ticket: ConnectionTicket,
    pub(crate) conversation_id: String,
    pub(crate) start_sequence: u64,
    pub(crate) opened_at: Instant,
    pub(crate) subscription: Subscription,
}

impl Connection {
    /// Registry id of this connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.ticket.id()
    }

    /// Conversation this belongs to.
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// First sequence this connection accepts.
    #[must_use]
    pub fn start_sequence(&self) -> u64 {
        self.start_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase_and_tickets_release_on_drop() {
        let registry = Arc::new(ConnectionRegistry::default());
        let first = registry.register("c1");
        let second = registry.register("c1");
        let other = registry.register("c2");

        assert!(second.id() > first.id());
        assert_eq!(registry.active(), 3);
        assert_eq!(registry.active_for("c1"), 2);

        drop(first);
        drop(other);
        assert_eq!(registry.active(), 1);
        assert_eq!(registry.active_for("c1"), 1);
        assert_eq!(registry.active_for("c2"), 0);
    }
}
