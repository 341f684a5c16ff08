//! Registry of live connections.
//!
//! Stores each connection's teardown token so collaborators on any thread
//! can request a disconnect. Cancellation is the only cross-thread signal;
//! the owning thread observes it and performs the actual teardown, so no
//! connection state is touched from outside.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Identifier assigned to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl ConnectionId {
    /// Create a [`ConnectionId`] with the provided value.
    #[must_use]
    pub fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

struct RegisteredConnection {
    token: CancellationToken,
    peer: Option<SocketAddr>,
}

/// Concurrent directory of live connections keyed by [`ConnectionId`].
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: DashMap<ConnectionId, RegisteredConnection>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Reserve the next identifier.
    pub(crate) fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Record a newly established connection.
    pub(crate) fn insert(
        &self,
        id: ConnectionId,
        token: CancellationToken,
        peer: Option<SocketAddr>,
    ) {
        self.entries.insert(id, RegisteredConnection { token, peer });
    }

    /// Drop the entry for a connection, typically at teardown.
    pub(crate) fn remove(&self, id: &ConnectionId) { self.entries.remove(id); }

    /// Request a disconnect of `id` from any thread.
    ///
    /// Returns whether the connection was still registered. Teardown itself
    /// happens later on the owning thread; a second request for the same
    /// connection is harmless.
    pub fn disconnect(&self, id: &ConnectionId) -> bool {
        match self.entries.get(id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Request a disconnect of every registered connection.
    ///
    /// Returns how many connections were signalled.
    pub fn disconnect_all(&self) -> usize {
        let mut signalled = 0;
        for entry in &self.entries {
            entry.token.cancel();
            signalled += 1;
        }
        signalled
    }

    /// Peer address recorded for `id`, if the connection is still live.
    #[must_use]
    pub fn peer(&self, id: &ConnectionId) -> Option<SocketAddr> {
        self.entries.get(id).and_then(|entry| entry.peer)
    }

    /// IDs of the currently registered connections.
    #[must_use]
    pub fn active_ids(&self) -> Vec<ConnectionId> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    /// Whether no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let registry = ConnectionRegistry::new();
        let first = registry.allocate_id();
        let second = registry.allocate_id();
        assert_ne!(first, second);
    }

    #[test]
    fn disconnect_cancels_the_registered_token() {
        let registry = ConnectionRegistry::new();
        let id = registry.allocate_id();
        let token = CancellationToken::new();
        registry.insert(id, token.clone(), None);

        assert!(registry.disconnect(&id));
        assert!(token.is_cancelled());
        // Still registered until the owning thread tears it down.
        assert_eq!(registry.len(), 1);

        registry.remove(&id);
        assert!(!registry.disconnect(&id));
        assert!(registry.is_empty());
    }

    #[test]
    fn disconnect_all_signals_every_entry() {
        let registry = ConnectionRegistry::new();
        let tokens: Vec<CancellationToken> = (0..3)
            .map(|_| {
                let id = registry.allocate_id();
                let token = CancellationToken::new();
                registry.insert(id, token.clone(), None);
                token
            })
            .collect();

        assert_eq!(registry.disconnect_all(), 3);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }

    #[test]
    fn peer_is_recorded() {
        let registry = ConnectionRegistry::new();
        let id = registry.allocate_id();
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        registry.insert(id, CancellationToken::new(), Some(peer));
        assert_eq!(registry.peer(&id), Some(peer));
    }
}
