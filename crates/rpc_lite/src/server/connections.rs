use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Tracks accepted connections by peer address, with the time each was
/// accepted.
///
/// Registering a connection returns a guard that removes it again when the
/// connection task ends, however it ends.
#[derive(Debug)]
pub struct ConnectionMap {
    connections: DashMap<SocketAddr, Instant, ahash::RandomState>,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self {
            connections: DashMap::default(),
        }
    }

    /// Record a new connection. Returns a guard that removes it on drop.
    pub fn track(self: &Arc<Self>, peer: SocketAddr) -> ConnectionGuard {
        self.connections.insert(peer, Instant::now());
        ConnectionGuard {
            peer,
            map: Arc::clone(self),
        }
    }

    /// Check if a connection from the given peer is active.
    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.connections.contains_key(peer)
    }

    /// How long `peer` has been connected.
    pub fn connected_for(&self, peer: &SocketAddr) -> Option<Duration> {
        self.connections.get(peer).map(|since| since.elapsed())
    }

    /// Peers currently connected.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.connections.iter().map(|e| *e.key()).collect()
    }

    /// Get the number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no active connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn remove(&self, peer: &SocketAddr) -> Option<Duration> {
        self.connections
            .remove(peer)
            .map(|(_, since)| since.elapsed())
    }
}

impl Default for ConnectionMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds an active connection. When dropped, the connection is removed.
pub struct ConnectionGuard {
    peer: SocketAddr,
    map: Arc<ConnectionMap>,
}

impl ConnectionGuard {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(duration) = self.map.remove(&self.peer) {
            debug!(peer = %self.peer, duration_ms = duration.as_millis() as u64, "Connection untracked");
        }
    }
}

impl fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("peer", &self.peer)
            .finish()
    }
}
