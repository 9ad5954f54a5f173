//! Connection management module
//!
//! Tracks active sessions and propagates shutdown to all of them.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Unique connection identifier
pub type ConnectionId = u64;

/// Information about an active connection
#[derive(Debug, Clone)]
struct ConnectionInfo {
    peer_addr: SocketAddr,
    connected_at: Instant,
}

/// Registry of live sessions; every session token is a child of the shutdown token
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    /// Counter for generating unique connection IDs
    next_conn_id: Arc<AtomicU64>,
    /// Map from connection_id to active connection
    connections: Arc<DashMap<ConnectionId, ConnectionInfo>>,
    /// Root token cancelled on shutdown
    shutdown: CancellationToken,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    /// Create a new ConnectionManager with its own shutdown token
    pub fn new() -> Self {
        Self::with_shutdown(CancellationToken::new())
    }

    /// Create a ConnectionManager bound to an existing shutdown token
    pub fn with_shutdown(shutdown: CancellationToken) -> Self {
        Self {
            next_conn_id: Arc::new(AtomicU64::new(1)),
            connections: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Register a new connection and return its ID and cancellation token
    pub fn register(&self, peer_addr: SocketAddr) -> (ConnectionId, CancellationToken) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let cancel_token = self.shutdown.child_token();

        let info = ConnectionInfo {
            peer_addr,
            connected_at: Instant::now(),
        };
        self.connections.insert(conn_id, info);

        (conn_id, cancel_token)
    }

    /// Unregister a connection
    pub fn unregister(&self, conn_id: ConnectionId) {
        self.connections.remove(&conn_id);
    }

    /// Cancel every session and the accept loop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Get the number of active connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Peer and age of the longest-lived session
    pub fn oldest(&self) -> Option<(SocketAddr, Duration)> {
        self.connections
            .iter()
            .map(|c| (c.peer_addr, c.connected_at.elapsed()))
            .max_by_key(|(_, age)| *age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_connection_manager_new() {
        let manager = ConnectionManager::new();
        assert_eq!(manager.connection_count(), 0);
        assert!(manager.oldest().is_none());
    }

    #[test]
    fn test_connection_manager_register() {
        let manager = ConnectionManager::new();
        let (conn_id1, _token1) = manager.register(peer(1234));
        let (conn_id2, _token2) = manager.register(peer(1235));

        assert_eq!(manager.connection_count(), 2);
        assert!(conn_id1 < conn_id2);
    }

    #[test]
    fn test_connection_manager_unregister() {
        let manager = ConnectionManager::new();
        let (conn_id, _token) = manager.register(peer(1234));
        assert_eq!(manager.connection_count(), 1);

        manager.unregister(conn_id);
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn test_session_token_is_independent() {
        let manager = ConnectionManager::new();
        let (_, token1) = manager.register(peer(1));
        let (_, token2) = manager.register(peer(2));

        token1.cancel();
        assert!(!token2.is_cancelled());
    }

    #[test]
    fn test_shutdown_cancels_all_sessions() {
        let root = CancellationToken::new();
        let manager = ConnectionManager::with_shutdown(root.clone());
        let (_, token1) = manager.register(peer(1));
        let (_, token2) = manager.register(peer(2));

        manager.shutdown();
        assert!(root.is_cancelled());
        assert!(token1.is_cancelled());
        assert!(token2.is_cancelled());
    }

    #[test]
    fn test_oldest_reports_first_peer() {
        let manager = ConnectionManager::new();
        manager.register(peer(10));
        std::thread::sleep(Duration::from_millis(5));
        manager.register(peer(11));
        assert_eq!(manager.oldest().map(|(addr, _)| addr), Some(peer(10)));
    }

    #[test]
    fn test_connection_manager_concurrent() {
        use std::thread;

        let manager = ConnectionManager::new();
        let handles: Vec<_> = (0..10u16)
            .map(|i| {
                let m = manager.clone();
                thread::spawn(move || {
                    for j in 0..100u16 {
                        let (conn_id, _) = m.register(peer(i * 1000 + j));
                        std::thread::yield_now();
                        m.unregister(conn_id);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(manager.connection_count(), 0);
    }
}
