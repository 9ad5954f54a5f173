//! Core proxy server implementation
//!
//! The Server struct bundles the per-process components every session uses.

use std::sync::Arc;

use super::connection::ConnectionManager;
use super::hooks::StatsCollector;
use super::negotiator::Negotiator;
use crate::config::ConnConfig;
use crate::transport::BackendDialer;

/// Core proxy server
pub struct Server {
    /// Client handshake classifier, owns the replay guard
    pub negotiator: Negotiator,
    /// Backend dialer for the configured mode
    pub dialer: BackendDialer,
    /// Statistics collector
    pub stats: Arc<dyn StatsCollector>,
    /// Connection manager
    pub conn_manager: ConnectionManager,
    /// Connection performance configuration
    pub conn_config: ConnConfig,
    /// Fallback target for non-matching TLS traffic
    pub decoy: Option<String>,
}

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }
}

/// Builder for constructing a Server
pub struct ServerBuilder {
    negotiator: Option<Negotiator>,
    dialer: Option<BackendDialer>,
    stats: Option<Arc<dyn StatsCollector>>,
    conn_manager: Option<ConnectionManager>,
    conn_config: Option<ConnConfig>,
    decoy: Option<String>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    /// Create a new server builder with default settings
    pub fn new() -> Self {
        Self {
            negotiator: None,
            dialer: None,
            stats: None,
            conn_manager: None,
            conn_config: None,
            decoy: None,
        }
    }

    pub fn negotiator(mut self, negotiator: Negotiator) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    pub fn dialer(mut self, dialer: BackendDialer) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Set statistics collector
    pub fn stats(mut self, stats: Arc<dyn StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Set connection manager
    pub fn conn_manager(mut self, manager: ConnectionManager) -> Self {
        self.conn_manager = Some(manager);
        self
    }

    /// Set connection configuration
    pub fn conn_config(mut self, config: ConnConfig) -> Self {
        self.conn_config = Some(config);
        self
    }

    pub fn decoy(mut self, decoy: Option<String>) -> Self {
        self.decoy = decoy;
        self
    }

    /// Build the server
    ///
    /// Panics if negotiator, dialer or stats collector is not set
    pub fn build(self) -> Server {
        Server {
            negotiator: self.negotiator.expect("negotiator is required"),
            dialer: self.dialer.expect("dialer is required"),
            stats: self.stats.expect("stats collector is required"),
            conn_manager: self.conn_manager.unwrap_or_default(),
            conn_config: self.conn_config.unwrap_or_default(),
            decoy: self.decoy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hooks::SessionReport;
    use crate::core::replay::{EvictionPolicy, ReplayConfig, ReplayGuard};
    use crate::core::secret::Secret;
    use crate::transport::{DatacenterTable, DirectDialer};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct TestStatsCollector {
        sessions: AtomicU64,
    }

    impl StatsCollector for TestStatsCollector {
        fn record_session(&self, _report: &SessionReport) {
            self.sessions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn negotiator() -> Negotiator {
        let replay = ReplayGuard::new(ReplayConfig {
            capacity: 16,
            window: Duration::from_secs(60),
            policy: EvictionPolicy::Ttl,
        });
        Negotiator::new(Secret::simple([7; 16]), Arc::new(replay), Duration::from_secs(300))
    }

    fn dialer() -> BackendDialer {
        BackendDialer::Direct(DirectDialer::new(
            DatacenterTable::builtin(),
            Duration::from_secs(5),
            true,
        ))
    }

    #[test]
    fn test_server_builder() {
        let server = Server::builder()
            .negotiator(negotiator())
            .dialer(dialer())
            .stats(Arc::new(TestStatsCollector {
                sessions: AtomicU64::new(0),
            }))
            .build();
        assert_eq!(server.dialer.name(), "direct");
        assert!(server.decoy.is_none());
        assert_eq!(server.conn_config.buffer_size, 32 * 1024);
    }

    #[test]
    fn test_server_builder_with_conn_manager() {
        let conn_manager = ConnectionManager::new();
        let server = Server::builder()
            .negotiator(negotiator())
            .dialer(dialer())
            .stats(Arc::new(TestStatsCollector {
                sessions: AtomicU64::new(0),
            }))
            .conn_manager(conn_manager.clone())
            .decoy(Some("example.com:443".to_string()))
            .build();
        conn_manager.register("127.0.0.1:1".parse().unwrap());
        assert_eq!(server.conn_manager.connection_count(), 1);
        assert_eq!(server.decoy.as_deref(), Some("example.com:443"));
    }

    #[test]
    #[should_panic(expected = "dialer is required")]
    fn test_server_builder_requires_dialer() {
        let _ = Server::builder()
            .negotiator(negotiator())
            .stats(Arc::new(TestStatsCollector {
                sessions: AtomicU64::new(0),
            }))
            .build();
    }
}
