//! Hook traits for extensibility
//!
//! Defines the extension points that allow business logic to be injected into the core proxy.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::time::Duration;

use super::relay::TrafficSnapshot;

/// Final state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    Completed,
    RejectedReplay,
    RejectedInvalid,
    DialFailed,
    TimedOut,
}

impl Disposition {
    pub const ALL: [Disposition; 5] = [
        Disposition::Completed,
        Disposition::RejectedReplay,
        Disposition::RejectedInvalid,
        Disposition::DialFailed,
        Disposition::TimedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Completed => "completed",
            Disposition::RejectedReplay => "rejected_replay",
            Disposition::RejectedInvalid => "rejected_invalid",
            Disposition::DialFailed => "dial_failed",
            Disposition::TimedOut => "timed_out",
        }
    }

    /// Dense index, stable across releases
    pub fn index(&self) -> usize {
        match self {
            Disposition::Completed => 0,
            Disposition::RejectedReplay => 1,
            Disposition::RejectedInvalid => 2,
            Disposition::DialFailed => 3,
            Disposition::TimedOut => 4,
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary handed to the statistics sink when a session closes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub disposition: Disposition,
    pub client_to_backend_bytes: u64,
    pub backend_to_client_bytes: u64,
    pub client_to_backend_records: u64,
    pub backend_to_client_records: u64,
    /// Known once the handshake was decoded
    pub datacenter: Option<i16>,
}

impl SessionReport {
    /// Report for a session that never relayed anything
    pub fn empty(disposition: Disposition, datacenter: Option<i16>) -> Self {
        Self::with_traffic(disposition, datacenter, TrafficSnapshot::default())
    }

    pub fn with_traffic(
        disposition: Disposition,
        datacenter: Option<i16>,
        traffic: TrafficSnapshot,
    ) -> Self {
        Self {
            disposition,
            client_to_backend_bytes: traffic.client_to_backend_bytes,
            backend_to_client_bytes: traffic.backend_to_client_bytes,
            client_to_backend_records: traffic.client_to_backend_records,
            backend_to_client_records: traffic.backend_to_client_records,
            datacenter,
        }
    }
}

/// Statistics sink, called exactly once per session
pub trait StatsCollector: Send + Sync {
    fn record_session(&self, report: &SessionReport);
}

/// Source of the local clock's offset against a reference clock
#[async_trait]
pub trait ClockProbe: Send + Sync {
    /// Absolute drift of the local clock
    async fn measure_drift(&self) -> io::Result<Duration>;
}
