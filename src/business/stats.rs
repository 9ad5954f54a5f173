//! Session statistics collection implementation

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::hooks::{Disposition, SessionReport, StatsCollector};
use crate::logger::log;

/// Format bytes into human-readable string (KB, MB, GB)
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Per-datacenter traffic counters
#[derive(Debug, Default)]
struct DatacenterStatsData {
    sessions: AtomicU64,
    client_to_backend_bytes: AtomicU64,
    backend_to_client_bytes: AtomicU64,
}

/// Statistics snapshot for one datacenter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatacenterSnapshot {
    pub datacenter: i16,
    pub sessions: u64,
    pub client_to_backend_bytes: u64,
    pub backend_to_client_bytes: u64,
}

/// Aggregated counters over all sessions since the last reset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Indexed by [`Disposition::index`]
    pub dispositions: [u64; Disposition::ALL.len()],
    pub client_to_backend_bytes: u64,
    pub backend_to_client_bytes: u64,
    pub client_to_backend_records: u64,
    pub backend_to_client_records: u64,
    /// Sorted by datacenter id
    pub datacenters: Vec<DatacenterSnapshot>,
}

impl StatsSnapshot {
    pub fn count(&self, disposition: Disposition) -> u64 {
        self.dispositions[disposition.index()]
    }

    pub fn total_sessions(&self) -> u64 {
        self.dispositions.iter().sum()
    }
}

/// Session statistics collector
///
/// Aggregates session reports into process-wide counters. Counters are
/// swapped to zero on reset so writes racing a reset land in the next period.
pub struct SessionStatsCollector {
    dispositions: [AtomicU64; Disposition::ALL.len()],
    client_to_backend_bytes: AtomicU64,
    backend_to_client_bytes: AtomicU64,
    client_to_backend_records: AtomicU64,
    backend_to_client_records: AtomicU64,
    datacenters: Arc<DashMap<i16, DatacenterStatsData>>,
    /// Lock for atomic reset operations
    reset_lock: Mutex<()>,
}

impl Default for SessionStatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStatsCollector {
    pub fn new() -> Self {
        Self {
            dispositions: Default::default(),
            client_to_backend_bytes: AtomicU64::new(0),
            backend_to_client_bytes: AtomicU64::new(0),
            client_to_backend_records: AtomicU64::new(0),
            backend_to_client_records: AtomicU64::new(0),
            datacenters: Arc::new(DashMap::new()),
            reset_lock: Mutex::new(()),
        }
    }

    /// Current counters, leaving them in place
    pub fn snapshot(&self) -> StatsSnapshot {
        self.collect(|counter| counter.load(Ordering::Acquire))
    }

    /// Reset all counters and return what they held
    pub fn reset_all(&self) -> StatsSnapshot {
        let _guard = self.reset_lock.lock();
        let snapshot = self.collect(|counter| counter.swap(0, Ordering::AcqRel));

        // Drop idle datacenters to prevent unbounded growth
        self.datacenters
            .retain(|_, data| data.sessions.load(Ordering::Relaxed) > 0);

        snapshot
    }

    fn collect(&self, read: impl Fn(&AtomicU64) -> u64) -> StatsSnapshot {
        let mut dispositions = [0u64; Disposition::ALL.len()];
        for (slot, counter) in dispositions.iter_mut().zip(self.dispositions.iter()) {
            *slot = read(counter);
        }

        // Collect keys first to avoid holding iterator during swaps
        let mut keys: Vec<i16> = self.datacenters.iter().map(|entry| *entry.key()).collect();
        keys.sort_unstable();

        let mut datacenters = Vec::with_capacity(keys.len());
        for datacenter in keys {
            if let Some(entry) = self.datacenters.get(&datacenter) {
                let data = entry.value();
                let snapshot = DatacenterSnapshot {
                    datacenter,
                    sessions: read(&data.sessions),
                    client_to_backend_bytes: read(&data.client_to_backend_bytes),
                    backend_to_client_bytes: read(&data.backend_to_client_bytes),
                };
                if snapshot.sessions > 0 {
                    datacenters.push(snapshot);
                }
            }
        }

        StatsSnapshot {
            dispositions,
            client_to_backend_bytes: read(&self.client_to_backend_bytes),
            backend_to_client_bytes: read(&self.backend_to_client_bytes),
            client_to_backend_records: read(&self.client_to_backend_records),
            backend_to_client_records: read(&self.backend_to_client_records),
            datacenters,
        }
    }
}

impl StatsCollector for SessionStatsCollector {
    fn record_session(&self, report: &SessionReport) {
        self.client_to_backend_bytes
            .fetch_add(report.client_to_backend_bytes, Ordering::Relaxed);
        self.backend_to_client_bytes
            .fetch_add(report.backend_to_client_bytes, Ordering::Relaxed);
        self.client_to_backend_records
            .fetch_add(report.client_to_backend_records, Ordering::Relaxed);
        self.backend_to_client_records
            .fetch_add(report.backend_to_client_records, Ordering::Relaxed);

        if let Some(datacenter) = report.datacenter {
            let entry = self.datacenters.entry(datacenter).or_default();
            entry
                .client_to_backend_bytes
                .fetch_add(report.client_to_backend_bytes, Ordering::Relaxed);
            entry
                .backend_to_client_bytes
                .fetch_add(report.backend_to_client_bytes, Ordering::Relaxed);
            entry.sessions.fetch_add(1, Ordering::Relaxed);
        }
        // Counted last so a reader seeing the session also sees its bytes
        self.dispositions[report.disposition.index()].fetch_add(1, Ordering::Release);
    }
}

/// Log and reset the counters every `period` until `shutdown` fires
pub fn spawn_reporter(
    collector: Arc<SessionStatsCollector>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => report_once(&collector),
                _ = shutdown.cancelled() => {
                    log::debug!("Stats reporter shutting down");
                    // Final report before shutdown
                    report_once(&collector);
                    break;
                }
            }
        }
    })
}

fn report_once(collector: &SessionStatsCollector) {
    let snapshot = collector.reset_all();
    if snapshot.total_sessions() == 0 {
        return;
    }

    log::info!(
        sessions = snapshot.total_sessions(),
        completed = snapshot.count(Disposition::Completed),
        rejected_replay = snapshot.count(Disposition::RejectedReplay),
        rejected_invalid = snapshot.count(Disposition::RejectedInvalid),
        dial_failed = snapshot.count(Disposition::DialFailed),
        timed_out = snapshot.count(Disposition::TimedOut),
        upload = %format_bytes(snapshot.client_to_backend_bytes),
        download = %format_bytes(snapshot.backend_to_client_bytes),
        "Sessions reported"
    );
    for dc in &snapshot.datacenters {
        log::debug!(
            dc = dc.datacenter,
            sessions = dc.sessions,
            upload = %format_bytes(dc.client_to_backend_bytes),
            download = %format_bytes(dc.backend_to_client_bytes),
            "Datacenter traffic"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TrafficSnapshot;
    use std::thread;

    fn report(
        disposition: Disposition,
        datacenter: Option<i16>,
        up: u64,
        down: u64,
    ) -> SessionReport {
        SessionReport::with_traffic(
            disposition,
            datacenter,
            TrafficSnapshot {
                client_to_backend_bytes: up,
                backend_to_client_bytes: down,
                client_to_backend_records: 1,
                backend_to_client_records: 1,
            },
        )
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.00KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00MB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00GB");
    }

    #[test]
    fn test_disposition_counts() {
        let collector = SessionStatsCollector::new();
        collector.record_session(&report(Disposition::Completed, Some(2), 100, 200));
        collector.record_session(&report(Disposition::Completed, Some(2), 10, 20));
        collector.record_session(&SessionReport::empty(Disposition::RejectedReplay, None));
        collector.record_session(&SessionReport::empty(Disposition::DialFailed, Some(4)));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total_sessions(), 4);
        assert_eq!(snapshot.count(Disposition::Completed), 2);
        assert_eq!(snapshot.count(Disposition::RejectedReplay), 1);
        assert_eq!(snapshot.count(Disposition::DialFailed), 1);
        assert_eq!(snapshot.count(Disposition::TimedOut), 0);
        assert_eq!(snapshot.client_to_backend_bytes, 110);
        assert_eq!(snapshot.backend_to_client_bytes, 220);
        assert_eq!(snapshot.client_to_backend_records, 2);

        assert_eq!(
            snapshot.datacenters,
            vec![
                DatacenterSnapshot {
                    datacenter: 2,
                    sessions: 2,
                    client_to_backend_bytes: 110,
                    backend_to_client_bytes: 220,
                },
                DatacenterSnapshot {
                    datacenter: 4,
                    sessions: 1,
                    client_to_backend_bytes: 0,
                    backend_to_client_bytes: 0,
                },
            ]
        );
    }

    #[test]
    fn test_snapshot_does_not_reset() {
        let collector = SessionStatsCollector::new();
        collector.record_session(&report(Disposition::Completed, Some(1), 1, 1));
        assert_eq!(collector.snapshot().total_sessions(), 1);
        assert_eq!(collector.snapshot().total_sessions(), 1);
    }

    #[test]
    fn test_reset_all() {
        let collector = SessionStatsCollector::new();
        collector.record_session(&report(Disposition::Completed, Some(1), 5, 6));
        collector.record_session(&report(Disposition::TimedOut, Some(3), 7, 8));
        assert_eq!(collector.datacenters.len(), 2);

        let first = collector.reset_all();
        assert_eq!(first.total_sessions(), 2);
        assert_eq!(first.client_to_backend_bytes, 12);

        let second = collector.reset_all();
        assert_eq!(second, StatsSnapshot::default());
        assert_eq!(collector.datacenters.len(), 0);
    }

    #[test]
    fn test_concurrent_record_and_reset() {
        let collector = Arc::new(SessionStatsCollector::new());
        let mut handles = vec![];

        for i in 0..4 {
            let collector = Arc::clone(&collector);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    collector.record_session(&report(Disposition::Completed, Some(i), 1, 2));
                }
            }));
        }

        let mut sessions = 0;
        let mut uploaded = 0;
        for _ in 0..10 {
            let snapshot = collector.reset_all();
            sessions += snapshot.total_sessions();
            uploaded += snapshot.client_to_backend_bytes;
            thread::yield_now();
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let remaining = collector.reset_all();
        sessions += remaining.total_sessions();
        uploaded += remaining.client_to_backend_bytes;

        assert_eq!(sessions, 4000);
        assert_eq!(uploaded, 4000);
    }

    #[tokio::test]
    async fn test_reporter_final_flush_on_shutdown() {
        let collector = Arc::new(SessionStatsCollector::new());
        collector.record_session(&report(Disposition::Completed, Some(2), 1, 1));

        let shutdown = CancellationToken::new();
        let handle = spawn_reporter(
            Arc::clone(&collector),
            Duration::from_secs(3600),
            shutdown.clone(),
        );
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(collector.snapshot().total_sessions(), 0);
    }
}
