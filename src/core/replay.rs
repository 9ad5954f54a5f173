//! Anti-replay guard
//!
//! Remembers handshake fingerprints so a captured handshake replayed by an
//! active prober is refused instead of answered.
//!
//! One `parking_lot::Mutex` around an `lru::LruCache` sized to the full
//! capacity. Check-and-insert happens under that lock, so two concurrent
//! admits of the same fingerprint can never both succeed. Entries are never
//! promoted on lookup, which keeps the whole set in insertion order: the
//! entry evicted at capacity is always the oldest one overall.

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// SHA-256 of the fingerprinted handshake bytes
pub type Fingerprint = [u8; 32];

pub fn fingerprint(bytes: &[u8]) -> Fingerprint {
    Sha256::digest(bytes).into()
}

/// Eviction policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Count only: the oldest entry goes once capacity is reached
    Lru,
    /// Entries older than the window are treated as absent and evicted.
    /// Capacity still bounds memory.
    Ttl,
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "ttl" => Ok(EvictionPolicy::Ttl),
            other => Err(format!("unknown replay policy '{}' (expected lru or ttl)", other)),
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionPolicy::Lru => write!(f, "lru"),
            EvictionPolicy::Ttl => write!(f, "ttl"),
        }
    }
}

/// Guard sizing
#[derive(Debug, Clone, Copy)]
pub struct ReplayConfig {
    /// Hard limit on remembered fingerprints
    pub capacity: usize,
    /// Retention window, used by the ttl policy
    pub window: Duration,
    pub policy: EvictionPolicy,
}

/// Set of recently seen handshake fingerprints
pub struct ReplayGuard {
    seen: Mutex<LruCache<Fingerprint, Instant>>,
    window: Option<Duration>,
}

impl ReplayGuard {
    pub fn new(config: ReplayConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        let window = match config.policy {
            EvictionPolicy::Lru => None,
            EvictionPolicy::Ttl => Some(config.window),
        };

        Self {
            seen: Mutex::new(LruCache::new(capacity)),
            window,
        }
    }

    /// Record `fp` and return true on first sight, false on a repeat
    pub fn admit(&self, fp: Fingerprint) -> bool {
        let mut cache = self.seen.lock();
        let now = Instant::now();

        if let Some(window) = self.window {
            while let Some(seen) = cache.peek_lru().map(|(_, t)| *t) {
                if now.duration_since(seen) < window {
                    break;
                }
                cache.pop_lru();
            }
        }

        if cache.contains(&fp) {
            return false;
        }
        cache.put(fp, now);
        true
    }

    /// Number of remembered fingerprints
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.seen.lock().cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    fn config(capacity: usize, policy: EvictionPolicy) -> ReplayConfig {
        ReplayConfig {
            capacity,
            window: Duration::from_secs(3600),
            policy,
        }
    }

    fn fp(n: u32) -> Fingerprint {
        fingerprint(&n.to_le_bytes())
    }

    #[test]
    fn test_admit_once() {
        let guard = ReplayGuard::new(config(100, EvictionPolicy::Ttl));
        assert!(guard.admit(fp(1)));
        assert!(!guard.admit(fp(1)));
        assert!(guard.admit(fp(2)));
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn test_capacity_is_hard_bound() {
        for policy in [EvictionPolicy::Lru, EvictionPolicy::Ttl] {
            let guard = ReplayGuard::new(config(64, policy));
            for n in 0..1000 {
                guard.admit(fp(n));
                assert!(guard.len() <= 64);
            }
            assert_eq!(guard.capacity(), 64);
        }
    }

    #[test]
    fn test_oldest_evicted_first() {
        let guard = ReplayGuard::new(config(3, EvictionPolicy::Lru));
        assert!(guard.admit(fp(1)));
        assert!(guard.admit(fp(2)));
        assert!(guard.admit(fp(3)));
        // repeat lookup must not refresh fp(1)
        assert!(!guard.admit(fp(1)));
        assert!(guard.admit(fp(4)));

        assert_eq!(guard.len(), 3);
        assert!(guard.admit(fp(1)), "oldest entry should have been evicted");
        assert!(!guard.admit(fp(4)));
    }

    #[test]
    fn test_ttl_expiry() {
        let guard = ReplayGuard::new(ReplayConfig {
            capacity: 16,
            window: Duration::from_millis(50),
            policy: EvictionPolicy::Ttl,
        });
        assert!(guard.admit(fp(7)));
        assert!(!guard.admit(fp(7)));
        std::thread::sleep(Duration::from_millis(80));
        assert!(guard.admit(fp(7)), "expired entry is treated as absent");
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn test_lru_policy_ignores_window() {
        let guard = ReplayGuard::new(ReplayConfig {
            capacity: 16,
            window: Duration::from_millis(1),
            policy: EvictionPolicy::Lru,
        });
        assert!(guard.admit(fp(9)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(!guard.admit(fp(9)));
    }

    #[test]
    fn test_concurrent_same_fingerprint_admitted_once() {
        for _ in 0..50 {
            let guard = Arc::new(ReplayGuard::new(config(1024, EvictionPolicy::Ttl)));
            let admitted = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(8));

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let guard = Arc::clone(&guard);
                    let admitted = Arc::clone(&admitted);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        if guard.admit(fp(42)) {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(admitted.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_one_over_capacity_evicts_only_the_oldest() {
        for policy in [EvictionPolicy::Lru, EvictionPolicy::Ttl] {
            let guard = ReplayGuard::new(config(64, policy));
            for n in 0..65 {
                assert!(guard.admit(fp(n)));
            }
            assert_eq!(guard.len(), 64);

            let readmitted: Vec<u32> = (1..65).filter(|&n| guard.admit(fp(n))).collect();
            assert!(readmitted.is_empty(), "replays admitted: {:?}", readmitted);
            assert!(guard.admit(fp(0)), "oldest entry should have been evicted");
        }
    }

    #[test]
    fn test_capacity_is_exact() {
        for capacity in [1, 3, 100, 1000] {
            let guard = ReplayGuard::new(config(capacity, EvictionPolicy::Lru));
            assert_eq!(guard.capacity(), capacity);
            for n in 0..capacity as u32 {
                guard.admit(fp(n));
            }
            assert_eq!(guard.len(), capacity);
        }
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("LRU".parse::<EvictionPolicy>().unwrap(), EvictionPolicy::Lru);
        assert_eq!("ttl".parse::<EvictionPolicy>().unwrap(), EvictionPolicy::Ttl);
        assert!("fifo".parse::<EvictionPolicy>().is_err());
    }
}
