//! Business logic implementations
//!
//! This module contains the process-level services around the core proxy:
//! - Statistics collection and periodic reporting
//! - SNTP clock drift checks for middle-proxy mode
//! - Middle-proxy pool refresh
//! - Public address discovery and proxy links

mod links;
mod ntp;
mod pool_refresh;
mod public_addr;
mod stats;

pub use links::{LinkReport, ProxyLinks};
pub use ntp::{check_clock, spawn_clock_watch, SntpProbe};
pub use pool_refresh::{load_pool, spawn_pool_refresh};
pub use public_addr::resolve_public_address;
pub use stats::{spawn_reporter, DatacenterSnapshot, SessionStatsCollector, StatsSnapshot};
