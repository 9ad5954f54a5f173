//! Middle-proxy endpoint pool
//!
//! Dialers read an immutable snapshot; a refresh swaps in a new one without
//! disturbing dials already holding the old snapshot.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::logger::log;

/// Compiled-in pool in `getProxyConfig` format
pub const DEFAULT_PROXY_CONFIG: &str = "\
# force_probability 10 10
default 2;
proxy_for 1 149.154.175.50:8888;
proxy_for -1 149.154.175.50:8888;
proxy_for 2 149.154.161.144:8888;
proxy_for -2 149.154.161.144:8888;
proxy_for 3 149.154.175.100:8888;
proxy_for -3 149.154.175.100:8888;
proxy_for 4 91.108.4.136:8888;
proxy_for -4 149.154.165.109:8888;
proxy_for 5 91.108.56.183:8888;
proxy_for -5 91.108.56.183:8888;
";

/// One version of the endpoint table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub endpoints: HashMap<i16, Vec<SocketAddr>>,
    pub default_dc: Option<i16>,
}

impl PoolSnapshot {
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.values().map(Vec::len).sum()
    }

    /// Endpoints for `datacenter`, or for the default datacenter when unknown
    pub fn candidates(&self, datacenter: i16) -> &[SocketAddr] {
        self.endpoints
            .get(&datacenter)
            .or_else(|| self.default_dc.and_then(|dc| self.endpoints.get(&dc)))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Parse a `proxy_for <dc> <ip:port>;` listing
pub fn parse_proxy_config(text: &str) -> Result<PoolSnapshot, String> {
    let mut snapshot = PoolSnapshot::default();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let line = line
            .strip_suffix(';')
            .ok_or_else(|| format!("line {}: missing ';'", lineno + 1))?;
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("proxy_for") => {
                let (Some(dc), Some(addr), None) = (parts.next(), parts.next(), parts.next()) else {
                    return Err(format!("line {}: expected 'proxy_for <dc> <addr>'", lineno + 1));
                };
                let dc: i16 = dc
                    .parse()
                    .map_err(|_| format!("line {}: invalid datacenter '{}'", lineno + 1, dc))?;
                let addr: SocketAddr = addr
                    .parse()
                    .map_err(|_| format!("line {}: invalid address '{}'", lineno + 1, addr))?;
                let list = snapshot.endpoints.entry(dc).or_default();
                if !list.contains(&addr) {
                    list.push(addr);
                }
            }
            Some("default") => {
                let dc = parts.next().and_then(|v| v.parse().ok());
                if dc.is_none() {
                    return Err(format!("line {}: invalid default datacenter", lineno + 1));
                }
                snapshot.default_dc = dc;
            }
            // other directives carry nothing we route on
            _ => {}
        }
    }
    if snapshot.endpoints.is_empty() {
        return Err("no proxy_for entries".to_string());
    }
    Ok(snapshot)
}

/// Shared, refreshable set of middle-proxy endpoints
#[derive(Debug)]
pub struct MiddleProxyPool {
    snapshot: ArcSwap<PoolSnapshot>,
    cursor: AtomicUsize,
}

impl MiddleProxyPool {
    pub fn new(snapshot: PoolSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Pool seeded with the compiled-in endpoints
    pub fn builtin() -> Self {
        match parse_proxy_config(DEFAULT_PROXY_CONFIG) {
            Ok(snapshot) => Self::new(snapshot),
            Err(_) => Self::new(PoolSnapshot::default()),
        }
    }

    pub fn snapshot(&self) -> Arc<PoolSnapshot> {
        self.snapshot.load_full()
    }

    /// Install a new snapshot; in-flight dials keep the one they loaded
    pub fn replace(&self, snapshot: PoolSnapshot) {
        log::info!(
            endpoints = snapshot.endpoint_count(),
            datacenters = snapshot.endpoints.len(),
            "Middle proxy pool updated"
        );
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Next endpoint for `datacenter` in round-robin order, skipping `exclude`
    pub fn select(&self, datacenter: i16, exclude: &[SocketAddr]) -> Option<SocketAddr> {
        let snapshot = self.snapshot.load();
        let candidates = snapshot.candidates(datacenter);
        if candidates.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..candidates.len())
            .map(|i| candidates[(start + i) % candidates.len()])
            .find(|addr| !exclude.contains(addr))
    }
}
