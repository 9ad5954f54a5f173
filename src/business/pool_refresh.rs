//! Periodic middle-proxy pool refresh from a `getProxyConfig` file

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::logger::log;
use crate::transport::middle::pool::{parse_proxy_config, PoolSnapshot};
use crate::transport::MiddleProxyPool;

/// Read and parse a proxy config file
pub async fn load_pool(path: &Path) -> Result<PoolSnapshot> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read middle proxy config {}", path.display()))?;
    parse_proxy_config(&text)
        .map_err(|e| anyhow!("Invalid middle proxy config {}: {}", path.display(), e))
}

/// Reload `path` into `pool` every `period` until `shutdown` fires
///
/// A file that fails to load leaves the current snapshot in place.
pub fn spawn_pool_refresh(
    pool: Arc<MiddleProxyPool>,
    path: PathBuf,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The startup load already covered the first tick
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = refresh_once(&pool, &path).await {
                        log::warn!(error = %e, "Failed to refresh middle proxy pool");
                    }
                }
                _ = shutdown.cancelled() => {
                    log::debug!("Pool refresh task shutting down");
                    break;
                }
            }
        }
    })
}

/// Returns whether the pool changed
async fn refresh_once(pool: &MiddleProxyPool, path: &Path) -> Result<bool> {
    let snapshot = load_pool(path).await?;
    if *pool.snapshot() == snapshot {
        log::debug!(path = %path.display(), "Middle proxy pool unchanged");
        return Ok(false);
    }
    pool.replace(snapshot);
    Ok(true)
}
