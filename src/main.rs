//! MTProto relay proxy
//!
//! Architecture:
//! - `core/`: Handshake negotiation, ciphers, anti-replay and relay
//! - `transport/`: Backend dialers (direct datacenter, middle proxy)
//! - `business/`: Stats reporting, clock checks, pool refresh, public address
//! - `handler`: Connection processing logic
//! - `server_runner`: Server startup and accept loop

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use mtproxy_r::business::{self, LinkReport, SessionStatsCollector, SntpProbe};
use mtproxy_r::config::{CliArgs, MiddleConfig, ServerConfig};
use mtproxy_r::core::{ConnectionManager, Negotiator, ReplayGuard, Server, StatsCollector};
use mtproxy_r::logger::{self, log};
use mtproxy_r::server_runner;
use mtproxy_r::transport::{
    BackendDialer, DirectDialer, MiddleDialer, MiddleProxyPool, PublicAddress,
};

/// SNTP query timeout for clock checks
const CLOCK_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for each public address lookup
const PUBLIC_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = CliArgs::parse_args();
    cli.validate()?;

    // Initialize logger
    logger::init_logger(cli.log_mode);

    let server_config = ServerConfig::from_cli(&cli)?;
    log::info!(
        listen = %server_config.listen,
        mode = %server_config.secret.mode,
        middle_proxy = server_config.is_middle(),
        "Starting MTProto proxy"
    );

    let public =
        business::resolve_public_address(&server_config.public, PUBLIC_LOOKUP_TIMEOUT).await;
    if public.is_empty() {
        log::warn!("No public address known, proxy links not printed");
    } else {
        log::info!(ipv4 = ?public.ipv4, ipv6 = ?public.ipv6, "Public address");
        let links = LinkReport::new(&server_config.secret, &public, server_config.public_port());
        println!("{}", links.to_json()?);
    }

    // Root token: cancels the accept loop, sessions and background tasks
    let shutdown = CancellationToken::new();
    let conn_manager = ConnectionManager::with_shutdown(shutdown.child_token());

    let replay = Arc::new(ReplayGuard::new(server_config.replay));
    log::info!(
        capacity = server_config.replay.capacity,
        window = ?server_config.replay.window,
        policy = %server_config.replay.policy,
        "Anti-replay guard ready"
    );
    let negotiator = Negotiator::new(
        server_config.secret.clone(),
        replay,
        server_config.tls_time_skew,
    );

    let dialer = match server_config.middle {
        Some(ref middle) => build_middle_dialer(&server_config, middle, public, &shutdown).await?,
        None => BackendDialer::Direct(DirectDialer::new(
            server_config.datacenters.clone(),
            server_config.conn.connect_timeout,
            server_config.conn.tcp_nodelay,
        )),
    };

    // Reporter outlives the listener so draining sessions are still counted
    let stats_collector = Arc::new(SessionStatsCollector::new());
    let stop_reporter = CancellationToken::new();
    let reporter = business::spawn_reporter(
        Arc::clone(&stats_collector),
        server_config.stats_interval,
        stop_reporter.clone(),
    );

    // Build server using the builder pattern
    let server = Arc::new(
        Server::builder()
            .negotiator(negotiator)
            .dialer(dialer)
            .stats(Arc::clone(&stats_collector) as Arc<dyn StatsCollector>)
            .conn_manager(conn_manager.clone())
            .conn_config(server_config.conn)
            .decoy(server_config.decoy.clone())
            .build(),
    );

    // Setup shutdown handler
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown_signal.cancel();
    });

    // Run server
    server_runner::run_server(Arc::clone(&server), server_config.listen, shutdown.clone()).await?;

    // Listener is gone; close whatever sessions are left
    conn_manager.shutdown();
    wait_for_sessions(&conn_manager, Duration::from_secs(5)).await;

    stop_reporter.cancel();
    if tokio::time::timeout(Duration::from_secs(5), reporter).await.is_err() {
        log::warn!("Stats reporter shutdown timeout");
    }
    log::info!("Server stopped");
    Ok(())
}

/// Clock checks, pool setup and refresh for middle-proxy mode
async fn build_middle_dialer(
    server_config: &ServerConfig,
    middle: &MiddleConfig,
    public: PublicAddress,
    shutdown: &CancellationToken,
) -> Result<BackendDialer> {
    let probe = Arc::new(SntpProbe::new(middle.ntp_server.clone(), CLOCK_CHECK_TIMEOUT));
    let drift = business::check_clock(probe.as_ref(), middle.max_clock_drift).await?;
    log::info!(server = %middle.ntp_server, drift = ?drift, "Clock drift within tolerance");
    business::spawn_clock_watch(
        probe,
        middle.max_clock_drift,
        middle.clock_check_interval,
        shutdown.clone(),
    );

    let pool = match middle.proxy_config {
        Some(ref path) => {
            let pool = Arc::new(MiddleProxyPool::new(business::load_pool(path).await?));
            business::spawn_pool_refresh(
                Arc::clone(&pool),
                path.clone(),
                middle.refresh_interval,
                shutdown.clone(),
            );
            pool
        }
        None => Arc::new(MiddleProxyPool::builtin()),
    };
    log::info!(
        endpoints = pool.snapshot().endpoint_count(),
        "Middle proxy pool loaded"
    );

    let dialer = MiddleDialer::new(
        pool,
        middle.proxy_secret.clone(),
        middle.ad_tag,
        server_config.conn.connect_timeout,
        server_config.conn.tcp_nodelay,
    )
    .with_public_address(public);
    Ok(BackendDialer::Middle(dialer))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigint, mut sigterm) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            _ => {
                log::warn!("Failed to install signal handlers, falling back to ctrl-c");
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down...");
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Shutdown signal received...");
    }
}

async fn wait_for_sessions(conn_manager: &ConnectionManager, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    while conn_manager.connection_count() > 0 {
        if tokio::time::Instant::now() >= deadline {
            let oldest = conn_manager.oldest();
            log::warn!(
                remaining = conn_manager.connection_count(),
                oldest_peer = ?oldest.map(|(peer, _)| peer),
                oldest_age = ?oldest.map(|(_, age)| age),
                "Sessions still open at shutdown"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
