//! Configuration module for the MTProto proxy
//!
//! This module handles CLI argument parsing with environment variable support.
//! Everything is local: the proxy secret and the middle-proxy listing are files.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::replay::{EvictionPolicy, ReplayConfig};
use crate::core::secret::{Secret, SecretMode};
use crate::logger::LogLevel;
use crate::transport::middle::AD_TAG_LEN;
use crate::transport::DatacenterTable;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    // Try parsing as humantime duration first (e.g., "60s", "2m", "1h30m")
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    // Plain seconds
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Parse a `<dc>=<ip:port>` datacenter override
fn parse_dc_override(s: &str) -> Result<(i16, SocketAddr), String> {
    let (dc, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid datacenter override '{}', expected <dc>=<ip:port>", s))?;
    let dc = dc
        .trim()
        .parse::<i16>()
        .map_err(|_| format!("Invalid datacenter id '{}'", dc))?;
    let addr = addr
        .trim()
        .parse::<SocketAddr>()
        .map_err(|_| format!("Invalid datacenter address '{}'", addr))?;
    Ok((dc, addr))
}

/// Parse the 16-byte ad tag from hex
fn parse_ad_tag(s: &str) -> Result<[u8; AD_TAG_LEN], String> {
    let bytes = hex::decode(s.trim()).map_err(|e| format!("ad tag is not valid hex: {}", e))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("ad tag must be {} bytes, got {}", AD_TAG_LEN, b.len()))
}

/// CLI arguments for the MTProto proxy
///
/// Supports environment variables with MTPROXY_ prefix
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "MTProto proxy with obfuscated2, fake TLS and middle-proxy support"
)]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Listen address
    #[arg(long, env = "MTPROXY_LISTEN", default_value = "0.0.0.0:443")]
    pub listen: SocketAddr,

    /// Client secret: 32 hex chars, `dd` + 32 hex chars, or `ee` + 32 hex chars + hex(hostname)
    #[arg(long, env = "MTPROXY_SECRET", value_parser = str::parse::<Secret>)]
    pub secret: Secret,

    /// Advertising tag from @MTProxybot; enables middle-proxy mode
    #[arg(long, env = "MTPROXY_AD_TAG", value_parser = parse_ad_tag)]
    pub ad_tag: Option<[u8; AD_TAG_LEN]>,

    /// Middle-proxy shared secret file (getProxySecret), required with --ad_tag
    #[arg(long, env = "MTPROXY_PROXY_SECRET_FILE")]
    pub proxy_secret_file: Option<PathBuf>,

    /// Middle-proxy listing in getProxyConfig format (default: compiled-in list)
    #[arg(long, env = "MTPROXY_MIDDLE_PROXY_CONFIG")]
    pub middle_proxy_config: Option<PathBuf>,

    /// How often the middle-proxy listing is re-read (default: 1h)
    #[arg(
        long,
        env = "MTPROXY_MIDDLE_PROXY_REFRESH",
        default_value = "1h",
        value_parser = parse_duration
    )]
    pub middle_proxy_refresh: Duration,

    /// Datacenter endpoint override, `<dc>=<ip:port>`, repeatable
    #[arg(long = "dc", env = "MTPROXY_DC", value_delimiter = ',', value_parser = parse_dc_override)]
    pub dc_overrides: Vec<(i16, SocketAddr)>,

    /// Datacenter used for unknown ids (default: 2)
    #[arg(long, env = "MTPROXY_DEFAULT_DC", default_value_t = 2)]
    pub default_dc: i16,

    /// Where non-matching TLS traffic is forwarded (default: <secret host>:443, empty disables)
    #[arg(long, env = "MTPROXY_TLS_DECOY")]
    pub tls_decoy: Option<String>,

    /// Accepted ClientHello timestamp skew (default: 5m)
    #[arg(long, env = "MTPROXY_TLS_TIME_SKEW", default_value = "5m", value_parser = parse_duration)]
    pub tls_time_skew: Duration,

    /// SNTP server for the middle-proxy clock check
    #[arg(long, env = "MTPROXY_NTP_SERVER", default_value = "pool.ntp.org:123")]
    pub ntp_server: String,

    /// Largest tolerated clock drift in middle-proxy mode (default: 1s)
    #[arg(
        long,
        env = "MTPROXY_MAX_CLOCK_DRIFT",
        default_value = "1s",
        value_parser = parse_duration
    )]
    pub max_clock_drift: Duration,

    /// How often the clock is re-checked in middle-proxy mode (default: 10m)
    #[arg(
        long,
        env = "MTPROXY_CLOCK_CHECK_INTERVAL",
        default_value = "10m",
        value_parser = parse_duration
    )]
    pub clock_check_interval: Duration,

    /// Interval for logging session statistics (default: 60s)
    #[arg(
        long,
        env = "MTPROXY_STATS_INTERVAL",
        default_value = "60s",
        value_parser = parse_duration
    )]
    pub stats_interval: Duration,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "MTPROXY_LOG_MODE", default_value = "info")]
    pub log_mode: LogLevel,

    // ==================== Public address ====================
    /// Public IPv4 address (default: detected)
    #[arg(long, env = "MTPROXY_PUBLIC_IPV4", help_heading = "Public address")]
    pub public_ipv4: Option<Ipv4Addr>,

    /// Public IPv6 address (default: detected)
    #[arg(long, env = "MTPROXY_PUBLIC_IPV6", help_heading = "Public address")]
    pub public_ipv6: Option<Ipv6Addr>,

    /// Port advertised in proxy links (default: listen port)
    #[arg(long, env = "MTPROXY_PUBLIC_PORT", help_heading = "Public address")]
    pub public_port: Option<u16>,

    /// Plain-text ip echo service used for detection, empty disables it
    #[arg(
        long,
        env = "MTPROXY_PUBLIC_IP_LOOKUP",
        default_value = "https://ifconfig.co/ip",
        help_heading = "Public address"
    )]
    pub public_ip_lookup: String,

    // ==================== Anti-replay ====================
    /// Remembered handshake fingerprints (default: 100000)
    #[arg(
        long,
        env = "MTPROXY_REPLAY_CAPACITY",
        default_value_t = 100_000,
        help_heading = "Anti-replay"
    )]
    pub replay_capacity: usize,

    /// Retention window for fingerprints (default: 10m)
    #[arg(
        long,
        env = "MTPROXY_REPLAY_WINDOW",
        default_value = "10m",
        value_parser = parse_duration,
        help_heading = "Anti-replay"
    )]
    pub replay_window: Duration,

    /// Eviction policy: lru or ttl (default: ttl)
    #[arg(long, env = "MTPROXY_REPLAY_POLICY", default_value = "ttl", help_heading = "Anti-replay")]
    pub replay_policy: EvictionPolicy,

    // ==================== Performance Tuning ====================
    /// Connection idle timeout - disconnect if no data transferred (default: 5m)
    #[arg(
        long,
        env = "MTPROXY_CONN_IDLE_TIMEOUT",
        default_value = "5m",
        value_parser = parse_duration,
        help_heading = "Performance"
    )]
    pub conn_idle_timeout: Duration,

    /// TCP connect timeout to datacenters and middle proxies (default: 10s)
    #[arg(
        long,
        env = "MTPROXY_CONNECT_TIMEOUT",
        default_value = "10s",
        value_parser = parse_duration,
        help_heading = "Performance"
    )]
    pub connect_timeout: Duration,

    /// Timeout for the client handshake (default: 10s)
    #[arg(
        long,
        env = "MTPROXY_HANDSHAKE_TIMEOUT",
        default_value = "10s",
        value_parser = parse_duration,
        help_heading = "Performance"
    )]
    pub handshake_timeout: Duration,

    /// Buffer size for data transfer in bytes (default: 32KB)
    #[arg(
        long,
        env = "MTPROXY_BUFFER_SIZE",
        default_value_t = 32 * 1024,
        help_heading = "Performance"
    )]
    pub buffer_size: usize,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(
        long,
        env = "MTPROXY_TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY for lower latency (default: true)
    #[arg(
        long,
        env = "MTPROXY_TCP_NODELAY",
        default_value_t = true,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,

    /// Concurrent session cap, 0 = unlimited (default: 0)
    #[arg(
        long,
        env = "MTPROXY_MAX_CONNECTIONS",
        default_value_t = 0,
        help_heading = "Performance"
    )]
    pub max_connections: usize,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if self.ad_tag.is_some() {
            match self.proxy_secret_file {
                None => return Err(anyhow!("--proxy_secret_file is required in middle-proxy mode")),
                Some(ref path) if !path.exists() => {
                    return Err(anyhow!("Proxy secret file not found: {}", path.display()))
                }
                Some(_) => {}
            }
            if self.max_clock_drift.is_zero() {
                return Err(anyhow!("max_clock_drift must be greater than 0"));
            }
            if self.clock_check_interval.is_zero() {
                return Err(anyhow!("clock_check_interval must be greater than 0"));
            }
        }
        if let Some(ref path) = self.middle_proxy_config {
            if !path.exists() {
                return Err(anyhow!("Middle proxy config not found: {}", path.display()));
            }
        }

        // Validate intervals and limits
        if self.stats_interval.is_zero() {
            return Err(anyhow!("stats_interval must be greater than 0"));
        }
        if self.middle_proxy_refresh.is_zero() {
            return Err(anyhow!("middle_proxy_refresh must be greater than 0"));
        }
        if self.handshake_timeout.is_zero()
            || self.connect_timeout.is_zero()
            || self.conn_idle_timeout.is_zero()
        {
            return Err(anyhow!("timeouts must be greater than 0"));
        }
        if self.replay_capacity == 0 {
            return Err(anyhow!("replay_capacity must be greater than 0"));
        }
        if self.replay_policy == EvictionPolicy::Ttl && self.replay_window.is_zero() {
            return Err(anyhow!("replay_window must be greater than 0 with the ttl policy"));
        }
        if self.buffer_size == 0 {
            return Err(anyhow!("buffer_size must be greater than 0"));
        }

        Ok(())
    }
}

/// Connection performance configuration
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// Connection idle timeout
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Client handshake timeout
    pub handshake_timeout: Duration,
    /// Buffer size for data transfer
    pub buffer_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
    /// Concurrent session cap, 0 = unlimited
    pub max_connections: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            buffer_size: 32 * 1024,
            tcp_backlog: 1024,
            tcp_nodelay: true,
            max_connections: 0,
        }
    }
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            idle_timeout: cli.conn_idle_timeout,
            connect_timeout: cli.connect_timeout,
            handshake_timeout: cli.handshake_timeout,
            buffer_size: cli.buffer_size,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
            max_connections: cli.max_connections,
        }
    }
}

/// Middle-proxy settings, present only in middle-proxy mode
#[derive(Debug, Clone)]
pub struct MiddleConfig {
    pub ad_tag: [u8; AD_TAG_LEN],
    pub proxy_secret: Vec<u8>,
    pub proxy_config: Option<PathBuf>,
    pub refresh_interval: Duration,
    pub ntp_server: String,
    pub max_clock_drift: Duration,
    pub clock_check_interval: Duration,
}

/// Public address settings
#[derive(Debug, Clone, Default)]
pub struct PublicConfig {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    /// Advertised port, the listen port when unset
    pub port: Option<u16>,
    /// Detection service, `None` disables detection
    pub lookup: Option<String>,
}

/// Runtime server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub secret: Secret,
    pub middle: Option<MiddleConfig>,
    pub public: PublicConfig,
    pub datacenters: DatacenterTable,
    /// Fallback target for non-matching TLS traffic
    pub decoy: Option<String>,
    pub tls_time_skew: Duration,
    pub replay: ReplayConfig,
    pub stats_interval: Duration,
    pub conn: ConnConfig,
}

impl ServerConfig {
    /// Build the runtime view, reading the proxy secret file in middle-proxy mode
    pub fn from_cli(cli: &CliArgs) -> Result<Self> {
        let middle = match cli.ad_tag {
            Some(ad_tag) => {
                let path = cli
                    .proxy_secret_file
                    .as_ref()
                    .ok_or_else(|| {
                        anyhow!("--proxy_secret_file is required in middle-proxy mode")
                    })?;
                let proxy_secret = std::fs::read(path)
                    .with_context(|| format!("Failed to read proxy secret {}", path.display()))?;
                if proxy_secret.len() < 32 {
                    return Err(anyhow!("Proxy secret {} is too short", path.display()));
                }
                Some(MiddleConfig {
                    ad_tag,
                    proxy_secret,
                    proxy_config: cli.middle_proxy_config.clone(),
                    refresh_interval: cli.middle_proxy_refresh,
                    ntp_server: cli.ntp_server.clone(),
                    max_clock_drift: cli.max_clock_drift,
                    clock_check_interval: cli.clock_check_interval,
                })
            }
            None => None,
        };

        let datacenters = cli
            .dc_overrides
            .iter()
            .fold(DatacenterTable::builtin().with_default_dc(cli.default_dc), |table, (dc, addr)| {
                table.with_override(*dc, *addr)
            });

        Ok(Self {
            listen: cli.listen,
            secret: cli.secret.clone(),
            middle,
            public: PublicConfig {
                ipv4: cli.public_ipv4,
                ipv6: cli.public_ipv6,
                port: cli.public_port,
                lookup: Some(cli.public_ip_lookup.trim())
                    .filter(|url| !url.is_empty())
                    .map(str::to_string),
            },
            datacenters,
            decoy: decoy_target(&cli.secret, cli.tls_decoy.as_deref()),
            tls_time_skew: cli.tls_time_skew,
            replay: ReplayConfig {
                capacity: cli.replay_capacity,
                window: cli.replay_window,
                policy: cli.replay_policy,
            },
            stats_interval: cli.stats_interval,
            conn: ConnConfig::from_cli(cli),
        })
    }

    pub fn is_middle(&self) -> bool {
        self.middle.is_some()
    }

    /// Port clients are told to connect to
    pub fn public_port(&self) -> u16 {
        self.public.port.unwrap_or(self.listen.port())
    }
}

/// Decoy only applies to fake TLS; an explicit empty value disables it
fn decoy_target(secret: &Secret, configured: Option<&str>) -> Option<String> {
    if secret.mode != SecretMode::Tls {
        return None;
    }
    match configured {
        Some("") => None,
        Some(target) => Some(target.to_string()),
        None => secret.tls_host.as_ref().map(|host| format!("{}:443", host)),
    }
}
