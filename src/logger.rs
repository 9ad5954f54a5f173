use std::net::SocketAddr;
use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level accepted by `--log_mode`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init_logger(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mtproxy_r={}", level.as_str())));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .init();
}

pub mod log {
    use super::SocketAddr;
    use crate::core::hooks::SessionReport;

    pub use tracing::{debug, error, info, warn};

    /// Connection lifecycle event
    pub fn connection(peer: SocketAddr, event: &str) {
        debug!(peer = %peer, event = event, "Connection");
    }

    /// Handshake outcome; failures stay at debug so scanners do not flood the log
    pub fn handshake(peer: SocketAddr, mode: &str, error: Option<&str>) {
        match error {
            Some(err) => debug!(peer = %peer, mode = mode, error = err, "Handshake rejected"),
            None => debug!(peer = %peer, mode = mode, "Handshake accepted"),
        }
    }

    /// Closed session summary
    pub fn session(peer: SocketAddr, report: &SessionReport) {
        debug!(
            peer = %peer,
            disposition = %report.disposition,
            dc = ?report.datacenter,
            up = report.client_to_backend_bytes,
            down = report.backend_to_client_bytes,
            "Session closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!("DEBUG".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!("warn".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::default().as_str(), "info");
    }
}
