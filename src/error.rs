use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Client handshake could not be negotiated
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Backend could not be reached
    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    /// Middle-proxy envelope error
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Clock drift precondition failed
    #[error("Clock error: {0}")]
    Clock(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<anyhow::Error> for ProxyError {
    fn from(err: anyhow::Error) -> Self {
        ProxyError::Other(err.to_string())
    }
}

/// Outcome of a failed client negotiation.
///
/// `NotOurs` and `Replayed` are classification results, `Io` and `Timeout`
/// are transport failures. Callers must treat all four identically on the
/// wire (silent close or decoy) and only distinguish them in statistics.
#[derive(Error, Debug)]
pub enum NegotiationError {
    /// Bytes do not carry a valid handshake for our secret
    #[error("not a valid client: {0}")]
    NotOurs(&'static str),

    /// Handshake fingerprint was already admitted
    #[error("replayed handshake")]
    Replayed,

    /// Transport failed while reading the handshake
    #[error("handshake io error: {0}")]
    Io(#[from] io::Error),

    /// Handshake did not complete in time
    #[error("handshake timeout")]
    Timeout,
}

/// Errors produced while opening a backend connection
#[derive(Error, Debug)]
pub enum DialError {
    /// Connect deadline exceeded
    #[error("connect to {addr} timed out")]
    Timeout { addr: SocketAddr },

    /// Socket level failure
    #[error("connect to {addr} failed: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Middle proxy refused our secret, tag or framing
    #[error("middle proxy {addr} rejected envelope: {reason}")]
    EnvelopeRejected { addr: SocketAddr, reason: String },

    /// No usable endpoint left for the datacenter
    #[error("no endpoint for datacenter {0}")]
    NoEndpoint(i16),
}

impl DialError {
    /// Whether a different middle-proxy endpoint may succeed
    pub fn is_envelope_rejected(&self) -> bool {
        matches!(self, DialError::EnvelopeRejected { .. })
    }
}

/// Errors of the middle-proxy RPC envelope codec
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Frame failed decoding: wrong keys, CRC, sequence or structure
    #[error("envelope rejected: {0}")]
    Rejected(&'static str),

    /// IO error on the middle-proxy socket
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<EnvelopeError> for io::Error {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Io(e) => e,
            EnvelopeError::Rejected(reason) => io::Error::new(io::ErrorKind::InvalidData, reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: ProxyError = io_err.into();
        let display = format!("{}", err);
        assert!(display.contains("IO error"));
        assert!(display.contains("file not found"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ProxyError::Config("invalid secret".to_string());
        let display = format!("{}", err);
        assert!(display.contains("Configuration error"));
        assert!(display.contains("invalid secret"));
    }

    #[test]
    fn test_negotiation_error_from() {
        let err: ProxyError = NegotiationError::NotOurs("reserved prefix").into();
        let display = format!("{}", err);
        assert!(display.contains("Negotiation error"));
        assert!(display.contains("reserved prefix"));
    }

    #[test]
    fn test_dial_error_display() {
        let addr: SocketAddr = "127.0.0.1:443".parse().unwrap();
        let err = DialError::Timeout { addr };
        assert_eq!(format!("{}", err), "connect to 127.0.0.1:443 timed out");
        assert!(!err.is_envelope_rejected());
    }

    #[test]
    fn test_envelope_rejected_is_distinct() {
        let addr: SocketAddr = "127.0.0.1:8888".parse().unwrap();
        let err = DialError::EnvelopeRejected {
            addr,
            reason: "handshake refused".to_string(),
        };
        assert!(err.is_envelope_rejected());
        assert!(format!("{}", err).contains("handshake refused"));
    }

    #[test]
    fn test_envelope_error_into_io() {
        let io_err: io::Error = EnvelopeError::Rejected("crc mismatch").into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
        assert!(io_err.to_string().contains("crc mismatch"));
    }

    #[test]
    fn test_from_anyhow_error() {
        let anyhow_err = anyhow::anyhow!("some anyhow error");
        let err: ProxyError = anyhow_err.into();
        assert!(format!("{}", err).contains("some anyhow error"));
    }

    #[test]
    fn test_result_type_alias_error() {
        fn test_fn() -> Result<i32> {
            Err(ProxyError::Other("failed".to_string()))
        }
        assert!(test_fn().is_err());
    }
}
