//! Proxy secret parsing
//!
//! The secret's hex prefix selects the handshake style:
//! - 32 hex chars: simple obfuscated2
//! - `dd` + 32 hex chars: secure (padded intermediate only)
//! - `ee` + 32 hex chars + hex(hostname): fake TLS

use std::fmt;
use std::str::FromStr;

/// Length of the raw secret key in bytes
pub const SECRET_LEN: usize = 16;

/// Handshake style, fixed at configuration time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretMode {
    Simple,
    Secure,
    Tls,
}

impl fmt::Display for SecretMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretMode::Simple => write!(f, "simple"),
            SecretMode::Secure => write!(f, "secure"),
            SecretMode::Tls => write!(f, "tls"),
        }
    }
}

/// Parsed proxy secret
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    /// Raw 16-byte key mixed into every handshake
    pub key: [u8; SECRET_LEN],
    /// Handshake style
    pub mode: SecretMode,
    /// Fronting hostname, only set in TLS mode
    pub tls_host: Option<String>,
}

impl Secret {
    /// Build a simple-mode secret from raw key bytes
    pub fn simple(key: [u8; SECRET_LEN]) -> Self {
        Self {
            key,
            mode: SecretMode::Simple,
            tls_host: None,
        }
    }

    /// Build a secure-mode secret from raw key bytes
    pub fn secure(key: [u8; SECRET_LEN]) -> Self {
        Self {
            key,
            mode: SecretMode::Secure,
            tls_host: None,
        }
    }

    /// Build a TLS-mode secret from raw key bytes and a fronting hostname
    pub fn tls(key: [u8; SECRET_LEN], host: impl Into<String>) -> Self {
        Self {
            key,
            mode: SecretMode::Tls,
            tls_host: Some(host.into()),
        }
    }

    /// Hex form as handed out to clients
    pub fn to_hex(&self) -> String {
        match self.mode {
            SecretMode::Simple => hex::encode(self.key),
            SecretMode::Secure => format!("dd{}", hex::encode(self.key)),
            SecretMode::Tls => format!(
                "ee{}{}",
                hex::encode(self.key),
                hex::encode(self.tls_host.as_deref().unwrap_or_default())
            ),
        }
    }
}

// Keep key material out of logs
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("mode", &self.mode)
            .field("tls_host", &self.tls_host)
            .finish_non_exhaustive()
    }
}

impl FromStr for Secret {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| format!("secret is not valid hex: {}", e))?;

        let (mode, rest) = match bytes.first() {
            Some(0xdd) if bytes.len() == SECRET_LEN + 1 => (SecretMode::Secure, &bytes[1..]),
            Some(0xee) if bytes.len() > SECRET_LEN + 1 => (SecretMode::Tls, &bytes[1..]),
            _ if bytes.len() == SECRET_LEN => (SecretMode::Simple, &bytes[..]),
            _ => {
                return Err(format!(
                    "secret has unsupported length {} (expected 16, dd+16 or ee+16+host)",
                    bytes.len()
                ))
            }
        };

        let mut key = [0u8; SECRET_LEN];
        key.copy_from_slice(&rest[..SECRET_LEN]);

        let tls_host = if mode == SecretMode::Tls {
            let host = std::str::from_utf8(&rest[SECRET_LEN..])
                .map_err(|_| "TLS secret hostname is not valid UTF-8".to_string())?;
            if host.is_empty() {
                return Err("TLS secret hostname is empty".to_string());
            }
            Some(host.to_string())
        } else {
            None
        };

        Ok(Self {
            key,
            mode,
            tls_host,
        })
    }
}
