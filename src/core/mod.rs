//! Core proxy server module
//!
//! This module contains the core proxy functionality:
//! - Handshake negotiation (obfuscated2, fake TLS) and anti-replay
//! - Keystream ciphers and client framing
//! - Connection management
//! - Bidirectional relay
//! - Hook traits for extensibility

pub mod cipher;
mod connection;
pub mod faketls;
pub mod framing;
pub mod hooks;
pub mod negotiator;
pub mod obfuscated2;
pub mod relay;
pub mod replay;
pub mod secret;
mod server;

pub use cipher::{CipherPair, CipherStream, KeystreamCipher};
pub use connection::{ConnectionId, ConnectionManager};
pub use hooks::{ClockProbe, Disposition, SessionReport, StatsCollector};
pub use negotiator::{Negotiated, Negotiator, Rejection};
pub use obfuscated2::{HandshakeHeader, WrappedProtocol};
pub use relay::{relay_bidirectional, RelayEnd, SessionTraffic, TrafficSnapshot};
pub use replay::{EvictionPolicy, ReplayConfig, ReplayGuard};
pub use secret::{Secret, SecretMode};
pub use server::{Server, ServerBuilder};
