//! MTProto relay proxy with a layered architecture
//!
//! Architecture:
//! - `core/`: handshake negotiation, ciphers, anti-replay guard, relay and hook traits
//! - `transport/`: backend dialers (direct datacenter, middle proxy RPC)
//! - `business/`: statistics, clock drift check, middle-proxy pool refresh
//! - `handler`: per-connection session state machine
//! - `server_runner`: listener setup and accept loop

pub mod business;
pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod logger;
pub mod server_runner;
pub mod transport;
