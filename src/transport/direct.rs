//! Direct datacenter dialer
//!
//! Maps a datacenter id to a fixed endpoint and opens an obfuscated2
//! connection to it, acting as an ordinary client toward the datacenter.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::{connect_with_timeout, Route};
use crate::core::cipher::CipherStream;
use crate::core::obfuscated2;
use crate::error::DialError;
use crate::logger::log;

const DC_PORT: u16 = 443;

/// Default datacenter for unknown ids
pub const DEFAULT_DC: i16 = 2;

const PRODUCTION_DCS: [Ipv4Addr; 5] = [
    Ipv4Addr::new(149, 154, 175, 50),
    Ipv4Addr::new(149, 154, 167, 51),
    Ipv4Addr::new(149, 154, 175, 100),
    Ipv4Addr::new(149, 154, 167, 91),
    Ipv4Addr::new(149, 154, 171, 5),
];

const TEST_DCS: [Ipv4Addr; 3] = [
    Ipv4Addr::new(149, 154, 175, 10),
    Ipv4Addr::new(149, 154, 167, 40),
    Ipv4Addr::new(149, 154, 175, 117),
];

/// Datacenter endpoint table; negative ids select the test pool
#[derive(Debug, Clone)]
pub struct DatacenterTable {
    production: Vec<SocketAddr>,
    test: Vec<SocketAddr>,
    overrides: HashMap<i16, SocketAddr>,
    default_dc: i16,
}

impl Default for DatacenterTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl DatacenterTable {
    /// Compiled-in endpoints
    pub fn builtin() -> Self {
        let to_addr = |ip: &Ipv4Addr| SocketAddr::new(IpAddr::V4(*ip), DC_PORT);
        Self {
            production: PRODUCTION_DCS.iter().map(to_addr).collect(),
            test: TEST_DCS.iter().map(to_addr).collect(),
            overrides: HashMap::new(),
            default_dc: DEFAULT_DC,
        }
    }

    /// Pin `datacenter` to a specific endpoint
    pub fn with_override(mut self, datacenter: i16, addr: SocketAddr) -> Self {
        self.overrides.insert(datacenter, addr);
        self
    }

    pub fn with_default_dc(mut self, datacenter: i16) -> Self {
        self.default_dc = datacenter;
        self
    }

    fn lookup(&self, datacenter: i16) -> Option<SocketAddr> {
        if let Some(addr) = self.overrides.get(&datacenter) {
            return Some(*addr);
        }
        let table = if datacenter < 0 { &self.test } else { &self.production };
        let idx = datacenter.unsigned_abs() as usize;
        idx.checked_sub(1).and_then(|i| table.get(i)).copied()
    }

    /// Endpoint for `datacenter`, falling back to the default datacenter
    pub fn resolve(&self, datacenter: i16) -> Option<SocketAddr> {
        self.lookup(datacenter).or_else(|| {
            log::debug!(
                dc = datacenter,
                default_dc = self.default_dc,
                "Unknown datacenter, using default"
            );
            self.lookup(self.default_dc)
        })
    }
}

/// Obfuscated2 dialer toward datacenters
#[derive(Debug, Clone)]
pub struct DirectDialer {
    table: DatacenterTable,
    connect_timeout: Duration,
    nodelay: bool,
}

impl DirectDialer {
    pub fn new(table: DatacenterTable, connect_timeout: Duration, nodelay: bool) -> Self {
        Self {
            table,
            connect_timeout,
            nodelay,
        }
    }

    pub async fn dial(&self, route: &Route) -> Result<CipherStream<TcpStream>, DialError> {
        let addr = self
            .table
            .resolve(route.datacenter)
            .ok_or(DialError::NoEndpoint(route.datacenter))?;
        let mut stream = connect_with_timeout(addr, self.connect_timeout, self.nodelay).await?;

        let (header, pair) =
            obfuscated2::generate_client_header(route.protocol, route.datacenter, None);
        stream
            .write_all(&header)
            .await
            .map_err(|source| DialError::Io { addr, source })?;

        log::debug!(dc = route.datacenter, backend = %addr, "Datacenter connected");
        Ok(CipherStream::new(stream, pair))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::obfuscated2::{decode_client_header, WrappedProtocol, HANDSHAKE_LEN};
    use crate::core::secret::SecretMode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_builtin_table() {
        let table = DatacenterTable::builtin();
        assert_eq!(table.resolve(1), "149.154.175.50:443".parse().ok());
        assert_eq!(table.resolve(5), "149.154.171.5:443".parse().ok());
        assert_eq!(table.resolve(-1), "149.154.175.10:443".parse().ok());
        assert_eq!(table.resolve(-3), "149.154.175.117:443".parse().ok());
    }

    #[test]
    fn test_unknown_falls_back_to_default() {
        let table = DatacenterTable::builtin();
        let dc2 = table.resolve(2);
        assert_eq!(table.resolve(0), dc2);
        assert_eq!(table.resolve(42), dc2);
        assert_eq!(table.resolve(-9), dc2);
        assert_eq!(table.with_default_dc(4).resolve(99), "149.154.167.91:443".parse().ok());
    }

    #[test]
    fn test_override_wins() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let table = DatacenterTable::builtin().with_override(2, addr);
        assert_eq!(table.resolve(2), Some(addr));
        assert_eq!(table.resolve(77), Some(addr));
    }

    #[tokio::test]
    async fn test_dial_sends_decodable_header() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = DirectDialer::new(
            DatacenterTable::builtin().with_override(3, addr),
            Duration::from_secs(1),
            true,
        );

        let datacenter = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut raw = [0u8; HANDSHAKE_LEN];
            sock.read_exact(&mut raw).await.unwrap();
            let (header, mut pair) = decode_client_header(&raw, None, SecretMode::Simple).unwrap();

            let mut data = [0u8; 4];
            sock.read_exact(&mut data).await.unwrap();
            pair.decryptor.apply(&mut data);
            assert_eq!(&data, b"ping");

            let mut answer = *b"pong";
            pair.encryptor.apply(&mut answer);
            sock.write_all(&answer).await.unwrap();
            (header.protocol, header.datacenter)
        });

        let route = Route {
            datacenter: 3,
            protocol: WrappedProtocol::Abridged,
            client_addr: "127.0.0.1:1".parse().unwrap(),
            local_addr: "127.0.0.1:2".parse().unwrap(),
        };
        let mut stream = dialer.dial(&route).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        let mut answer = [0u8; 4];
        stream.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer, b"pong");

        assert_eq!(datacenter.await.unwrap(), (WrappedProtocol::Abridged, 3));
    }

    #[tokio::test]
    async fn test_dial_timeout() {
        // TEST-NET-1, never routed
        let addr: SocketAddr = "192.0.2.1:443".parse().unwrap();
        let dialer = DirectDialer::new(
            DatacenterTable::builtin().with_override(1, addr),
            Duration::from_millis(50),
            true,
        );
        let route = Route {
            datacenter: 1,
            protocol: WrappedProtocol::Intermediate,
            client_addr: "127.0.0.1:1".parse().unwrap(),
            local_addr: "127.0.0.1:2".parse().unwrap(),
        };
        match dialer.dial(&route).await {
            Err(DialError::Timeout { addr: a }) => assert_eq!(a, addr),
            // sandboxed hosts may refuse unroutable destinations outright
            Err(DialError::Io { .. }) => {}
            other => panic!("unexpected dial result: {:?}", other.err()),
        }
    }
}
