#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use mtproxy_r::business::SessionStatsCollector;
use mtproxy_r::config::ConnConfig;
use mtproxy_r::core::obfuscated2::{decode_client_header, HANDSHAKE_LEN};
use mtproxy_r::core::{
    CipherStream, ConnectionManager, Disposition, EvictionPolicy, Negotiator, ReplayConfig,
    ReplayGuard, Secret, SecretMode, Server, StatsCollector,
};
use mtproxy_r::server_runner;
use mtproxy_r::transport::BackendDialer;

pub const KEY: [u8; 16] = [0x3c; 16];

pub struct Proxy {
    pub addr: SocketAddr,
    pub stats: Arc<SessionStatsCollector>,
    pub shutdown: CancellationToken,
}

impl Proxy {
    /// Wait until `count` sessions ended with `disposition`
    pub async fn wait_for(&self, disposition: Disposition, count: u64) {
        for _ in 0..300 {
            if self.stats.snapshot().count(disposition) >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} {} sessions, stats: {:?}",
            count,
            disposition,
            self.stats.snapshot()
        );
    }

    /// Wait until `total` sessions were reported, then check no extra report follows
    pub async fn settle(&self, total: u64) {
        for _ in 0..300 {
            if self.stats.snapshot().total_sessions() >= total {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = self.stats.snapshot();
        assert_eq!(snapshot.total_sessions(), total, "stats: {:?}", snapshot);
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn conn_config() -> ConnConfig {
    ConnConfig {
        idle_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        ..ConnConfig::default()
    }
}

pub async fn start_proxy(
    secret: Secret,
    dialer: BackendDialer,
    conn_config: ConnConfig,
    decoy: Option<String>,
) -> Proxy {
    let shutdown = CancellationToken::new();
    let replay = Arc::new(ReplayGuard::new(ReplayConfig {
        capacity: 1024,
        window: Duration::from_secs(600),
        policy: EvictionPolicy::Ttl,
    }));
    let stats = Arc::new(SessionStatsCollector::new());
    let server = Arc::new(
        Server::builder()
            .negotiator(Negotiator::new(secret, replay, Duration::from_secs(300)))
            .dialer(dialer)
            .stats(Arc::clone(&stats) as Arc<dyn StatsCollector>)
            .conn_manager(ConnectionManager::with_shutdown(shutdown.child_token()))
            .conn_config(conn_config)
            .decoy(decoy)
            .build(),
    );

    let listener = server_runner::bind_listener("127.0.0.1:0".parse().unwrap(), 64).unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server_runner::serve(server, listener, shutdown.clone()));

    Proxy { addr, stats, shutdown }
}

/// Datacenter stand-in: decodes our obfuscated2 header and answers each
/// 8-byte `ping` frame with a `pong` frame.
pub async fn fake_datacenter() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut raw = [0u8; HANDSHAKE_LEN];
                if sock.read_exact(&mut raw).await.is_err() {
                    return;
                }
                let Ok((_, pair)) = decode_client_header(&raw, None, SecretMode::Simple) else {
                    return;
                };
                let mut stream = CipherStream::new(sock, pair);
                let mut frame = [0u8; 8];
                while stream.read_exact(&mut frame).await.is_ok() {
                    if &frame[4..] == b"ping" {
                        if stream.write_all(b"\x04\x00\x00\x00pong").await.is_err() {
                            return;
                        }
                        let _ = stream.flush().await;
                    }
                }
            });
        }
    });
    addr
}

/// An address nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Read until the peer closes; errors count as closed
pub async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf)).await;
    buf
}

pub fn unix_now() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32
}
