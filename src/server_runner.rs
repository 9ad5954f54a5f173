//! Server startup and accept loop
//!
//! This module binds the listener and runs the accept loop. Per-connection
//! work runs in its own task so the loop never waits on a session.

use crate::core::Server;
use crate::handler::process_connection;
use crate::logger::log;
use crate::transport::{ConnectionMeta, TransportStream};

use anyhow::Result;
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// TCP keepalive interval for accepted sockets.
/// Dead peers are detected in ~45s (3 probes × 15s).
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Bind a TCP listener with SO_REUSEADDR for fast restarts
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    // Allow immediate rebind after restart (skip TIME_WAIT)
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(TcpListener::from_std(socket.into())?)
}

fn tune_accepted(stream: &tokio::net::TcpStream, nodelay: bool) {
    if nodelay {
        let _ = stream.set_nodelay(true);
    }
    // Enable TCP keepalive to detect dead peers (mobile disconnect, network change, etc.)
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
}

/// Accept connections on `listener` until `shutdown` fires
pub async fn serve(
    server: Arc<Server>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    // Connection limiter: 0 = unlimited
    let conn_limiter = if server.conn_config.max_connections > 0 {
        Some(Arc::new(Semaphore::new(server.conn_config.max_connections)))
    } else {
        None
    };

    let local_addr = listener.local_addr()?;
    log::info!(
        address = %local_addr,
        mode = %server.negotiator.mode(),
        backend = server.dialer.name(),
        max_connections = server.conn_config.max_connections,
        "Server started"
    );

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => break,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                log::connection(peer_addr, "new");

                // Acquire connection permit (backpressure when at limit)
                let permit = match conn_limiter {
                    Some(ref limiter) => tokio::select! {
                        permit = limiter.clone().acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            // Semaphore closed, shutting down
                            Err(_) => break,
                        },
                        _ = shutdown.cancelled() => break,
                    },
                    None => None,
                };

                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    // Hold permit for the lifetime of this connection
                    let _permit = permit;
                    tune_accepted(&stream, server.conn_config.tcp_nodelay);

                    let meta = ConnectionMeta {
                        peer_addr,
                        local_addr: stream.local_addr().unwrap_or(local_addr),
                    };
                    let stream: TransportStream = Box::pin(stream);
                    process_connection(&server, stream, meta).await;
                    log::connection(peer_addr, "closed");
                });
            }
            Err(e) => {
                log::error!(error = %e, "Failed to accept connection");
                // Back off briefly on fd exhaustion and similar transient errors
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    log::info!(address = %local_addr, "Listener closed");
    Ok(())
}

/// Bind `addr` and serve until `shutdown` fires
pub async fn run_server(
    server: Arc<Server>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = bind_listener(addr, server.conn_config.tcp_backlog)?;
    serve(server, listener, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conn_limiter_backpressure() {
        // Simulate max_connections = 2
        let limiter = Arc::new(Semaphore::new(2));

        let permit1 = limiter.clone().acquire_owned().await.unwrap();
        let permit2 = limiter.clone().acquire_owned().await.unwrap();
        assert_eq!(limiter.available_permits(), 0);
        assert!(limiter.try_acquire().is_err());

        // Drop one permit (connection closes) -> slot freed
        drop(permit1);
        assert_eq!(limiter.available_permits(), 1);

        let permit3 = limiter.clone().acquire_owned().await.unwrap();
        assert_eq!(limiter.available_permits(), 0);

        drop(permit2);
        drop(permit3);
        assert_eq!(limiter.available_permits(), 2);
    }

    #[test]
    fn test_tcp_keepalive_interval() {
        // 3 probes × 15s interval = ~45s detection time
        let detection_time = TCP_KEEPALIVE_SECS * 3;
        assert!(detection_time <= 60, "keepalive detection should be under 60s");
    }

    #[tokio::test]
    async fn test_bind_listener_reuse_addr() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = SockRef::from(&listener);
        assert!(socket.reuse_address().unwrap());

        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());

        tune_accepted(&accepted, true);
        assert!(accepted.nodelay().unwrap());
        assert!(SockRef::from(&accepted).keepalive().unwrap());
    }
}
