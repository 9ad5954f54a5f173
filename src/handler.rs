//! Connection handling logic
//!
//! One accepted connection runs through negotiate, dial and relay. Every
//! path ends in exactly one [`SessionReport`] handed to the stats collector.

use crate::core::framing::{ClientCodec, Outbound};
use crate::core::relay::{self, RelayEnd, SessionTraffic, TimedStream};
use crate::core::{
    CipherStream, Disposition, Negotiated, Rejection, SecretMode, Server, SessionReport,
    WrappedProtocol,
};
use crate::error::{DialError, NegotiationError};
use crate::logger::log;
use crate::transport::middle::RpcAnswer;
use crate::transport::{Backend, ConnectionMeta, MiddleProxyConnection, Route, TransportStream};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Middle-proxy endpoints tried per session when envelopes get rejected
const MAX_DIAL_ATTEMPTS: usize = 3;

/// Process a single connection and report how it ended
pub async fn process_connection(
    server: &Server,
    stream: TransportStream,
    meta: ConnectionMeta,
) -> SessionReport {
    // Register connection for tracking and shutdown
    let (conn_id, cancel_token) = server.conn_manager.register(meta.peer_addr);
    log::debug!(peer = %meta.peer_addr, conn_id = conn_id, "Connection registered");

    // Ensure connection is unregistered when done
    let _guard = scopeguard::guard((), |_| {
        server.conn_manager.unregister(conn_id);
        log::debug!(conn_id = conn_id, "Connection unregistered");
    });

    let report = run_session(server, stream, meta, &cancel_token).await;
    log::session(meta.peer_addr, &report);
    server.stats.record_session(&report);
    report
}

async fn run_session(
    server: &Server,
    stream: TransportStream,
    meta: ConnectionMeta,
    cancel: &CancellationToken,
) -> SessionReport {
    let mode = server.negotiator.mode();
    let negotiation = tokio::select! {
        result = tokio::time::timeout(
            server.conn_config.handshake_timeout,
            server.negotiator.negotiate(stream),
        ) => result,
        _ = cancel.cancelled() => return SessionReport::empty(Disposition::Completed, None),
    };

    let Negotiated { stream: client, header } = match negotiation {
        Ok(Ok(negotiated)) => negotiated,
        Ok(Err(rejection)) => return handle_rejection(server, rejection, meta, cancel).await,
        Err(_) => {
            let reason = NegotiationError::Timeout.to_string();
            log::handshake(meta.peer_addr, &mode.to_string(), Some(&reason));
            return SessionReport::empty(Disposition::TimedOut, None);
        }
    };
    log::handshake(meta.peer_addr, &mode.to_string(), None);

    let datacenter = header.datacenter;
    let route = Route {
        datacenter,
        protocol: header.protocol,
        client_addr: meta.peer_addr,
        local_addr: meta.local_addr,
    };

    let backend = tokio::select! {
        result = dial_backend(server, &route) => result,
        _ = cancel.cancelled() => {
            return SessionReport::empty(Disposition::Completed, Some(datacenter));
        }
    };
    let backend = match backend {
        Ok(backend) => backend,
        Err(e) => {
            log::debug!(
                peer = %meta.peer_addr,
                dc = datacenter,
                mode = server.dialer.name(),
                error = %e,
                "Backend dial failed"
            );
            return SessionReport::empty(Disposition::DialFailed, Some(datacenter));
        }
    };

    let traffic = Arc::new(SessionTraffic::new());
    let end = match backend {
        Backend::Direct(remote) => {
            relay::relay_bidirectional(
                client,
                remote,
                Arc::clone(&traffic),
                server.conn_config.idle_timeout,
                server.conn_config.buffer_size,
                cancel,
            )
            .await
        }
        Backend::Middle(remote) => {
            relay_middle(server, client, remote, header.protocol, &traffic, cancel).await
        }
    };

    let disposition = match end {
        RelayEnd::Idle => Disposition::TimedOut,
        RelayEnd::Error(ref e) => {
            log::debug!(peer = %meta.peer_addr, error = %e, "Relay error");
            Disposition::Completed
        }
        RelayEnd::Eof | RelayEnd::Shutdown => Disposition::Completed,
    };
    SessionReport::with_traffic(disposition, Some(datacenter), traffic.snapshot())
}

/// Dial, moving on to another middle-proxy endpoint when one rejects our envelope
async fn dial_backend(server: &Server, route: &Route) -> Result<Backend, DialError> {
    let mut rejected = Vec::new();
    loop {
        match server.dialer.dial(route, &rejected).await {
            Err(DialError::EnvelopeRejected { addr, reason })
                if rejected.len() + 1 < MAX_DIAL_ATTEMPTS =>
            {
                log::debug!(
                    backend = %addr,
                    reason = %reason,
                    "Envelope rejected, trying another endpoint"
                );
                rejected.push(addr);
            }
            result => return result,
        }
    }
}

/// Close silently, or hand the connection to the decoy in fake TLS mode
async fn handle_rejection(
    server: &Server,
    rejection: Rejection,
    meta: ConnectionMeta,
    cancel: &CancellationToken,
) -> SessionReport {
    let Rejection { error, stream, prefix } = rejection;
    let mode = server.negotiator.mode();
    log::handshake(meta.peer_addr, &mode.to_string(), Some(&error.to_string()));

    let disposition = match error {
        NegotiationError::Replayed => Disposition::RejectedReplay,
        NegotiationError::Timeout => Disposition::TimedOut,
        NegotiationError::NotOurs(_) | NegotiationError::Io(_) => Disposition::RejectedInvalid,
    };

    if mode == SecretMode::Tls {
        if let (Some(decoy), Some(prefix)) = (server.decoy.as_deref(), prefix) {
            if let Err(e) = forward_to_decoy(server, stream, prefix, decoy, cancel).await {
                log::debug!(
                    peer = %meta.peer_addr,
                    decoy = %decoy,
                    error = %e,
                    "Decoy relay failed"
                );
            }
        }
    }
    SessionReport::empty(disposition, None)
}

/// Replay the consumed bytes to the decoy and splice the rest of the connection
async fn forward_to_decoy(
    server: &Server,
    client: TransportStream,
    prefix: Bytes,
    decoy: &str,
    cancel: &CancellationToken,
) -> io::Result<()> {
    log::debug!(decoy = %decoy, buffered_bytes = prefix.len(), "Connecting to decoy");
    let connect = TcpStream::connect(decoy);
    let mut remote = tokio::time::timeout(server.conn_config.connect_timeout, connect)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "decoy connect timeout"))??;
    if server.conn_config.tcp_nodelay {
        let _ = remote.set_nodelay(true);
    }
    remote.write_all(&prefix).await?;

    let end = relay::relay_bidirectional(
        client,
        remote,
        Arc::new(SessionTraffic::new()),
        server.conn_config.idle_timeout,
        server.conn_config.buffer_size,
        cancel,
    )
    .await;
    match end {
        RelayEnd::Error(e) => Err(e),
        _ => Ok(()),
    }
}

/// Relay between a framed client and a middle-proxy connection
async fn relay_middle(
    server: &Server,
    client: CipherStream<TransportStream>,
    backend: MiddleProxyConnection,
    protocol: WrappedProtocol,
    traffic: &Arc<SessionTraffic>,
    cancel: &CancellationToken,
) -> RelayEnd {
    let endpoint = backend.endpoint();
    let client = TimedStream::new(client, Arc::clone(traffic));
    let (client_rx, client_tx) = tokio::io::split(client);
    let mut inbound = FramedRead::with_capacity(
        client_rx,
        ClientCodec::new(protocol),
        server.conn_config.buffer_size,
    );
    let mut outbound = FramedWrite::new(client_tx, ClientCodec::new(protocol));
    let (mut reader, mut writer) = backend.into_split();

    let up = async {
        while let Some(message) = inbound.next().await {
            writer.send(&message?).await?;
            traffic.record_client_to_backend();
        }
        writer.close().await?;
        Ok::<(), io::Error>(())
    };

    let down = async {
        loop {
            match reader.recv().await? {
                Some(RpcAnswer::ProxyAns { payload, .. }) => {
                    outbound.send(Outbound::Data(payload)).await?
                }
                Some(RpcAnswer::SimpleAck { confirm, .. }) => {
                    outbound.send(Outbound::QuickAck(confirm)).await?
                }
                Some(RpcAnswer::CloseExt { .. }) => {
                    log::debug!(backend = %endpoint, "Middle proxy closed the session");
                    return Ok::<(), io::Error>(());
                }
                None => return Ok(()),
            }
            traffic.record_backend_to_client();
        }
    };

    relay::race(up, down, traffic, server.conn_config.idle_timeout, cancel).await
}
