//! Middle-proxy backend
//!
//! Connects to one of Telegram's middle proxies over the MTProxy RPC
//! transport. Each client message travels as one RPC_PROXY_REQ tagged with
//! our ad tag; answers come back as RPC_PROXY_ANS / RPC_SIMPLE_ACK frames.

pub mod envelope;
pub mod pool;
pub mod rpc;

pub use envelope::{MiddleProxyEnvelope, RpcAnswer, AD_TAG_LEN};
pub use pool::{parse_proxy_config, MiddleProxyPool, PoolSnapshot, DEFAULT_PROXY_CONFIG};

use futures_util::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::{connect_with_timeout, PublicAddress, Route};
use crate::core::framing::ClientMessage;
use crate::core::obfuscated2::WrappedProtocol;
use crate::error::{DialError, EnvelopeError};
use crate::logger::log;
use rpc::{FrameDecoder, FrameEncoder, RpcReader, RpcWriter};

/// Dialer toward the middle-proxy pool
pub struct MiddleDialer {
    pool: Arc<MiddleProxyPool>,
    proxy_secret: Arc<[u8]>,
    ad_tag: [u8; AD_TAG_LEN],
    connect_timeout: Duration,
    nodelay: bool,
    public: PublicAddress,
}

impl MiddleDialer {
    pub fn new(
        pool: Arc<MiddleProxyPool>,
        proxy_secret: Vec<u8>,
        ad_tag: [u8; AD_TAG_LEN],
        connect_timeout: Duration,
        nodelay: bool,
    ) -> Self {
        Self {
            pool,
            proxy_secret: proxy_secret.into(),
            ad_tag,
            connect_timeout,
            nodelay,
            public: PublicAddress::default(),
        }
    }

    /// Present `public` as our address in the key schedule and in every envelope
    pub fn with_public_address(mut self, public: PublicAddress) -> Self {
        self.public = public;
        self
    }

    /// Connect and authenticate to a pool endpoint for `route`, never one in `exclude`.
    ///
    /// The connect and the RPC handshake each get the connect timeout.
    pub async fn dial(
        &self,
        route: &Route,
        exclude: &[SocketAddr],
    ) -> Result<MiddleProxyConnection, DialError> {
        let addr = self
            .pool
            .select(route.datacenter, exclude)
            .ok_or(DialError::NoEndpoint(route.datacenter))?;
        let stream = connect_with_timeout(addr, self.connect_timeout, self.nodelay).await?;
        let local = stream.local_addr().map_err(|source| DialError::Io { addr, source })?;
        let local = self.public.translate(local);

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameDecoder::new());
        let mut writer = FramedWrite::new(write_half, FrameEncoder::new());

        let handshake =
            rpc::client_handshake(&mut reader, &mut writer, &self.proxy_secret, local, addr);
        match tokio::time::timeout(self.connect_timeout, handshake).await {
            Err(_) => return Err(DialError::Timeout { addr }),
            Ok(Err(EnvelopeError::Rejected(reason))) => {
                return Err(DialError::EnvelopeRejected {
                    addr,
                    reason: reason.to_string(),
                })
            }
            // middle proxies hang up on an unknown key selector
            Ok(Err(EnvelopeError::Io(e))) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(DialError::EnvelopeRejected {
                    addr,
                    reason: "connection closed during handshake".to_string(),
                })
            }
            Ok(Err(EnvelopeError::Io(source))) => return Err(DialError::Io { addr, source }),
            Ok(Ok(())) => {}
        }

        let conn_id = rand::random::<u64>();
        log::debug!(dc = route.datacenter, backend = %addr, conn_id, "Middle proxy connected");
        Ok(MiddleProxyConnection {
            endpoint: addr,
            reader,
            writer: MiddleWriter {
                writer,
                protocol: route.protocol,
                conn_id,
                client_addr: route.client_addr,
                our_addr: self.public.translate(route.local_addr),
                ad_tag: self.ad_tag,
            },
        })
    }
}

/// Authenticated middle-proxy connection carrying one client session
pub struct MiddleProxyConnection {
    endpoint: SocketAddr,
    reader: RpcReader<OwnedReadHalf>,
    writer: MiddleWriter,
}

impl MiddleProxyConnection {
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn conn_id(&self) -> u64 {
        self.writer.conn_id
    }

    pub fn into_split(self) -> (MiddleReader, MiddleWriter) {
        let reader = MiddleReader {
            reader: self.reader,
            conn_id: self.writer.conn_id,
        };
        (reader, self.writer)
    }
}

/// Inbound half: unwraps answers addressed to our connection id
pub struct MiddleReader {
    reader: RpcReader<OwnedReadHalf>,
    conn_id: u64,
}

impl MiddleReader {
    /// Next answer, `None` once the middle proxy closed the socket
    pub async fn recv(&mut self) -> Result<Option<RpcAnswer>, EnvelopeError> {
        while let Some(frame) = self.reader.next().await {
            let answer = RpcAnswer::parse(frame?)?;
            if answer.conn_id() != self.conn_id {
                log::debug!(conn_id = answer.conn_id(), "Dropping answer for foreign connection");
                continue;
            }
            return Ok(Some(answer));
        }
        Ok(None)
    }
}

/// Outbound half: wraps client messages in RPC_PROXY_REQ
pub struct MiddleWriter {
    writer: RpcWriter<OwnedWriteHalf>,
    protocol: WrappedProtocol,
    conn_id: u64,
    client_addr: SocketAddr,
    our_addr: SocketAddr,
    ad_tag: [u8; AD_TAG_LEN],
}

impl MiddleWriter {
    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), EnvelopeError> {
        let envelope = MiddleProxyEnvelope {
            flags: envelope::request_flags(self.protocol, message),
            conn_id: self.conn_id,
            client_addr: self.client_addr,
            our_addr: self.our_addr,
            ad_tag: self.ad_tag,
            payload: message.payload.clone(),
        };
        self.writer.send(envelope.encode()).await
    }

    pub async fn close(&mut self) -> Result<(), EnvelopeError> {
        self.writer.close().await
    }
}
