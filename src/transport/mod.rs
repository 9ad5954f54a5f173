//! Transport layer abstraction
//!
//! Inbound connections are type-erased into [`TransportStream`]. Outbound
//! connections are opened by a [`BackendDialer`], one closed variant per
//! backend style:
//! - direct: obfuscated2 straight to a datacenter
//! - middle: MTProxy RPC to a middle proxy

pub mod direct;
pub mod middle;

pub use direct::{DatacenterTable, DirectDialer};
pub use middle::{MiddleDialer, MiddleProxyConnection, MiddleProxyPool};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::core::cipher::CipherStream;
use crate::core::obfuscated2::WrappedProtocol;
use crate::error::DialError;

/// Unified transport stream trait combining AsyncRead + AsyncWrite + Send + Unpin
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Unified transport stream type
pub type TransportStream = Pin<Box<dyn AsyncStream>>;

/// Connection metadata
#[derive(Debug, Clone, Copy)]
pub struct ConnectionMeta {
    /// Client peer address
    pub peer_addr: SocketAddr,
    /// Our address the client connected to
    pub local_addr: SocketAddr,
}

/// Addresses the outside world reaches us on
///
/// Behind NAT the socket's own address differs from what a middle proxy
/// sees, and its key schedule is built from the latter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublicAddress {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl PublicAddress {
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }

    /// Swap in the public ip of the same family, keeping the port
    pub fn translate(&self, addr: SocketAddr) -> SocketAddr {
        let ip = match addr.ip() {
            IpAddr::V4(_) => self.ipv4.map(IpAddr::V4),
            IpAddr::V6(v6) if v6.to_ipv4_mapped().is_some() => self.ipv4.map(IpAddr::V4),
            IpAddr::V6(_) => self.ipv6.map(IpAddr::V6),
        };
        match ip {
            Some(ip) => SocketAddr::new(ip, addr.port()),
            None => addr,
        }
    }
}

/// Where a negotiated session wants to go
#[derive(Debug, Clone, Copy)]
pub struct Route {
    pub datacenter: i16,
    pub protocol: WrappedProtocol,
    pub client_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Live backend connection
pub enum Backend {
    Direct(CipherStream<TcpStream>),
    Middle(MiddleProxyConnection),
}

/// Backend dialer for the configured mode
pub enum BackendDialer {
    Direct(DirectDialer),
    Middle(MiddleDialer),
}

impl BackendDialer {
    /// Open a backend connection for `route`.
    ///
    /// `exclude` lists endpoints already tried in this session; only the
    /// middle-proxy dialer has alternatives to pick from.
    pub async fn dial(&self, route: &Route, exclude: &[SocketAddr]) -> Result<Backend, DialError> {
        match self {
            BackendDialer::Direct(dialer) => dialer.dial(route).await.map(Backend::Direct),
            BackendDialer::Middle(dialer) => dialer.dial(route, exclude).await.map(Backend::Middle),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendDialer::Direct(_) => "direct",
            BackendDialer::Middle(_) => "middle",
        }
    }
}

/// TCP connect bounded by `timeout`
pub(crate) async fn connect_with_timeout(
    addr: SocketAddr,
    timeout: Duration,
    nodelay: bool,
) -> Result<TcpStream, DialError> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(DialError::Io { addr, source }),
        Err(_) => return Err(DialError::Timeout { addr }),
    };
    if nodelay {
        stream
            .set_nodelay(true)
            .map_err(|source| DialError::Io { addr, source })?;
    }
    Ok(stream)
}
