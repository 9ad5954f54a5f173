//! RPC_PROXY_REQ envelope and middle-proxy answers

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use crate::core::framing::ClientMessage;
use crate::core::obfuscated2::WrappedProtocol;
use crate::error::EnvelopeError;

pub const RPC_PROXY_REQ: [u8; 4] = [0xee, 0xf1, 0xce, 0x36];
pub const RPC_PROXY_ANS: [u8; 4] = [0x0d, 0xda, 0x03, 0x44];
pub const RPC_SIMPLE_ACK: [u8; 4] = [0x9b, 0x40, 0xac, 0x3b];
pub const RPC_CLOSE_EXT: [u8; 4] = [0xa2, 0x34, 0xb6, 0x5e];

const TL_PROXY_TAG: [u8; 4] = [0xae, 0x26, 0x1e, 0xdb];

pub const AD_TAG_LEN: usize = 16;

pub const FLAG_NOT_ENCRYPTED: u32 = 0x2;
pub const FLAG_HAS_AD_TAG: u32 = 0x8;
pub const FLAG_MAGIC: u32 = 0x1000;
pub const FLAG_EXTMODE2: u32 = 0x20000;
pub const FLAG_PAD: u32 = 0x0800_0000;
pub const FLAG_INTERMEDIATE: u32 = 0x2000_0000;
pub const FLAG_ABRIDGED: u32 = 0x4000_0000;
pub const FLAG_QUICKACK: u32 = 0x8000_0000;

// TL proxy tag + TL string of the ad tag, padded to 4 bytes
const EXTRA_LEN: usize = 4 + 1 + AD_TAG_LEN + 3;
const REQUEST_HEADER_LEN: usize = 4 + 4 + 8 + 16 + 4 + 16 + 4 + 4 + EXTRA_LEN;

/// Flags of an RPC_PROXY_REQ carrying `message` from a `protocol` client
pub fn request_flags(protocol: WrappedProtocol, message: &ClientMessage) -> u32 {
    let mut flags = FLAG_HAS_AD_TAG | FLAG_MAGIC | FLAG_EXTMODE2;
    flags |= match protocol {
        WrappedProtocol::Abridged => FLAG_ABRIDGED,
        WrappedProtocol::Intermediate => FLAG_INTERMEDIATE,
        WrappedProtocol::SecureIntermediate | WrappedProtocol::PaddedIntermediate => {
            FLAG_INTERMEDIATE | FLAG_PAD
        }
    };
    if message.quick_ack {
        flags |= FLAG_QUICKACK;
    }
    // zero auth_key_id marks a plaintext MTProto message
    if message.payload.len() >= 8 && message.payload[..8].iter().all(|b| *b == 0) {
        flags |= FLAG_NOT_ENCRYPTED;
    }
    flags
}

fn put_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        IpAddr::V6(ip) => ip,
    };
    buf.put_slice(&ip.octets());
    buf.put_u32_le(addr.port() as u32);
}

fn get_addr(buf: &mut &[u8]) -> SocketAddr {
    let mut octets = [0u8; 16];
    buf.copy_to_slice(&mut octets);
    let ip = Ipv6Addr::from(octets);
    let port = buf.get_u32_le() as u16;
    match ip.to_ipv4_mapped() {
        Some(v4) => SocketAddr::new(IpAddr::V4(v4), port),
        None => SocketAddr::new(IpAddr::V6(ip), port),
    }
}

/// One client message as the middle proxy expects it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddleProxyEnvelope {
    pub flags: u32,
    pub conn_id: u64,
    pub client_addr: SocketAddr,
    pub our_addr: SocketAddr,
    pub ad_tag: [u8; AD_TAG_LEN],
    pub payload: Bytes,
}

impl MiddleProxyEnvelope {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(REQUEST_HEADER_LEN + self.payload.len());
        buf.put_slice(&RPC_PROXY_REQ);
        buf.put_u32_le(self.flags);
        buf.put_u64_le(self.conn_id);
        put_addr(&mut buf, &self.client_addr);
        put_addr(&mut buf, &self.our_addr);
        buf.put_u32_le(EXTRA_LEN as u32);
        buf.put_slice(&TL_PROXY_TAG);
        buf.put_u8(AD_TAG_LEN as u8);
        buf.put_slice(&self.ad_tag);
        buf.put_bytes(0, 3);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse an RPC_PROXY_REQ written by [`encode`](Self::encode)
    pub fn decode(frame: &Bytes) -> Result<Self, EnvelopeError> {
        if frame.len() < REQUEST_HEADER_LEN || frame[..4] != RPC_PROXY_REQ {
            return Err(EnvelopeError::Rejected("not a proxy request"));
        }
        let mut buf = &frame[4..];
        let flags = buf.get_u32_le();
        let conn_id = buf.get_u64_le();
        let client_addr = get_addr(&mut buf);
        let our_addr = get_addr(&mut buf);
        if buf.get_u32_le() as usize != EXTRA_LEN
            || buf[..4] != TL_PROXY_TAG
            || buf[4] as usize != AD_TAG_LEN
        {
            return Err(EnvelopeError::Rejected("malformed proxy tag"));
        }
        let mut ad_tag = [0u8; AD_TAG_LEN];
        ad_tag.copy_from_slice(&buf[5..5 + AD_TAG_LEN]);
        Ok(Self {
            flags,
            conn_id,
            client_addr,
            our_addr,
            ad_tag,
            payload: frame.slice(REQUEST_HEADER_LEN..),
        })
    }
}

/// Frames the middle proxy sends back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcAnswer {
    ProxyAns { flags: u32, conn_id: u64, payload: Bytes },
    SimpleAck { conn_id: u64, confirm: u32 },
    CloseExt { conn_id: u64 },
}

impl RpcAnswer {
    pub fn parse(frame: Bytes) -> Result<Self, EnvelopeError> {
        if frame.len() < 12 {
            return Err(EnvelopeError::Rejected("short answer"));
        }
        let tag = [frame[0], frame[1], frame[2], frame[3]];
        let mut buf = &frame[4..];
        match tag {
            RPC_PROXY_ANS => {
                if frame.len() < 16 {
                    return Err(EnvelopeError::Rejected("short proxy answer"));
                }
                let flags = buf.get_u32_le();
                let conn_id = buf.get_u64_le();
                Ok(RpcAnswer::ProxyAns {
                    flags,
                    conn_id,
                    payload: frame.slice(16..),
                })
            }
            RPC_SIMPLE_ACK => {
                if frame.len() < 16 {
                    return Err(EnvelopeError::Rejected("short simple ack"));
                }
                let conn_id = buf.get_u64_le();
                let confirm = buf.get_u32_le();
                Ok(RpcAnswer::SimpleAck { conn_id, confirm })
            }
            RPC_CLOSE_EXT => Ok(RpcAnswer::CloseExt {
                conn_id: buf.get_u64_le(),
            }),
            _ => Err(EnvelopeError::Rejected("unknown answer type")),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            RpcAnswer::ProxyAns { flags, conn_id, payload } => {
                buf.put_slice(&RPC_PROXY_ANS);
                buf.put_u32_le(*flags);
                buf.put_u64_le(*conn_id);
                buf.put_slice(payload);
            }
            RpcAnswer::SimpleAck { conn_id, confirm } => {
                buf.put_slice(&RPC_SIMPLE_ACK);
                buf.put_u64_le(*conn_id);
                buf.put_u32_le(*confirm);
            }
            RpcAnswer::CloseExt { conn_id } => {
                buf.put_slice(&RPC_CLOSE_EXT);
                buf.put_u64_le(*conn_id);
            }
        }
        buf.freeze()
    }

    pub fn conn_id(&self) -> u64 {
        match self {
            RpcAnswer::ProxyAns { conn_id, .. }
            | RpcAnswer::SimpleAck { conn_id, .. }
            | RpcAnswer::CloseExt { conn_id } => *conn_id,
        }
    }
}
