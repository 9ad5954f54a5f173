//! MTProxy RPC transport
//!
//! Frames are `len | seq | payload | crc32`, all little-endian. The first
//! exchange (RPC_NONCE, seq -2) is plaintext; everything after it is
//! AES-256-CBC with the chain running across frames, padded to the block
//! size with 4-byte filler frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use futures_util::{SinkExt, StreamExt};
use md5::Md5;
use rand::RngCore;
use sha1::Sha1;
use sha2::Digest;
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use crate::error::EnvelopeError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const RPC_NONCE: [u8; 4] = [0xaa, 0x87, 0xcb, 0x7a];
pub const RPC_HANDSHAKE: [u8; 4] = [0xf5, 0xee, 0x82, 0x76];
pub const RPC_HANDSHAKE_ERROR: [u8; 4] = [0xda, 0xbe, 0x27, 0x6a];

/// AES crypto schema announced in RPC_NONCE
const CRYPTO_SCHEMA_AES: u32 = 1;

const SEQ_NONCE: i32 = -2;
const FRAME_OVERHEAD: usize = 12;
const MIN_FRAME_LEN: usize = FRAME_OVERHEAD;
const MAX_FRAME_LEN: usize = 1 << 24;
const BLOCK_LEN: usize = 16;
const PADDING_WORD: u32 = 4;

const NONCE_LEN: usize = 16;
const NONCE_PAYLOAD_LEN: usize = 32;

/// Direction keys of one RPC connection
#[derive(Clone)]
pub struct RpcKeys {
    pub encrypt_key: [u8; 32],
    pub encrypt_iv: [u8; 16],
    pub decrypt_key: [u8; 32],
    pub decrypt_iv: [u8; 16],
}

/// Which end of the RPC connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Inputs of the key schedule, named from the connecting side's point of view
pub struct KeyMaterial<'a> {
    pub server_nonce: &'a [u8; NONCE_LEN],
    pub client_nonce: &'a [u8; NONCE_LEN],
    pub client_timestamp: u32,
    pub server_addr: SocketAddr,
    pub client_addr: SocketAddr,
    pub secret: &'a [u8],
}

/// IPv4 address as the little-endian host integer the key schedule expects
fn ipv4_le(addr: &SocketAddr) -> Option<[u8; 4]> {
    let v4 = match addr.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => ip.to_ipv4_mapped()?,
    };
    let mut octets = v4.octets();
    octets.reverse();
    Some(octets)
}

fn ipv6_octets(addr: &SocketAddr) -> [u8; 16] {
    match addr.ip() {
        IpAddr::V4(ip) => ip.to_ipv6_mapped().octets(),
        IpAddr::V6(ip) => ip.octets(),
    }
}

fn derive_key_iv(material: &KeyMaterial<'_>, purpose: &[u8; 6]) -> ([u8; 32], [u8; 16]) {
    let v4 = ipv4_le(&material.server_addr).zip(ipv4_le(&material.client_addr));

    let mut s = Vec::with_capacity(128 + material.secret.len());
    s.extend_from_slice(material.server_nonce);
    s.extend_from_slice(material.client_nonce);
    s.extend_from_slice(&material.client_timestamp.to_le_bytes());
    s.extend_from_slice(&v4.map(|(server, _)| server).unwrap_or_default());
    s.extend_from_slice(&material.client_addr.port().to_le_bytes());
    s.extend_from_slice(purpose);
    s.extend_from_slice(&v4.map(|(_, client)| client).unwrap_or_default());
    s.extend_from_slice(&material.server_addr.port().to_le_bytes());
    s.extend_from_slice(material.secret);
    s.extend_from_slice(material.server_nonce);
    if v4.is_none() {
        s.extend_from_slice(&ipv6_octets(&material.client_addr));
        s.extend_from_slice(&ipv6_octets(&material.server_addr));
    }
    s.extend_from_slice(material.client_nonce);

    let mut key = [0u8; 32];
    key[..12].copy_from_slice(&Md5::digest(&s[1..])[..12]);
    key[12..].copy_from_slice(&Sha1::digest(&s));
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&Md5::digest(&s[2..]));
    (key, iv)
}

impl RpcKeys {
    /// Derive both direction keys. The connecting side encrypts with the
    /// "CLIENT" keys, the accepting side with the "SERVER" keys.
    pub fn derive(material: &KeyMaterial<'_>, role: Role) -> Self {
        let client = derive_key_iv(material, b"CLIENT");
        let server = derive_key_iv(material, b"SERVER");
        let ((encrypt_key, encrypt_iv), (decrypt_key, decrypt_iv)) = match role {
            Role::Client => (client, server),
            Role::Server => (server, client),
        };
        Self {
            encrypt_key,
            encrypt_iv,
            decrypt_key,
            decrypt_iv,
        }
    }
}

/// Outbound half of the frame codec
pub struct FrameEncoder {
    seq: i32,
    cipher: Option<Aes256CbcEnc>,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self {
            seq: SEQ_NONCE,
            cipher: None,
        }
    }

    pub fn enable_encryption(&mut self, keys: &RpcKeys) {
        self.cipher = Some(Aes256CbcEnc::new(
            GenericArray::from_slice(&keys.encrypt_key),
            GenericArray::from_slice(&keys.encrypt_iv),
        ));
    }
}

impl Encoder<Bytes> for FrameEncoder {
    type Error = EnvelopeError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = payload.len() + FRAME_OVERHEAD;
        if len > MAX_FRAME_LEN || payload.len() % 4 != 0 {
            return Err(EnvelopeError::Rejected("payload length not encodable"));
        }

        let mut frame = BytesMut::with_capacity(len + BLOCK_LEN);
        frame.put_u32_le(len as u32);
        frame.put_i32_le(self.seq);
        frame.put_slice(&payload);
        let crc = crc32fast::hash(&frame);
        frame.put_u32_le(crc);
        self.seq = self.seq.wrapping_add(1);

        if let Some(cipher) = self.cipher.as_mut() {
            while frame.len() % BLOCK_LEN != 0 {
                frame.put_u32_le(PADDING_WORD);
            }
            for block in frame.chunks_exact_mut(BLOCK_LEN) {
                cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        }
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

/// Inbound half of the frame codec
pub struct FrameDecoder {
    seq: i32,
    cipher: Option<Aes256CbcDec>,
    plain: BytesMut,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            seq: SEQ_NONCE,
            cipher: None,
            plain: BytesMut::new(),
        }
    }

    /// Bytes after the last plaintext frame are decrypted from here on
    pub fn enable_decryption(&mut self, keys: &RpcKeys) {
        self.cipher = Some(Aes256CbcDec::new(
            GenericArray::from_slice(&keys.decrypt_key),
            GenericArray::from_slice(&keys.decrypt_iv),
        ));
    }

    fn take_frame(buf: &mut BytesMut, seq: &mut i32) -> Result<Option<Bytes>, EnvelopeError> {
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if len == PADDING_WORD as usize {
                buf.advance(4);
                continue;
            }
            if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&len) || len % 4 != 0 {
                return Err(EnvelopeError::Rejected("invalid frame length"));
            }
            // Reject as soon as the sequence number is visible
            if buf.len() >= 8 && i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) != *seq {
                return Err(EnvelopeError::Rejected("unexpected sequence number"));
            }
            if buf.len() < len {
                buf.reserve(len - buf.len());
                return Ok(None);
            }

            let frame = buf.split_to(len);
            let mut crc = [0u8; 4];
            crc.copy_from_slice(&frame[len - 4..]);
            let expected = u32::from_le_bytes(crc);
            if crc32fast::hash(&frame[..len - 4]) != expected {
                return Err(EnvelopeError::Rejected("frame checksum mismatch"));
            }
            *seq = seq.wrapping_add(1);
            return Ok(Some(frame.freeze().slice(8..len - 4)));
        }
    }
}

impl Decoder for FrameDecoder {
    type Item = Bytes;
    type Error = EnvelopeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.cipher.as_mut() {
            None => Self::take_frame(src, &mut self.seq),
            Some(cipher) => {
                let whole = src.len() - src.len() % BLOCK_LEN;
                if whole > 0 {
                    let mut blocks = src.split_to(whole);
                    for block in blocks.chunks_exact_mut(BLOCK_LEN) {
                        cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
                    }
                    self.plain.extend_from_slice(&blocks);
                }
                Self::take_frame(&mut self.plain, &mut self.seq)
            }
        }
    }
}

pub type RpcReader<R> = FramedRead<R, FrameDecoder>;
pub type RpcWriter<W> = FramedWrite<W, FrameEncoder>;

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

/// RPC_NONCE payload
pub fn nonce_payload(secret: &[u8], timestamp: u32, nonce: &[u8; NONCE_LEN]) -> Bytes {
    let mut buf = BytesMut::with_capacity(NONCE_PAYLOAD_LEN);
    buf.put_slice(&RPC_NONCE);
    buf.put_slice(&key_selector(secret));
    buf.put_u32_le(CRYPTO_SCHEMA_AES);
    buf.put_u32_le(timestamp);
    buf.put_slice(nonce);
    buf.freeze()
}

fn key_selector(secret: &[u8]) -> [u8; 4] {
    let mut selector = [0u8; 4];
    let n = secret.len().min(4);
    selector[..n].copy_from_slice(&secret[..n]);
    selector
}

/// Parsed RPC_NONCE
pub struct NonceMessage {
    pub key_selector: [u8; 4],
    pub schema: u32,
    pub timestamp: u32,
    pub nonce: [u8; NONCE_LEN],
}

pub fn parse_nonce(payload: &[u8]) -> Result<NonceMessage, EnvelopeError> {
    if payload.len() != NONCE_PAYLOAD_LEN || payload[..4] != RPC_NONCE {
        return Err(EnvelopeError::Rejected("malformed nonce answer"));
    }
    let mut key_selector = [0u8; 4];
    key_selector.copy_from_slice(&payload[4..8]);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&payload[16..32]);
    Ok(NonceMessage {
        key_selector,
        schema: u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]),
        timestamp: u32::from_le_bytes([payload[12], payload[13], payload[14], payload[15]]),
        nonce,
    })
}

/// RPC_HANDSHAKE payload carrying our process id
pub fn handshake_payload(local: SocketAddr) -> Bytes {
    let mut buf = BytesMut::with_capacity(32);
    buf.put_slice(&RPC_HANDSHAKE);
    buf.put_u32_le(0);
    // sender pid: ip, port, pid, start time
    buf.put_slice(&ipv4_le(&local).unwrap_or_default());
    buf.put_u16_le(local.port());
    buf.put_u16_le(std::process::id() as u16);
    buf.put_u32_le(unix_time());
    // peer pid, unknown to us
    buf.put_slice(&[0u8; 12]);
    buf.freeze()
}

async fn next_frame<R>(reader: &mut RpcReader<R>) -> Result<Bytes, EnvelopeError>
where
    R: AsyncRead + Unpin,
{
    match reader.next().await {
        Some(frame) => frame,
        None => Err(EnvelopeError::Io(std::io::ErrorKind::UnexpectedEof.into())),
    }
}

/// Run the connecting side of the nonce exchange and handshake.
///
/// `local` is our address as the middle proxy sees it and `remote` is the
/// middle proxy's. Both feed the key schedule.
pub async fn client_handshake<R, W>(
    reader: &mut RpcReader<R>,
    writer: &mut RpcWriter<W>,
    secret: &[u8],
    local: SocketAddr,
    remote: SocketAddr,
) -> Result<(), EnvelopeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut client_nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut client_nonce);
    let timestamp = unix_time();

    writer.send(nonce_payload(secret, timestamp, &client_nonce)).await?;

    let answer = parse_nonce(&next_frame(reader).await?)?;
    if answer.key_selector != key_selector(secret) {
        return Err(EnvelopeError::Rejected("proxy secret key selector mismatch"));
    }
    if answer.schema != CRYPTO_SCHEMA_AES {
        return Err(EnvelopeError::Rejected("unsupported crypto schema"));
    }

    let keys = RpcKeys::derive(
        &KeyMaterial {
            server_nonce: &answer.nonce,
            client_nonce: &client_nonce,
            client_timestamp: timestamp,
            server_addr: remote,
            client_addr: local,
            secret,
        },
        Role::Client,
    );
    writer.encoder_mut().enable_encryption(&keys);
    reader.decoder_mut().enable_decryption(&keys);

    writer.send(handshake_payload(local)).await?;

    let answer = next_frame(reader).await?;
    match answer.get(..4) {
        Some(tag) if tag == RPC_HANDSHAKE => Ok(()),
        Some(tag) if tag == RPC_HANDSHAKE_ERROR => {
            Err(EnvelopeError::Rejected("middle proxy refused handshake"))
        }
        _ => Err(EnvelopeError::Rejected("unexpected handshake answer")),
    }
}

/// Run the accepting side of the handshake, as a middle proxy would
pub async fn server_handshake<R, W>(
    reader: &mut RpcReader<R>,
    writer: &mut RpcWriter<W>,
    secret: &[u8],
    local: SocketAddr,
    peer: SocketAddr,
) -> Result<(), EnvelopeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = parse_nonce(&next_frame(reader).await?)?;
    if hello.key_selector != key_selector(secret) {
        return Err(EnvelopeError::Rejected("proxy secret key selector mismatch"));
    }

    let mut server_nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut server_nonce);
    writer.send(nonce_payload(secret, unix_time(), &server_nonce)).await?;

    let keys = RpcKeys::derive(
        &KeyMaterial {
            server_nonce: &server_nonce,
            client_nonce: &hello.nonce,
            client_timestamp: hello.timestamp,
            server_addr: local,
            client_addr: peer,
            secret,
        },
        Role::Server,
    );
    writer.encoder_mut().enable_encryption(&keys);
    reader.decoder_mut().enable_decryption(&keys);

    let handshake = next_frame(reader).await?;
    if handshake.get(..4) != Some(&RPC_HANDSHAKE[..]) {
        return Err(EnvelopeError::Rejected("unexpected handshake"));
    }
    writer.send(handshake_payload(local)).await?;
    Ok(())
}
