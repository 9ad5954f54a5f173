//! Fake TLS wrapping
//!
//! In TLS mode a client opens with something that looks like a TLS 1.3
//! ClientHello. Its 32-byte random is `HMAC-SHA256(secret, hello with a
//! zeroed random)` XOR'd with 28 zero bytes and a little-endian unix
//! timestamp. We answer with a forged ServerHello whose random is signed the
//! same way, after which both sides exchange application-data records that
//! carry the obfuscated2 stream.

use bytes::{Buf, BufMut, BytesMut};
use hmac::{Hmac, Mac};
use pin_project_lite::pin_project;
use rand::{Rng, RngCore};
use sha2::Sha256;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::io::poll_read_buf;

use super::cipher::PendingWrite;

type HmacSha256 = Hmac<Sha256>;

pub const RECORD_HEADER_LEN: usize = 5;
pub const RECORD_HANDSHAKE: u8 = 0x16;
pub const RECORD_CHANGE_CIPHER_SPEC: u8 = 0x14;
pub const RECORD_APPLICATION_DATA: u8 = 0x17;
const RECORD_ALERT: u8 = 0x15;

const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const HANDSHAKE_SERVER_HELLO: u8 = 0x02;

const RANDOM_OFFSET: usize = 11;
const RANDOM_LEN: usize = 32;
const SESSION_ID_OFFSET: usize = RANDOM_OFFSET + RANDOM_LEN;
const MAX_SESSION_ID_LEN: usize = 32;

/// Largest payload we put in one application-data record
pub const MAX_RECORD_PAYLOAD: usize = 16 * 1024;
/// Largest record we accept from a peer
pub const MAX_RECORD_LEN: usize = MAX_RECORD_PAYLOAD + 256;

const NOISE_MIN: usize = 1024;
const NOISE_MAX: usize = 4096;
const READ_CHUNK: usize = 4096;

const CHANGE_CIPHER_SPEC: [u8; 6] = [RECORD_CHANGE_CIPHER_SPEC, 0x03, 0x03, 0x00, 0x01, 0x01];

/// Fields of a verified ClientHello
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub random: [u8; RANDOM_LEN],
    pub session_id: Vec<u8>,
    pub timestamp: u32,
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], &'static str> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| "invalid hmac key")?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Check the client's digest and timestamp.
///
/// `record` is the whole TLS record, header included.
pub fn verify_client_hello(
    record: &[u8],
    key: &[u8],
    now_unix: u64,
    max_skew: Duration,
) -> Result<ClientHello, &'static str> {
    if record.len() <= SESSION_ID_OFFSET {
        return Err("truncated client hello");
    }
    if record[0] != RECORD_HANDSHAKE {
        return Err("not a tls handshake record");
    }
    if record[RECORD_HEADER_LEN] != HANDSHAKE_CLIENT_HELLO {
        return Err("not a client hello");
    }

    let mut random = [0u8; RANDOM_LEN];
    random.copy_from_slice(&record[RANDOM_OFFSET..SESSION_ID_OFFSET]);

    let mut zeroed = record.to_vec();
    zeroed[RANDOM_OFFSET..SESSION_ID_OFFSET].fill(0);
    let digest = hmac_sha256(key, &[&zeroed])?;

    let mut check = [0u8; RANDOM_LEN];
    for (i, b) in check.iter_mut().enumerate() {
        *b = digest[i] ^ random[i];
    }
    if check[..28].iter().fold(0u8, |acc, b| acc | b) != 0 {
        return Err("client hello digest mismatch");
    }

    let timestamp = u32::from_le_bytes([check[28], check[29], check[30], check[31]]);
    if now_unix.abs_diff(u64::from(timestamp)) > max_skew.as_secs() {
        return Err("client hello timestamp out of range");
    }

    let sid_len = record[SESSION_ID_OFFSET] as usize;
    let sid_start = SESSION_ID_OFFSET + 1;
    if sid_len > MAX_SESSION_ID_LEN || record.len() < sid_start + sid_len {
        return Err("malformed session id");
    }

    Ok(ClientHello {
        random,
        session_id: record[sid_start..sid_start + sid_len].to_vec(),
        timestamp,
    })
}

/// Forge ServerHello, ChangeCipherSpec and a random application-data record
pub fn build_server_hello(key: &[u8], hello: &ClientHello) -> Result<Vec<u8>, &'static str> {
    let mut rng = rand::thread_rng();

    let mut key_share = [0u8; 32];
    rng.fill_bytes(&mut key_share);

    let mut handshake = Vec::with_capacity(128);
    handshake.extend_from_slice(&[HANDSHAKE_SERVER_HELLO, 0, 0, 0, 0x03, 0x03]);
    handshake.extend_from_slice(&[0u8; RANDOM_LEN]);
    handshake.push(hello.session_id.len() as u8);
    handshake.extend_from_slice(&hello.session_id);
    // TLS_AES_128_GCM_SHA256, no compression, 46 bytes of extensions
    handshake.extend_from_slice(&[0x13, 0x01, 0x00, 0x00, 0x2e]);
    // key_share: x25519
    handshake.extend_from_slice(&[0x00, 0x33, 0x00, 0x24, 0x00, 0x1d, 0x00, 0x20]);
    handshake.extend_from_slice(&key_share);
    // supported_versions: TLS 1.3
    handshake.extend_from_slice(&[0x00, 0x2b, 0x00, 0x02, 0x03, 0x04]);

    let body_len = handshake.len() - 4;
    handshake[1] = (body_len >> 16) as u8;
    handshake[2] = (body_len >> 8) as u8;
    handshake[3] = body_len as u8;

    let noise_len = rng.gen_range(NOISE_MIN..=NOISE_MAX);
    let mut out = Vec::with_capacity(
        RECORD_HEADER_LEN * 2 + handshake.len() + CHANGE_CIPHER_SPEC.len() + noise_len,
    );
    out.extend_from_slice(&[RECORD_HANDSHAKE, 0x03, 0x03]);
    out.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    out.extend_from_slice(&handshake);
    out.extend_from_slice(&CHANGE_CIPHER_SPEC);
    out.extend_from_slice(&[RECORD_APPLICATION_DATA, 0x03, 0x03]);
    out.extend_from_slice(&(noise_len as u16).to_be_bytes());
    let start = out.len();
    out.resize(start + noise_len, 0);
    rng.fill_bytes(&mut out[start..]);

    let digest = hmac_sha256(key, &[&hello.random, &out])?;
    out[RANDOM_OFFSET..SESSION_ID_OFFSET].copy_from_slice(&digest);
    Ok(out)
}

/// Check a ServerHello signature the way a client does
pub fn verify_server_hello(key: &[u8], client_random: &[u8; RANDOM_LEN], response: &[u8]) -> bool {
    if response.len() <= SESSION_ID_OFFSET {
        return false;
    }
    let mut zeroed = response.to_vec();
    zeroed[RANDOM_OFFSET..SESSION_ID_OFFSET].fill(0);
    match hmac_sha256(key, &[client_random, &zeroed]) {
        Ok(digest) => digest[..] == response[RANDOM_OFFSET..SESSION_ID_OFFSET],
        Err(_) => false,
    }
}

/// Forge a ClientHello record the way a client does
pub fn client_hello(
    key: &[u8],
    timestamp: u32,
    session_id: &[u8],
) -> Result<Vec<u8>, &'static str> {
    let mut handshake = Vec::with_capacity(96);
    handshake.extend_from_slice(&[HANDSHAKE_CLIENT_HELLO, 0, 0, 0, 0x03, 0x03]);
    handshake.extend_from_slice(&[0u8; RANDOM_LEN]);
    handshake.push(session_id.len() as u8);
    handshake.extend_from_slice(session_id);
    // one cipher suite, null compression, no extensions
    handshake.extend_from_slice(&[0x00, 0x02, 0x13, 0x01, 0x01, 0x00, 0x00, 0x00]);
    let body_len = handshake.len() - 4;
    handshake[1] = (body_len >> 16) as u8;
    handshake[2] = (body_len >> 8) as u8;
    handshake[3] = body_len as u8;

    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + handshake.len());
    record.extend_from_slice(&[RECORD_HANDSHAKE, 0x03, 0x01]);
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);

    let mut random = hmac_sha256(key, &[&record])?;
    for (b, t) in random[28..].iter_mut().zip(timestamp.to_le_bytes()) {
        *b ^= t;
    }
    record[RANDOM_OFFSET..SESSION_ID_OFFSET].copy_from_slice(&random);
    Ok(record)
}

pin_project! {
    /// Application-data record framing over an established fake TLS session
    pub struct FakeTlsStream<S> {
        #[pin]
        inner: S,
        records: BytesMut,
        plain: BytesMut,
        pending: PendingWrite,
    }
}

impl<S> FakeTlsStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            records: BytesMut::new(),
            plain: BytesMut::new(),
            pending: PendingWrite::default(),
        }
    }
}

/// Move the next complete record out of `records`; false if more bytes are needed
fn take_record(records: &mut BytesMut, plain: &mut BytesMut) -> io::Result<bool> {
    if records.len() < RECORD_HEADER_LEN {
        return Ok(false);
    }
    let len = u16::from_be_bytes([records[3], records[4]]) as usize;
    if len > MAX_RECORD_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized tls record"));
    }
    if records.len() < RECORD_HEADER_LEN + len {
        return Ok(false);
    }

    let record = records.split_to(RECORD_HEADER_LEN + len);
    match record[0] {
        RECORD_CHANGE_CIPHER_SPEC => {}
        RECORD_APPLICATION_DATA => plain.extend_from_slice(&record[RECORD_HEADER_LEN..]),
        RECORD_ALERT => {
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "tls alert received"));
        }
        _ => {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected tls record type"));
        }
    }
    Ok(true)
}

impl<S: AsyncRead> AsyncRead for FakeTlsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        loop {
            if !this.plain.is_empty() {
                let n = this.plain.len().min(buf.remaining());
                buf.put_slice(&this.plain[..n]);
                this.plain.advance(n);
                return Poll::Ready(Ok(()));
            }
            if take_record(this.records, this.plain)? {
                continue;
            }

            this.records.reserve(READ_CHUNK);
            let n = ready!(poll_read_buf(this.inner.as_mut(), cx, this.records))?;
            if n == 0 {
                if this.records.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated tls record",
                )));
            }
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for FakeTlsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        ready!(this.pending.poll_drain(this.inner.as_mut(), cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let chunk = &buf[..buf.len().min(MAX_RECORD_PAYLOAD)];
        let mut header = BytesMut::with_capacity(RECORD_HEADER_LEN);
        header.put_slice(&[RECORD_APPLICATION_DATA, 0x03, 0x03]);
        header.put_u16(chunk.len() as u16);
        this.pending.stage(&header);
        this.pending.stage(chunk);

        if let Poll::Ready(Err(e)) = this.pending.poll_drain(this.inner.as_mut(), cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(this.pending.poll_drain(this.inner.as_mut(), cx))?;
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(this.pending.poll_drain(this.inner.as_mut(), cx))?;
        this.inner.poll_shutdown(cx)
    }
}
