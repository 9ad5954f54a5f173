//! Keystream cipher pair
//!
//! Every session owns two independent AES-256-CTR keystreams: one decrypts
//! what the peer sends, the other encrypts what we send back. Keystream
//! positions only ever advance.

use aes::Aes256;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};
use pin_project_lite::pin_project;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// AES-256 key length
pub const KEY_LEN: usize = 32;
/// CTR initial counter block length
pub const IV_LEN: usize = 16;

/// One direction of a session's keystream
pub struct KeystreamCipher {
    inner: Aes256Ctr,
}

impl KeystreamCipher {
    pub fn new(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Self {
        Self {
            inner: Aes256Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(iv)),
        }
    }

    /// XOR the next `data.len()` keystream bytes into `data`
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }
}

impl fmt::Debug for KeystreamCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeystreamCipher { .. }")
    }
}

/// Read/write keystreams of one connection
#[derive(Debug)]
pub struct CipherPair {
    /// Applied to bytes read from the peer
    pub decryptor: KeystreamCipher,
    /// Applied to bytes written to the peer
    pub encryptor: KeystreamCipher,
}

/// Bytes accepted by `poll_write` but not yet handed to the inner writer.
///
/// Framing wrappers transform data before it reaches the socket, so once a
/// write is acknowledged the transformed bytes have to be kept until the
/// inner writer takes them.
#[derive(Debug, Default)]
pub(crate) struct PendingWrite {
    buf: Vec<u8>,
    pos: usize,
}

impl PendingWrite {
    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Append `data` and return the freshly staged slice for in-place transforms
    pub(crate) fn stage(&mut self, data: &[u8]) -> &mut [u8] {
        let start = self.buf.len();
        self.buf.extend_from_slice(data);
        &mut self.buf[start..]
    }

    pub(crate) fn poll_drain<W>(
        &mut self,
        mut writer: Pin<&mut W>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>>
    where
        W: AsyncWrite + ?Sized,
    {
        while self.pos < self.buf.len() {
            let n = ready!(writer.as_mut().poll_write(cx, &self.buf[self.pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pos += n;
        }
        self.buf.clear();
        self.pos = 0;
        Poll::Ready(Ok(()))
    }
}

pin_project! {
    /// Stream that decrypts on read and encrypts on write
    pub struct CipherStream<S> {
        #[pin]
        inner: S,
        decryptor: KeystreamCipher,
        encryptor: KeystreamCipher,
        pending: PendingWrite,
    }
}

impl<S> CipherStream<S> {
    pub fn new(inner: S, pair: CipherPair) -> Self {
        Self {
            inner,
            decryptor: pair.decryptor,
            encryptor: pair.encryptor,
            pending: PendingWrite::default(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        this.decryptor.apply(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite> AsyncWrite for CipherStream<S> {
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

        let staged = this.pending.stage(buf);
        this.encryptor.apply(staged);

        // Bytes are ours now; a pending drain is finished by the next write or flush.
        if let Poll::Ready(Err(e)) = this.pending.poll_drain(this.inner.as_mut(), cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair(key: u8, iv: u8) -> CipherPair {
        CipherPair {
            decryptor: KeystreamCipher::new(&[key; 32], &[iv; 16]),
            encryptor: KeystreamCipher::new(&[key.wrapping_add(1); 32], &[iv; 16]),
        }
    }

    #[test]
    fn test_keystream_is_positional() {
        let mut whole = KeystreamCipher::new(&[7; 32], &[9; 16]);
        let mut split = KeystreamCipher::new(&[7; 32], &[9; 16]);

        let mut a = [0u8; 40];
        whole.apply(&mut a);

        let mut b = [0u8; 40];
        split.apply(&mut b[..13]);
        split.apply(&mut b[13..]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_keystream_apply_twice_restores() {
        let mut enc = KeystreamCipher::new(&[1; 32], &[2; 16]);
        let mut dec = KeystreamCipher::new(&[1; 32], &[2; 16]);
        let mut data = *b"relay bytes in order";
        enc.apply(&mut data);
        assert_ne!(&data, b"relay bytes in order");
        dec.apply(&mut data);
        assert_eq!(&data, b"relay bytes in order");
    }

    #[tokio::test]
    async fn test_cipher_stream_roundtrip() {
        let (a, b) = tokio::io::duplex(64);
        // a encrypts with key 2, b decrypts with key 2
        let mut left = CipherStream::new(a, pair(1, 0));
        let mut right = CipherStream::new(
            b,
            CipherPair {
                decryptor: KeystreamCipher::new(&[2; 32], &[0; 16]),
                encryptor: KeystreamCipher::new(&[1; 32], &[0; 16]),
            },
        );

        let payload: Vec<u8> = (0..200u8).collect();
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                left.write_all(&payload).await.unwrap();
                left.flush().await.unwrap();
                let mut back = [0u8; 5];
                left.read_exact(&mut back).await.unwrap();
                back
            })
        };

        let mut got = vec![0u8; payload.len()];
        right.read_exact(&mut got).await.unwrap();
        assert_eq!(got, payload);

        right.write_all(b"hello").await.unwrap();
        right.flush().await.unwrap();
        assert_eq!(&writer.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_cipher_stream_wire_is_encrypted() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut left = CipherStream::new(a, pair(3, 4));
        left.write_all(b"plaintext").await.unwrap();
        left.flush().await.unwrap();

        let mut wire = [0u8; 9];
        b.read_exact(&mut wire).await.unwrap();
        assert_ne!(&wire, b"plaintext");

        let mut dec = KeystreamCipher::new(&[4; 32], &[4; 16]);
        dec.apply(&mut wire);
        assert_eq!(&wire, b"plaintext");
    }

    #[test]
    fn test_pending_write_stage() {
        let mut pending = PendingWrite::default();
        assert!(pending.is_empty());
        pending.stage(b"ab").copy_from_slice(b"xy");
        assert!(!pending.is_empty());
        assert_eq!(pending.buf, b"xy");
    }
}
