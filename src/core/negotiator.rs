//! Protocol negotiator
//!
//! Classifies a freshly accepted connection. A successful negotiation yields
//! the decrypting/encrypting client stream and the validated header; every
//! other outcome hands the raw stream back together with the bytes consumed
//! so far, so the caller can close silently or replay them to a decoy.

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::cipher::CipherStream;
use super::faketls::{self, FakeTlsStream, MAX_RECORD_LEN, RECORD_HANDSHAKE, RECORD_HEADER_LEN};
use super::obfuscated2::{self, HandshakeHeader, HANDSHAKE_LEN};
use super::replay::{fingerprint, ReplayGuard};
use super::secret::{Secret, SecretMode};
use crate::error::NegotiationError;
use crate::transport::TransportStream;

/// Successfully negotiated client
pub struct Negotiated {
    /// Plaintext view of the client connection
    pub stream: CipherStream<TransportStream>,
    pub header: HandshakeHeader,
}

/// Failed negotiation
pub struct Rejection {
    pub error: NegotiationError,
    /// The client connection, for fallback handling
    pub stream: TransportStream,
    /// Bytes read from the client so far. `None` once we have written
    /// anything, since a decoy can no longer take over transparently.
    pub prefix: Option<Bytes>,
}

impl Rejection {
    fn new(error: NegotiationError, stream: TransportStream, prefix: Option<Bytes>) -> Self {
        Self {
            error,
            stream,
            prefix,
        }
    }
}

/// Handshake classifier bound to one secret and one replay guard
pub struct Negotiator {
    secret: Secret,
    replay: Arc<ReplayGuard>,
    tls_time_skew: Duration,
}

impl Negotiator {
    pub fn new(secret: Secret, replay: Arc<ReplayGuard>, tls_time_skew: Duration) -> Self {
        Self {
            secret,
            replay,
            tls_time_skew,
        }
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    pub fn mode(&self) -> SecretMode {
        self.secret.mode
    }

    /// Classify the connection. The replay check always runs before this returns.
    pub async fn negotiate(&self, stream: TransportStream) -> Result<Negotiated, Rejection> {
        match self.secret.mode {
            SecretMode::Simple | SecretMode::Secure => self.negotiate_obfuscated(stream).await,
            SecretMode::Tls => self.negotiate_tls(stream).await,
        }
    }

    async fn negotiate_obfuscated(
        &self,
        mut stream: TransportStream,
    ) -> Result<Negotiated, Rejection> {
        let mut raw = [0u8; HANDSHAKE_LEN];
        if let Err(e) = stream.read_exact(&mut raw).await {
            return Err(Rejection::new(e.into(), stream, None));
        }
        let prefix = Some(Bytes::copy_from_slice(&raw));

        let decoded =
            obfuscated2::decode_client_header(&raw, Some(&self.secret.key), self.secret.mode);
        let (header, pair) = match decoded {
            Ok(decoded) => decoded,
            Err(reason) => {
                return Err(Rejection::new(
                    NegotiationError::NotOurs(reason),
                    stream,
                    prefix,
                ))
            }
        };
        if !self.replay.admit(header.fingerprint()) {
            return Err(Rejection::new(NegotiationError::Replayed, stream, prefix));
        }

        Ok(Negotiated {
            stream: CipherStream::new(stream, pair),
            header,
        })
    }

    async fn negotiate_tls(&self, mut stream: TransportStream) -> Result<Negotiated, Rejection> {
        let mut head = [0u8; RECORD_HEADER_LEN];
        if let Err(e) = stream.read_exact(&mut head).await {
            return Err(Rejection::new(e.into(), stream, None));
        }
        if head[..3] != [RECORD_HANDSHAKE, 0x03, 0x01] {
            let prefix = Some(Bytes::copy_from_slice(&head));
            return Err(Rejection::new(
                NegotiationError::NotOurs("not a tls handshake record"),
                stream,
                prefix,
            ));
        }
        let len = u16::from_be_bytes([head[3], head[4]]) as usize;
        if len > MAX_RECORD_LEN {
            let prefix = Some(Bytes::copy_from_slice(&head));
            return Err(Rejection::new(
                NegotiationError::NotOurs("oversized tls record"),
                stream,
                prefix,
            ));
        }

        let mut record = vec![0u8; RECORD_HEADER_LEN + len];
        record[..RECORD_HEADER_LEN].copy_from_slice(&head);
        if let Err(e) = stream.read_exact(&mut record[RECORD_HEADER_LEN..]).await {
            return Err(Rejection::new(e.into(), stream, None));
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let verified =
            faketls::verify_client_hello(&record, &self.secret.key, now, self.tls_time_skew);
        let hello = match verified {
            Ok(hello) => hello,
            Err(reason) => {
                return Err(Rejection::new(
                    NegotiationError::NotOurs(reason),
                    stream,
                    Some(Bytes::from(record)),
                ))
            }
        };
        if !self.replay.admit(fingerprint(&hello.random)) {
            return Err(Rejection::new(
                NegotiationError::Replayed,
                stream,
                Some(Bytes::from(record)),
            ));
        }

        let response = match faketls::build_server_hello(&self.secret.key, &hello) {
            Ok(response) => response,
            Err(reason) => {
                return Err(Rejection::new(
                    NegotiationError::NotOurs(reason),
                    stream,
                    None,
                ))
            }
        };
        if let Err(e) = write_all_flush(&mut stream, &response).await {
            return Err(Rejection::new(e.into(), stream, None));
        }

        let mut tls: TransportStream = Box::pin(FakeTlsStream::new(stream));
        let mut raw = [0u8; HANDSHAKE_LEN];
        if let Err(e) = tls.read_exact(&mut raw).await {
            return Err(Rejection::new(e.into(), tls, None));
        }
        match obfuscated2::decode_client_header(&raw, Some(&self.secret.key), SecretMode::Tls) {
            Ok((header, pair)) => Ok(Negotiated {
                stream: CipherStream::new(tls, pair),
                header,
            }),
            Err(reason) => Err(Rejection::new(NegotiationError::NotOurs(reason), tls, None)),
        }
    }
}

async fn write_all_flush(stream: &mut TransportStream, data: &[u8]) -> std::io::Result<()> {
    stream.write_all(data).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::obfuscated2::{generate_client_header, WrappedProtocol};
    use crate::core::replay::{EvictionPolicy, ReplayConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const KEY: [u8; 16] = [0x21; 16];

    fn guard() -> Arc<ReplayGuard> {
        Arc::new(ReplayGuard::new(ReplayConfig {
            capacity: 1024,
            window: Duration::from_secs(60),
            policy: EvictionPolicy::Ttl,
        }))
    }

    fn tls_negotiator() -> Negotiator {
        Negotiator::new(Secret::tls(KEY, "example.com"), guard(), Duration::from_secs(5))
    }

    fn pipe() -> (TransportStream, DuplexStream) {
        let (server, client) = tokio::io::duplex(16 * 1024);
        (Box::pin(server), client)
    }

    fn unix_now() -> u32 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32
    }

    #[tokio::test]
    async fn test_simple_mode_success() {
        let negotiator = Negotiator::new(Secret::simple(KEY), guard(), Duration::from_secs(5));
        let (server, mut client) = pipe();

        let (raw, mut pair) = generate_client_header(WrappedProtocol::Intermediate, 2, Some(&KEY));
        let mut data = *b"\x04\x00\x00\x00ping";
        pair.encryptor.apply(&mut data);
        client.write_all(&raw).await.unwrap();
        client.write_all(&data).await.unwrap();

        let mut negotiated = negotiator.negotiate(server).await.ok().unwrap();
        assert_eq!(negotiated.header.protocol, WrappedProtocol::Intermediate);
        assert_eq!(negotiated.header.datacenter, 2);

        let mut plain = [0u8; 8];
        negotiated.stream.read_exact(&mut plain).await.unwrap();
        assert_eq!(&plain, b"\x04\x00\x00\x00ping");
    }

    #[tokio::test]
    async fn test_replayed_header_rejected() {
        let negotiator = Negotiator::new(Secret::simple(KEY), guard(), Duration::from_secs(5));
        let (raw, _) = generate_client_header(WrappedProtocol::Abridged, 1, Some(&KEY));

        let (server, mut client) = pipe();
        client.write_all(&raw).await.unwrap();
        assert!(negotiator.negotiate(server).await.is_ok());

        let (server, mut client) = pipe();
        client.write_all(&raw).await.unwrap();
        let rejection = negotiator.negotiate(server).await.err().unwrap();
        assert!(matches!(rejection.error, NegotiationError::Replayed));
        assert_eq!(rejection.prefix.as_deref(), Some(&raw[..]));
    }

    #[tokio::test]
    async fn test_reserved_byte_is_not_ours() {
        let negotiator = Negotiator::new(Secret::simple(KEY), guard(), Duration::from_secs(5));
        let (server, mut client) = pipe();
        let mut garbage = [0x55u8; 64];
        garbage[0] = 0xef;
        client.write_all(&garbage).await.unwrap();

        let rejection = negotiator.negotiate(server).await.err().unwrap();
        assert!(matches!(rejection.error, NegotiationError::NotOurs(_)));
    }

    #[tokio::test]
    async fn test_short_input_is_io_error() {
        let negotiator = Negotiator::new(Secret::simple(KEY), guard(), Duration::from_secs(5));
        let (server, mut client) = pipe();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        let rejection = negotiator.negotiate(server).await.err().unwrap();
        assert!(matches!(rejection.error, NegotiationError::Io(_)));
        assert!(rejection.prefix.is_none());
    }

    #[tokio::test]
    async fn test_secure_mode_requires_padded_tag() {
        let negotiator = Negotiator::new(Secret::secure(KEY), guard(), Duration::from_secs(5));
        let (server, mut client) = pipe();
        let (raw, _) = generate_client_header(WrappedProtocol::Intermediate, 2, Some(&KEY));
        client.write_all(&raw).await.unwrap();

        let rejection = negotiator.negotiate(server).await.err().unwrap();
        assert!(matches!(rejection.error, NegotiationError::NotOurs("unsupported protocol tag")));
    }

    #[tokio::test]
    async fn test_tls_mode_full_handshake() {
        let negotiator = tls_negotiator();
        let (server, client) = pipe();

        let client_task = tokio::spawn(async move {
            let mut client = client;
            let hello = faketls::client_hello(&KEY, unix_now(), &[1u8; 32]).unwrap();
            client.write_all(&hello).await.unwrap();

            // ServerHello record, CCS and noise record
            let mut response = Vec::new();
            for _ in 0..3 {
                let mut head = [0u8; 5];
                client.read_exact(&mut head).await.unwrap();
                let len = u16::from_be_bytes([head[3], head[4]]) as usize;
                let mut body = vec![0u8; len];
                client.read_exact(&mut body).await.unwrap();
                response.extend_from_slice(&head);
                response.extend_from_slice(&body);
            }
            let mut random = [0u8; 32];
            random.copy_from_slice(&hello[11..43]);
            assert!(faketls::verify_server_hello(&KEY, &random, &response));

            let mut tls = FakeTlsStream::new(client);
            let (raw, _) =
                generate_client_header(WrappedProtocol::SecureIntermediate, -2, Some(&KEY));
            tls.write_all(&raw).await.unwrap();
            tls.flush().await.unwrap();
            tls
        });

        let negotiated = negotiator.negotiate(server).await.ok().unwrap();
        assert_eq!(negotiated.header.protocol, WrappedProtocol::SecureIntermediate);
        assert_eq!(negotiated.header.datacenter, -2);
        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_tls_mode_plain_http_keeps_prefix() {
        let negotiator = tls_negotiator();
        let (server, mut client) = pipe();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let rejection = negotiator.negotiate(server).await.err().unwrap();
        assert!(matches!(rejection.error, NegotiationError::NotOurs(_)));
        assert_eq!(rejection.prefix.as_deref(), Some(&b"GET /"[..]));
    }

    #[tokio::test]
    async fn test_tls_mode_bad_digest_keeps_record() {
        let negotiator = tls_negotiator();
        let (server, mut client) = pipe();
        let hello = faketls::client_hello(&[0x99; 16], unix_now(), &[]).unwrap();
        client.write_all(&hello).await.unwrap();

        let rejection = negotiator.negotiate(server).await.err().unwrap();
        assert!(matches!(
            rejection.error,
            NegotiationError::NotOurs("client hello digest mismatch")
        ));
        assert_eq!(rejection.prefix.as_deref(), Some(&hello[..]));
    }

    #[tokio::test]
    async fn test_tls_mode_replayed_hello() {
        let negotiator = tls_negotiator();
        let hello = faketls::client_hello(&KEY, unix_now(), &[4u8; 32]).unwrap();

        // first attempt gets as far as the inner header, then the client goes away
        let (server, mut client) = pipe();
        client.write_all(&hello).await.unwrap();
        let first = tokio::spawn(async move { read_then_hang_up(client).await });
        let _ = negotiator.negotiate(server).await;
        first.await.unwrap();

        let (server, mut client) = pipe();
        client.write_all(&hello).await.unwrap();
        let rejection = negotiator.negotiate(server).await.err().unwrap();
        assert!(matches!(rejection.error, NegotiationError::Replayed));
    }

    async fn read_then_hang_up(mut client: DuplexStream) {
        let mut buf = [0u8; 64];
        let _ = client.read(&mut buf).await;
        drop(client);
    }
}
