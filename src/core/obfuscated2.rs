//! Obfuscated2 handshake header
//!
//! A 64-byte block opens every connection:
//!
//! ```text
//! 0        8                     40            56      60    62    64
//! | random | key (32)            | iv (16)     | tag   | dc  | rnd |
//! ```
//!
//! Bytes 56..64 only have meaning after decryption. The reverse direction's
//! key and IV are bytes 8..56 read backwards.

use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

use super::cipher::{CipherPair, KeystreamCipher, IV_LEN, KEY_LEN};
use super::replay::{fingerprint, Fingerprint};
use super::secret::SecretMode;

/// Size of the handshake header
pub const HANDSHAKE_LEN: usize = 64;

const KEY_OFFSET: usize = 8;
const IV_OFFSET: usize = KEY_OFFSET + KEY_LEN;
const TAG_OFFSET: usize = IV_OFFSET + IV_LEN;
const DC_OFFSET: usize = TAG_OFFSET + 4;

const TAG_ABRIDGED: [u8; 4] = [0xef, 0xef, 0xef, 0xef];
const TAG_INTERMEDIATE: [u8; 4] = [0xee, 0xee, 0xee, 0xee];
const TAG_PADDED: [u8; 4] = [0xdd, 0xdd, 0xdd, 0xdd];

/// Leading words a header may never start with
const RESERVED_PREFIXES: [[u8; 4]; 7] = [
    *b"HEAD",
    *b"POST",
    *b"GET ",
    *b"OPTI",
    [0x16, 0x03, 0x01, 0x02],
    TAG_PADDED,
    TAG_INTERMEDIATE,
];

/// Framing the client speaks inside the obfuscated stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrappedProtocol {
    Abridged,
    Intermediate,
    SecureIntermediate,
    PaddedIntermediate,
}

impl WrappedProtocol {
    /// Wire tag announcing this protocol
    pub fn tag(&self) -> [u8; 4] {
        match self {
            WrappedProtocol::Abridged => TAG_ABRIDGED,
            WrappedProtocol::Intermediate => TAG_INTERMEDIATE,
            WrappedProtocol::SecureIntermediate | WrappedProtocol::PaddedIntermediate => TAG_PADDED,
        }
    }

    /// Map a decrypted tag to a protocol, honoring what the secret mode allows
    pub fn from_tag(tag: [u8; 4], mode: SecretMode) -> Option<Self> {
        let protocol = match tag {
            TAG_ABRIDGED => WrappedProtocol::Abridged,
            TAG_INTERMEDIATE => WrappedProtocol::Intermediate,
            TAG_PADDED if mode == SecretMode::Simple => WrappedProtocol::PaddedIntermediate,
            TAG_PADDED => WrappedProtocol::SecureIntermediate,
            _ => return None,
        };
        if mode == SecretMode::Secure && protocol != WrappedProtocol::SecureIntermediate {
            return None;
        }
        Some(protocol)
    }

    /// Frames carry 0-3 random trailing bytes
    pub fn is_padded(&self) -> bool {
        matches!(
            self,
            WrappedProtocol::SecureIntermediate | WrappedProtocol::PaddedIntermediate
        )
    }
}

impl fmt::Display for WrappedProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WrappedProtocol::Abridged => write!(f, "abridged"),
            WrappedProtocol::Intermediate => write!(f, "intermediate"),
            WrappedProtocol::SecureIntermediate => write!(f, "secure"),
            WrappedProtocol::PaddedIntermediate => write!(f, "padded"),
        }
    }
}

/// Validated client handshake
#[derive(Clone)]
pub struct HandshakeHeader {
    raw: [u8; HANDSHAKE_LEN],
    /// Client to proxy key and IV
    pub forward_key: [u8; KEY_LEN],
    pub forward_iv: [u8; IV_LEN],
    /// Proxy to client key and IV
    pub reverse_key: [u8; KEY_LEN],
    pub reverse_iv: [u8; IV_LEN],
    pub protocol: WrappedProtocol,
    pub datacenter: i16,
}

impl HandshakeHeader {
    /// Header bytes as received
    pub fn raw(&self) -> &[u8; HANDSHAKE_LEN] {
        &self.raw
    }

    /// Anti-replay fingerprint over the key and IV material
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint(&self.raw[KEY_OFFSET..TAG_OFFSET])
    }
}

impl fmt::Debug for HandshakeHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeHeader")
            .field("protocol", &self.protocol)
            .field("datacenter", &self.datacenter)
            .finish_non_exhaustive()
    }
}

/// Header collides with a value another protocol or framing could start with
pub fn is_reserved(raw: &[u8; HANDSHAKE_LEN]) -> bool {
    raw[0] == 0xef
        || RESERVED_PREFIXES.iter().any(|p| raw[..4] == p[..])
        || raw[4..8].iter().all(|b| *b == 0)
}

struct DerivedKeys {
    forward_key: [u8; KEY_LEN],
    forward_iv: [u8; IV_LEN],
    reverse_key: [u8; KEY_LEN],
    reverse_iv: [u8; IV_LEN],
}

fn derive_keys(raw: &[u8; HANDSHAKE_LEN], secret: Option<&[u8]>) -> DerivedKeys {
    let mut forward_key = [0u8; KEY_LEN];
    let mut forward_iv = [0u8; IV_LEN];
    forward_key.copy_from_slice(&raw[KEY_OFFSET..IV_OFFSET]);
    forward_iv.copy_from_slice(&raw[IV_OFFSET..TAG_OFFSET]);

    let mut reversed = [0u8; KEY_LEN + IV_LEN];
    reversed.copy_from_slice(&raw[KEY_OFFSET..TAG_OFFSET]);
    reversed.reverse();
    let mut reverse_key = [0u8; KEY_LEN];
    let mut reverse_iv = [0u8; IV_LEN];
    reverse_key.copy_from_slice(&reversed[..KEY_LEN]);
    reverse_iv.copy_from_slice(&reversed[KEY_LEN..]);

    if let Some(secret) = secret {
        forward_key = mix_secret(&forward_key, secret);
        reverse_key = mix_secret(&reverse_key, secret);
    }

    DerivedKeys {
        forward_key,
        forward_iv,
        reverse_key,
        reverse_iv,
    }
}

fn mix_secret(key: &[u8; KEY_LEN], secret: &[u8]) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(secret);
    hasher.finalize().into()
}

/// Decode a header received from a client.
///
/// The returned decryptor has consumed the first 64 keystream bytes, so it
/// continues exactly where the client's encryptor left off.
pub fn decode_client_header(
    raw: &[u8; HANDSHAKE_LEN],
    secret: Option<&[u8]>,
    mode: SecretMode,
) -> Result<(HandshakeHeader, CipherPair), &'static str> {
    if is_reserved(raw) {
        return Err("reserved header prefix");
    }

    let keys = derive_keys(raw, secret);
    let mut decryptor = KeystreamCipher::new(&keys.forward_key, &keys.forward_iv);
    let encryptor = KeystreamCipher::new(&keys.reverse_key, &keys.reverse_iv);

    let mut plain = *raw;
    decryptor.apply(&mut plain);

    let mut tag = [0u8; 4];
    tag.copy_from_slice(&plain[TAG_OFFSET..DC_OFFSET]);
    let protocol = WrappedProtocol::from_tag(tag, mode).ok_or("unsupported protocol tag")?;
    let datacenter = i16::from_le_bytes([plain[DC_OFFSET], plain[DC_OFFSET + 1]]);

    let header = HandshakeHeader {
        raw: *raw,
        forward_key: keys.forward_key,
        forward_iv: keys.forward_iv,
        reverse_key: keys.reverse_key,
        reverse_iv: keys.reverse_iv,
        protocol,
        datacenter,
    };
    Ok((header, CipherPair { decryptor, encryptor }))
}

/// Build a fresh header as the connecting side.
///
/// Returns the bytes to put on the wire and the pair to use afterwards:
/// the encryptor is positioned after the header, the decryptor reads the
/// peer's answer.
pub fn generate_client_header(
    protocol: WrappedProtocol,
    datacenter: i16,
    secret: Option<&[u8]>,
) -> ([u8; HANDSHAKE_LEN], CipherPair) {
    let mut rng = rand::thread_rng();
    let mut raw = [0u8; HANDSHAKE_LEN];
    loop {
        rng.fill_bytes(&mut raw);
        if !is_reserved(&raw) {
            break;
        }
    }
    raw[TAG_OFFSET..DC_OFFSET].copy_from_slice(&protocol.tag());
    raw[DC_OFFSET..DC_OFFSET + 2].copy_from_slice(&datacenter.to_le_bytes());

    let keys = derive_keys(&raw, secret);
    let mut encryptor = KeystreamCipher::new(&keys.forward_key, &keys.forward_iv);
    let decryptor = KeystreamCipher::new(&keys.reverse_key, &keys.reverse_iv);

    let mut encrypted = raw;
    encryptor.apply(&mut encrypted);
    raw[TAG_OFFSET..].copy_from_slice(&encrypted[TAG_OFFSET..]);

    (raw, CipherPair { decryptor, encryptor })
}
