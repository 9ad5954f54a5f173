//! Client-side message framing
//!
//! Direct mode relays the decrypted byte stream untouched. Middle-proxy mode
//! has to see message boundaries, so the client stream is cut into messages
//! with the framing the client announced in its handshake tag.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::{Rng, RngCore};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use super::obfuscated2::WrappedProtocol;

/// Largest message accepted from a client
pub const MAX_MESSAGE_LEN: usize = 1 << 24;

const ABRIDGED_QUICK_ACK: u8 = 0x80;
const ABRIDGED_LONG: u8 = 0x7f;
const INTERMEDIATE_QUICK_ACK: u32 = 0x8000_0000;

/// One message read from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    pub payload: Bytes,
    /// Client asked for a quick acknowledgement
    pub quick_ack: bool,
}

/// What we write back to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Data(Bytes),
    /// Quick acknowledgement token
    QuickAck(u32),
}

/// Codec for the client's wrapped protocol
#[derive(Debug, Clone, Copy)]
pub struct ClientCodec {
    protocol: WrappedProtocol,
}

impl ClientCodec {
    pub fn new(protocol: WrappedProtocol) -> Self {
        Self { protocol }
    }

    fn decode_abridged(src: &mut BytesMut) -> io::Result<Option<ClientMessage>> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };
        let quick_ack = first & ABRIDGED_QUICK_ACK != 0;
        let short = first & !ABRIDGED_QUICK_ACK;

        let (header_len, len) = if short == ABRIDGED_LONG {
            if src.len() < 4 {
                return Ok(None);
            }
            let words = u32::from_le_bytes([src[1], src[2], src[3], 0]) as usize;
            (4, words * 4)
        } else {
            (1, short as usize * 4)
        };

        if len > MAX_MESSAGE_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "client message too large"));
        }
        if src.len() < header_len + len {
            src.reserve(header_len + len - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        Ok(Some(ClientMessage {
            payload: src.split_to(len).freeze(),
            quick_ack,
        }))
    }

    fn decode_intermediate(src: &mut BytesMut, padded: bool) -> io::Result<Option<ClientMessage>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let word = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let quick_ack = word & INTERMEDIATE_QUICK_ACK != 0;
        let len = (word & !INTERMEDIATE_QUICK_ACK) as usize;

        if len > MAX_MESSAGE_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "client message too large"));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut payload = src.split_to(len);
        if padded {
            payload.truncate(len - len % 4);
        }
        Ok(Some(ClientMessage {
            payload: payload.freeze(),
            quick_ack,
        }))
    }
}

impl Decoder for ClientCodec {
    type Item = ClientMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.protocol {
            WrappedProtocol::Abridged => Self::decode_abridged(src),
            WrappedProtocol::Intermediate => Self::decode_intermediate(src, false),
            WrappedProtocol::SecureIntermediate | WrappedProtocol::PaddedIntermediate => {
                Self::decode_intermediate(src, true)
            }
        }
    }
}

impl Encoder<Outbound> for ClientCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Outbound::QuickAck(token) => match self.protocol {
                WrappedProtocol::Abridged => dst.put_u32(token),
                _ => dst.put_u32_le(token),
            },
            Outbound::Data(payload) => match self.protocol {
                WrappedProtocol::Abridged => {
                    if payload.len() % 4 != 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "abridged message length must be a multiple of 4",
                        ));
                    }
                    let words = payload.len() / 4;
                    if words < ABRIDGED_LONG as usize {
                        dst.reserve(1 + payload.len());
                        dst.put_u8(words as u8);
                    } else {
                        dst.reserve(4 + payload.len());
                        dst.put_u8(ABRIDGED_LONG);
                        dst.put_slice(&(words as u32).to_le_bytes()[..3]);
                    }
                    dst.put_slice(&payload);
                }
                WrappedProtocol::Intermediate => {
                    dst.reserve(4 + payload.len());
                    dst.put_u32_le(payload.len() as u32);
                    dst.put_slice(&payload);
                }
                WrappedProtocol::SecureIntermediate | WrappedProtocol::PaddedIntermediate => {
                    let mut rng = rand::thread_rng();
                    let padding = rng.gen_range(0..4usize);
                    dst.reserve(4 + payload.len() + padding);
                    dst.put_u32_le((payload.len() + padding) as u32);
                    dst.put_slice(&payload);
                    let mut pad = [0u8; 3];
                    rng.fill_bytes(&mut pad[..padding]);
                    dst.put_slice(&pad[..padding]);
                }
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(protocol: WrappedProtocol) -> ClientCodec {
        ClientCodec::new(protocol)
    }

    #[test]
    fn test_abridged_short_and_quick_ack() {
        let mut c = codec(WrappedProtocol::Abridged);
        let mut src = BytesMut::from(&[0x82, 1, 2, 3, 4, 5, 6, 7, 8][..]);
        let msg = c.decode(&mut src).unwrap().unwrap();
        assert!(msg.quick_ack);
        assert_eq!(&msg.payload[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(src.is_empty());
    }

    #[test]
    fn test_abridged_long_form() {
        let mut c = codec(WrappedProtocol::Abridged);
        let payload = vec![9u8; 0x7f * 4];
        let mut dst = BytesMut::new();
        c.encode(Outbound::Data(Bytes::from(payload.clone())), &mut dst).unwrap();
        assert_eq!(&dst[..4], &[0x7f, 0x7f, 0x00, 0x00]);

        let msg = c.decode(&mut dst).unwrap().unwrap();
        assert!(!msg.quick_ack);
        assert_eq!(msg.payload.len(), payload.len());
    }

    #[test]
    fn test_abridged_waits_for_full_message() {
        let mut c = codec(WrappedProtocol::Abridged);
        let mut src = BytesMut::from(&[0x02, 1, 2, 3][..]);
        assert!(c.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&[4, 5, 6, 7, 8]);
        assert_eq!(c.decode(&mut src).unwrap().unwrap().payload.len(), 8);
    }

    #[test]
    fn test_intermediate_roundtrip_and_quick_ack_bit() {
        let mut c = codec(WrappedProtocol::Intermediate);
        let mut src = BytesMut::new();
        src.put_u32_le(0x8000_0004);
        src.put_slice(b"abcd");
        let msg = c.decode(&mut src).unwrap().unwrap();
        assert!(msg.quick_ack);
        assert_eq!(&msg.payload[..], b"abcd");

        let mut dst = BytesMut::new();
        c.encode(Outbound::Data(Bytes::from_static(b"xyz!")), &mut dst).unwrap();
        assert_eq!(&dst[..], &[4, 0, 0, 0, b'x', b'y', b'z', b'!']);
    }

    #[test]
    fn test_padded_strips_padding() {
        let mut c = codec(WrappedProtocol::SecureIntermediate);
        let mut src = BytesMut::new();
        src.put_u32_le(7);
        src.put_slice(b"abcdXYZ");
        let msg = c.decode(&mut src).unwrap().unwrap();
        assert_eq!(&msg.payload[..], b"abcd");
    }

    #[test]
    fn test_padded_encode_adds_at_most_three_bytes() {
        let mut c = codec(WrappedProtocol::PaddedIntermediate);
        for _ in 0..32 {
            let mut dst = BytesMut::new();
            c.encode(Outbound::Data(Bytes::from_static(b"12345678")), &mut dst).unwrap();
            let len = u32::from_le_bytes([dst[0], dst[1], dst[2], dst[3]]) as usize;
            assert!((8..=11).contains(&len));
            assert_eq!(dst.len(), 4 + len);
            let msg = c.decode(&mut dst).unwrap().unwrap();
            assert_eq!(&msg.payload[..], b"12345678");
        }
    }

    #[test]
    fn test_quick_ack_byte_order() {
        let mut dst = BytesMut::new();
        codec(WrappedProtocol::Abridged)
            .encode(Outbound::QuickAck(0x8000_0001), &mut dst)
            .unwrap();
        assert_eq!(&dst[..], &[0x80, 0, 0, 1]);

        let mut dst = BytesMut::new();
        codec(WrappedProtocol::Intermediate)
            .encode(Outbound::QuickAck(0x8000_0001), &mut dst)
            .unwrap();
        assert_eq!(&dst[..], &[1, 0, 0, 0x80]);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut c = codec(WrappedProtocol::Intermediate);
        let mut src = BytesMut::new();
        src.put_u32_le((MAX_MESSAGE_LEN + 1) as u32);
        assert!(c.decode(&mut src).is_err());
    }
}
