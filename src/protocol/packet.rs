//! Packet framing: `[len: u24 LE][seq: u8][payload]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FramingError;

/// Size of the packet header (3-byte length + 1-byte sequence id).
pub const HEADER_LEN: usize = 4;

/// Largest payload a single packet can carry (16 MiB - 1).
pub const MAX_PAYLOAD_LEN: usize = 0x00FF_FFFF;

/// One framed protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub seq: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(seq: u8, payload: impl Into<Bytes>) -> Self {
        Self { seq, payload: payload.into() }
    }
}

/// Prepends the 4-byte header to `payload`.
///
/// Fails when the payload does not fit in one packet; splitting large
/// payloads across sequenced packets is left to the caller.
pub fn encode_packet(seq: u8, payload: &[u8]) -> Result<Bytes, FramingError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    put_packet(&mut buf, seq, payload)?;
    Ok(buf.freeze())
}

fn put_packet(dst: &mut BytesMut, seq: u8, payload: &[u8]) -> Result<(), FramingError> {
    let len = payload.len();
    if len > MAX_PAYLOAD_LEN {
        return Err(FramingError::PayloadTooLarge { len, max: MAX_PAYLOAD_LEN });
    }
    dst.reserve(HEADER_LEN + len);
    dst.put_u8((len & 0xFF) as u8);
    dst.put_u8(((len >> 8) & 0xFF) as u8);
    dst.put_u8(((len >> 16) & 0xFF) as u8);
    dst.put_u8(seq);
    dst.put_slice(payload);
    Ok(())
}

/// Stream codec for [`Packet`]s, used through `tokio_util::codec::Framed`.
#[derive(Clone, Debug)]
pub struct PacketCodec {
    max_payload: usize,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self { max_payload: MAX_PAYLOAD_LEN }
    }

    /// Codec that refuses inbound payloads larger than `max_payload`.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload: max_payload.min(MAX_PAYLOAD_LEN) }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, FramingError> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let len = u32::from_le_bytes([src[0], src[1], src[2], 0]) as usize;
        if len > self.max_payload {
            return Err(FramingError::PayloadTooLarge { len, max: self.max_payload });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let seq = src[3];
        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Packet { seq, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, FramingError> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(FramingError::Truncated { buffered: src.len() }),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), FramingError> {
        put_packet(dst, item.seq, &item.payload)
    }
}

// ---------------------------------------------------------------------------
// Length-encoded integers and strings
// ---------------------------------------------------------------------------

/// First byte of a length-encoded value that stands for SQL NULL.
pub const NULL_MARKER: u8 = 0xFB;

pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 1 << 16 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 1 << 24 {
        buf.put_u8(0xFD);
        buf.put_u8((value & 0xFF) as u8);
        buf.put_u8(((value >> 8) & 0xFF) as u8);
        buf.put_u8(((value >> 16) & 0xFF) as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

pub fn put_lenenc_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    put_lenenc_int(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn put_lenenc_str(buf: &mut BytesMut, s: &str) {
    put_lenenc_bytes(buf, s.as_bytes());
}

/// Reads a length-encoded integer, advancing `buf`. `None` on short input
/// or on the NULL marker.
pub fn get_lenenc_int(buf: &mut &[u8]) -> Option<u64> {
    let first = *buf.first()?;
    let width = match first {
        0..=250 => {
            buf.advance(1);
            return Some(u64::from(first));
        }
        0xFC => 2,
        0xFD => 3,
        0xFE => 8,
        _ => return None,
    };
    if buf.len() < 1 + width {
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes[..width].copy_from_slice(&buf[1..1 + width]);
    buf.advance(1 + width);
    Some(u64::from_le_bytes(bytes))
}

pub fn get_lenenc_bytes<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = get_lenenc_int(buf)? as usize;
    if buf.len() < len {
        return None;
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Some(head)
}

/// Reads a NUL-terminated string, advancing past the terminator.
pub fn get_null_terminated<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    let end = buf.iter().position(|b| *b == 0)?;
    let (head, tail) = buf.split_at(end);
    *buf = &tail[1..];
    Some(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_little_endian_length_then_sequence() {
        let bytes = encode_packet(3, &[0xAA; 300]).unwrap();
        assert_eq!(&bytes[..4], &[0x2C, 0x01, 0x00, 3]);
        assert_eq!(bytes.len(), 304);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(
            encode_packet(0, &payload),
            Err(FramingError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn decoder_waits_for_full_packet() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[5, 0]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[0, 7, b'h', b'e']);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"llo");
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.seq, 7);
        assert_eq!(&packet.payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn decoder_splits_back_to_back_packets() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_packet(0, b"\x03select 1").unwrap());
        buf.extend_from_slice(&encode_packet(1, b"").unwrap());
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first.payload[..], b"\x03select 1");
        assert_eq!(second.seq, 1);
        assert!(second.payload.is_empty());
    }

    #[test]
    fn eof_mid_packet_is_truncation() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(&[10u8, 0, 0, 0, b'x'][..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FramingError::Truncated { buffered: 5 })
        ));
        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn inbound_limit_is_enforced() {
        let mut codec = PacketCodec::with_max_payload(4);
        let mut buf = BytesMut::from(&[5u8, 0, 0, 0][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn lenenc_int_widths() {
        for (value, width) in [(0u64, 1), (250, 1), (251, 3), (65_535, 3), (65_536, 4), (1 << 24, 9)] {
            let mut buf = BytesMut::new();
            put_lenenc_int(&mut buf, value);
            assert_eq!(buf.len(), width, "value {}", value);
            let mut slice = &buf[..];
            assert_eq!(get_lenenc_int(&mut slice), Some(value));
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn null_marker_is_not_an_integer() {
        let mut slice: &[u8] = &[NULL_MARKER];
        assert_eq!(get_lenenc_int(&mut slice), None);
    }

    #[test]
    fn null_terminated_strings() {
        let mut slice: &[u8] = b"root\0rest";
        assert_eq!(get_null_terminated(&mut slice), Some(&b"root"[..]));
        assert_eq!(slice, b"rest");
        assert_eq!(get_null_terminated(&mut slice), None);
    }
}
