//! Length-prefixed frame format.
//!
//! Every message after the greeting is laid out as:
//!
//! ```text
//! +-------------------+---------------+-------------+
//! | length (MP uint)  | header (MP    | body (MP    |
//! | 1, 2, 3, 5 or 9 B | map)          | map, opt.)  |
//! +-------------------+---------------+-------------+
//!                     |<------- length bytes ------>|
//! ```
//!
//! The encoder always writes the 5-byte `0xce` form so the prefix size is
//! fixed; the decoder accepts every MessagePack unsigned integer form.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix written by [`Frame::encode`].
pub const LENGTH_PREFIX_SIZE: usize = 5;

const MARKER_U8: u8 = 0xcc;
const MARKER_U16: u8 = 0xcd;
const MARKER_U32: u8 = 0xce;
const MARKER_U64: u8 = 0xcf;

/// A raw frame: the bytes covered by the length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Encoded header map followed by the encoded body map.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: len as u64,
                max: MAX_PAYLOAD_SIZE as u64,
            });
        }
        buf.reserve(LENGTH_PREFIX_SIZE + len);
        buf.put_u8(MARKER_U32);
        buf.put_u32(len as u32);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        Self::decode_with_limit(buf, MAX_PAYLOAD_SIZE as u64)
    }

    /// Like [`Frame::decode`], rejecting frames whose payload exceeds
    /// `max_payload` bytes.
    pub fn decode_with_limit(
        buf: &mut BytesMut,
        max_payload: u64,
    ) -> Result<Option<Self>, ProtocolError> {
        let (prefix_len, payload_len) = match peek_length(buf)? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };

        if payload_len > max_payload {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: max_payload,
            });
        }

        let payload_len = payload_len as usize;
        if buf.len() < prefix_len + payload_len {
            return Ok(None);
        }

        buf.advance(prefix_len);
        let payload = buf.split_to(payload_len).freeze();
        Ok(Some(Self { payload }))
    }
}

/// Parses the MessagePack unsigned length at the start of `buf` without
/// consuming it. Returns `(prefix_len, value)`.
fn peek_length(buf: &[u8]) -> Result<Option<(usize, u64)>, ProtocolError> {
    let Some(&marker) = buf.first() else {
        return Ok(None);
    };

    let width = match marker {
        0x00..=0x7f => return Ok(Some((1, marker as u64))),
        MARKER_U8 => 1,
        MARKER_U16 => 2,
        MARKER_U32 => 4,
        MARKER_U64 => 8,
        other => return Err(ProtocolError::InvalidLengthPrefix(other)),
    };

    if buf.len() < 1 + width {
        return Ok(None);
    }

    let value = buf[1..=width]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64);
    Ok(Some((1 + width, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let payload = Bytes::from_static(&[0x81, 0x00, 0x40, 0x80]);
        let frame = Frame::new(payload.clone());

        let mut buf = frame.encode().unwrap();
        assert_eq!(buf.len(), LENGTH_PREFIX_SIZE + payload.len());
        assert_eq!(&buf[..5], &[0xce, 0, 0, 0, 4]);

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incomplete_prefix() {
        let mut buf = BytesMut::from(&[0xce, 0x00, 0x00][..]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        // Nothing consumed while waiting for more data
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_incomplete_payload() {
        let mut buf = BytesMut::from(&[0xce, 0x00, 0x00, 0x00, 0x03, 0x80][..]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(&[0x80, 0x80]);
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), &[0x80, 0x80, 0x80]);
    }

    #[test]
    fn test_compact_length_forms() {
        // positive fixint
        let mut buf = BytesMut::from(&[0x02, 0x80, 0x80][..]);
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 2);

        // uint8
        let mut buf = BytesMut::from(&[0xcc, 0x01, 0x80][..]);
        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap().payload.len(), 1);

        // uint16
        let mut buf = BytesMut::from(&[0xcd, 0x00, 0x01, 0x80][..]);
        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap().payload.len(), 1);
    }

    #[test]
    fn test_invalid_length_marker() {
        // A fixmap marker is not a valid length
        let mut buf = BytesMut::from(&[0x81, 0x00, 0x00][..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::InvalidLengthPrefix(0x81))));

        // Negative fixint
        let mut buf = BytesMut::from(&[0xff][..]);
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(ProtocolError::InvalidLengthPrefix(0xff))
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let mut buf = BytesMut::from(&[0xcf, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff][..]);
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));

        let huge = Frame::new(Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE as usize + 1]));
        assert!(matches!(
            huge.encode(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_with_larger_limit() {
        // Prefix announcing a 20 MiB payload, none of it received yet
        let len: u32 = 20 * 1024 * 1024;
        let mut prefix = vec![0xce];
        prefix.extend_from_slice(&len.to_be_bytes());

        let mut buf = BytesMut::from(&prefix[..]);
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { max, .. }) if max == MAX_PAYLOAD_SIZE as u64
        ));

        let mut buf = BytesMut::from(&prefix[..]);
        assert_eq!(Frame::decode_with_limit(&mut buf, 64 * 1024 * 1024).unwrap(), None);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut buf = BytesMut::new();
        Frame::new(Bytes::from_static(b"\x80"))
            .encode_into(&mut buf)
            .unwrap();
        Frame::new(Bytes::from_static(b"\x80\x80"))
            .encode_into(&mut buf)
            .unwrap();

        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap().payload.len(), 1);
        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap().payload.len(), 2);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }
}
