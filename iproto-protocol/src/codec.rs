//! Encoder and decoder for IProto frames and messages.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::{Body, Header, Message};
use crate::request::Request;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Bytes, BytesMut};

/// Encodes messages into length-prefixed frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a header and body into a frame.
    pub fn encode(header: &Header, body: &Body) -> Result<BytesMut, ProtocolError> {
        Message::new(header.clone(), body.clone()).encode()
    }

    /// Encodes a message into a frame.
    pub fn encode_message(message: &Message) -> Result<BytesMut, ProtocolError> {
        message.encode()
    }

    /// Encodes a typed request with the given sync id and optional stream.
    pub fn encode_request(
        request: &Request,
        sync: u64,
        stream_id: Option<u64>,
    ) -> Result<BytesMut, ProtocolError> {
        let header = Header::request(request.request_type(), sync).with_stream_id(stream_id);
        Message::new(header, request.body()).encode()
    }
}

/// Decodes frames into messages.
pub struct Decoder {
    buffer: BytesMut,
    max_frame_size: u64,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_capacity(8192)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            max_frame_size: MAX_PAYLOAD_SIZE as u64,
        }
    }

    /// Sets the largest payload accepted from the peer.
    pub fn with_max_frame_size(mut self, max: u64) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Mutable access to the buffer for direct socket reads.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode_with_limit(&mut self.buffer, self.max_frame_size)
    }

    /// Attempts to decode the next message from the buffer.
    pub fn decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Ok(Some(Message::from_frame(&frame)?)),
            None => Ok(None),
        }
    }

    /// Call when the peer has closed the stream. Fails if a partial frame is
    /// left in the buffer.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Truncated {
                buffered: self.buffer.len(),
            })
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{body, RequestType};
    use rmpv::Value;

    #[test]
    fn test_encoder_decoder_roundtrip() {
        let encoded = Encoder::encode_request(&Request::Ping, 42, None).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&encoded);

        let decoded = decoder.decode_message().unwrap().unwrap();
        assert_eq!(decoded.sync(), 42);
        assert_eq!(decoded.header.request_type(), Some(RequestType::Ping));
        assert!(decoded.header.stream_id.is_none());
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_stream_id_in_header() {
        let request = Request::call("box.info", vec![]);
        let encoded = Encoder::encode_request(&request, 1, Some(9)).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&encoded);
        let decoded = decoder.decode_message().unwrap().unwrap();
        assert_eq!(decoded.header.stream_id, Some(9));
        assert_eq!(decoded.body.get_str(body::FUNCTION_NAME), Some("box.info"));
    }

    #[test]
    fn test_partial_frame_decoding() {
        let encoded = Encoder::encode_request(&Request::eval("return 1", vec![]), 1, None).unwrap();

        let mut decoder = Decoder::new();

        // Feed partial data
        decoder.extend(&encoded[..10]);
        assert!(decoder.decode_message().unwrap().is_none());
        assert!(decoder.finish().is_err());

        // Feed the rest
        decoder.extend(&encoded[10..]);
        let decoded = decoder.decode_message().unwrap().unwrap();
        assert_eq!(decoded.sync(), 1);
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_byte_at_a_time() {
        let message = Message::new(
            Header::new(0, 77),
            Body::new().with(body::DATA, Value::Array(vec![Value::Nil, Value::from("x")])),
        );
        let encoded = Encoder::encode_message(&message).unwrap();

        let mut decoder = Decoder::new();
        let mut decoded = None;
        for byte in encoded.iter() {
            decoder.extend(&[*byte]);
            if let Some(m) = decoder.decode_message().unwrap() {
                decoded = Some(m);
            }
        }
        assert_eq!(decoded, Some(message));
    }

    #[test]
    fn test_decoder_buffered() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.buffered(), 0);

        decoder.extend(b"some data");
        assert_eq!(decoder.buffered(), 9);

        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_extend_bytes() {
        let encoded = Encoder::encode(&Header::new(0, 3), &Body::new()).unwrap();

        let mut decoder = Decoder::default();
        decoder.extend_bytes(Bytes::from(encoded.to_vec()));

        let decoded = decoder.decode_message().unwrap().unwrap();
        assert_eq!(decoded.sync(), 3);
    }

    #[test]
    fn test_malformed_stream_is_error() {
        let mut decoder = Decoder::new();
        decoder.extend(&[0xc1, 0x00]);
        assert!(decoder.decode_message().is_err());
    }

    #[test]
    fn test_decoder_frame_limit() {
        let header = Header::new(0, 1);
        let body = Body::new().with(body::DATA, vec![0u8; 2048]);
        let encoded = Encoder::encode(&header, &body).unwrap();

        let mut strict = Decoder::new().with_max_frame_size(1024);
        strict.extend(&encoded);
        assert!(matches!(
            strict.decode_message(),
            Err(ProtocolError::FrameTooLarge { max: 1024, .. })
        ));

        let mut relaxed = Decoder::new().with_max_frame_size(4096);
        relaxed.extend(&encoded);
        assert_eq!(relaxed.decode_message().unwrap().unwrap().sync(), 1);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use rmpv::Value;

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Nil),
            any::<bool>().prop_map(Value::from),
            any::<u64>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            ".{0,16}".prop_map(|s: String| Value::from(s)),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Binary),
        ]
    }

    fn value() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                proptest::collection::vec((leaf(), inner), 0..4).prop_map(Value::Map),
            ]
        })
    }

    fn message() -> impl Strategy<Value = Message> {
        (
            any::<u32>(),
            any::<u64>(),
            proptest::option::of(any::<u64>()),
            proptest::option::of(any::<u64>()),
            proptest::collection::btree_map(0x10u64..0x60, value(), 0..6),
        )
            .prop_map(|(code, sync, schema_version, stream_id, fields)| {
                let mut header = Header::new(code, sync).with_stream_id(stream_id);
                header.schema_version = schema_version;
                Message::new(header, Body::from(fields))
            })
    }

    proptest! {
        #[test]
        fn encode_decode_is_identity(message in message()) {
            let encoded = Encoder::encode_message(&message).unwrap();
            let mut decoder = Decoder::new();
            decoder.extend(&encoded);
            let decoded = decoder.decode_message().unwrap().unwrap();
            prop_assert_eq!(decoded, message);
            prop_assert_eq!(decoder.buffered(), 0);
        }

        #[test]
        fn split_point_does_not_matter(message in message(), split in any::<prop::sample::Index>()) {
            let encoded = Encoder::encode_message(&message).unwrap();
            let at = split.index(encoded.len());
            let mut decoder = Decoder::new();
            decoder.extend(&encoded[..at]);
            let early = decoder.decode_message().unwrap();
            decoder.extend(&encoded[at..]);
            let decoded = match early {
                Some(m) => m,
                None => decoder.decode_message().unwrap().unwrap(),
            };
            prop_assert_eq!(decoded, message);
        }

        #[test]
        fn garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut decoder = Decoder::new();
            decoder.extend(&bytes);
            let _ = decoder.decode_message();
        }
    }
}
