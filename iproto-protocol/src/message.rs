//! IProto message: an integer-keyed header map plus an integer-keyed body map.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::keys::{self, RequestType, TYPE_ERROR};
use bytes::{Bytes, BytesMut};
use rmpv::Value;
use std::collections::BTreeMap;

/// Integer-keyed MessagePack map.
pub type IntMap = BTreeMap<u64, Value>;

/// Message header.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// Request or response type code.
    pub code: u32,
    /// Correlation id.
    pub sync: u64,
    /// Schema version the server used for this reply.
    pub schema_version: Option<u64>,
    /// Transaction stream the request belongs to.
    pub stream_id: Option<u64>,
    /// Header fields this crate does not interpret.
    pub extra: IntMap,
}

impl Header {
    pub fn new(code: u32, sync: u64) -> Self {
        Self {
            code,
            sync,
            schema_version: None,
            stream_id: None,
            extra: IntMap::new(),
        }
    }

    pub fn request(ty: RequestType, sync: u64) -> Self {
        Self::new(ty.code(), sync)
    }

    pub fn with_stream_id(mut self, stream_id: Option<u64>) -> Self {
        self.stream_id = stream_id;
        self
    }

    pub fn with_schema_version(mut self, version: u64) -> Self {
        self.schema_version = Some(version);
        self
    }

    /// Returns the known request type, if any.
    pub fn request_type(&self) -> Option<RequestType> {
        RequestType::from_code(self.code)
    }

    /// Returns whether this header marks an error response.
    pub fn is_error(&self) -> bool {
        self.code & TYPE_ERROR != 0
    }

    /// Returns the server error code of an error response.
    pub fn error_code(&self) -> Option<u32> {
        self.is_error().then_some(self.code & !TYPE_ERROR)
    }

    /// Returns whether this is an out-of-band push (`IPROTO_CHUNK`).
    pub fn is_push(&self) -> bool {
        self.code == RequestType::Chunk.code()
    }

    /// Returns whether this is a watcher notification (`IPROTO_EVENT`).
    pub fn is_event(&self) -> bool {
        self.code == RequestType::Event.code()
    }

    fn to_value(&self) -> Value {
        let mut map = Vec::with_capacity(4 + self.extra.len());
        map.push((Value::from(keys::header::REQUEST_TYPE), Value::from(self.code)));
        map.push((Value::from(keys::header::SYNC), Value::from(self.sync)));
        if let Some(version) = self.schema_version {
            map.push((Value::from(keys::header::SCHEMA_VERSION), Value::from(version)));
        }
        if let Some(stream_id) = self.stream_id {
            map.push((Value::from(keys::header::STREAM_ID), Value::from(stream_id)));
        }
        for (key, value) in &self.extra {
            map.push((Value::from(*key), value.clone()));
        }
        Value::Map(map)
    }

    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut fields = int_map(value, "header")?;

        let code = fields
            .remove(&keys::header::REQUEST_TYPE)
            .ok_or(ProtocolError::MissingField("request type"))?;
        let code = code
            .as_u64()
            .and_then(|c| u32::try_from(c).ok())
            .ok_or_else(|| ProtocolError::unexpected("request type", "u32"))?;

        let sync = match fields.remove(&keys::header::SYNC) {
            Some(v) => v
                .as_u64()
                .ok_or_else(|| ProtocolError::unexpected("sync", "unsigned integer"))?,
            None => 0,
        };

        let schema_version = optional_u64(&mut fields, keys::header::SCHEMA_VERSION, "schema version")?;
        let stream_id = optional_u64(&mut fields, keys::header::STREAM_ID, "stream id")?;

        Ok(Self {
            code,
            sync,
            schema_version,
            stream_id,
            extra: fields,
        })
    }
}

/// Message body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Body {
    fields: IntMap,
}

impl Body {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: u64, value: impl Into<Value>) -> Self {
        self.fields.insert(key, value.into());
        self
    }

    /// Inserts `value` under `key` only when it is present.
    pub fn with_opt(self, key: u64, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    pub fn insert(&mut self, key: u64, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key, value.into())
    }

    pub fn get(&self, key: u64) -> Option<&Value> {
        self.fields.get(&key)
    }

    pub fn remove(&mut self, key: u64) -> Option<Value> {
        self.fields.remove(&key)
    }

    pub fn contains(&self, key: u64) -> bool {
        self.fields.contains_key(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &Value)> {
        self.fields.iter()
    }

    /// Returns the `IPROTO_DATA` payload.
    pub fn data(&self) -> Option<&Value> {
        self.get(keys::body::DATA)
    }

    /// Removes and returns the `IPROTO_DATA` payload, `Nil` if absent.
    pub fn take_data(&mut self) -> Value {
        self.remove(keys::body::DATA).unwrap_or(Value::Nil)
    }

    /// Returns a string field.
    pub fn get_str(&self, key: u64) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Returns an unsigned integer field.
    pub fn get_u64(&self, key: u64) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn into_map(self) -> IntMap {
        self.fields
    }

    fn to_value(&self) -> Value {
        Value::Map(
            self.fields
                .iter()
                .map(|(k, v)| (Value::from(*k), v.clone()))
                .collect(),
        )
    }

    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        Ok(Self {
            fields: int_map(value, "body")?,
        })
    }
}

impl From<IntMap> for Body {
    fn from(fields: IntMap) -> Self {
        Self { fields }
    }
}

/// A decoded message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub body: Body,
}

impl Message {
    pub fn new(header: Header, body: Body) -> Self {
        Self { header, body }
    }

    pub fn sync(&self) -> u64 {
        self.header.sync
    }

    /// Serializes header and body into a frame payload.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let mut payload = Vec::with_capacity(64);
        write(&mut payload, &self.header.to_value())?;
        write(&mut payload, &self.body.to_value())?;
        Ok(Frame::new(Bytes::from(payload)))
    }

    /// Encodes the message into a complete length-prefixed frame.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        self.to_frame()?.encode()
    }

    /// Parses the payload of a frame.
    ///
    /// A payload that ends right after the header yields an empty body.
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let mut cursor: &[u8] = &frame.payload;
        let header = Header::from_value(rmpv::decode::read_value(&mut cursor)?)?;
        let body = if cursor.is_empty() {
            Body::new()
        } else {
            Body::from_value(rmpv::decode::read_value(&mut cursor)?)?
        };
        if !cursor.is_empty() {
            return Err(ProtocolError::TrailingBytes(cursor.len()));
        }
        Ok(Self { header, body })
    }
}

fn write(buf: &mut Vec<u8>, value: &Value) -> Result<(), ProtocolError> {
    rmpv::encode::write_value(buf, value).map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn int_map(value: Value, field: &'static str) -> Result<IntMap, ProtocolError> {
    let Value::Map(entries) = value else {
        return Err(ProtocolError::unexpected(field, "map"));
    };
    let mut map = IntMap::new();
    for (key, value) in entries {
        let key = key
            .as_u64()
            .ok_or_else(|| ProtocolError::unexpected(field, "map with unsigned integer keys"))?;
        map.insert(key, value);
    }
    Ok(map)
}

fn optional_u64(
    fields: &mut IntMap,
    key: u64,
    name: &'static str,
) -> Result<Option<u64>, ProtocolError> {
    match fields.remove(&key) {
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| ProtocolError::unexpected(name, "unsigned integer")),
        None => Ok(None),
    }
}
