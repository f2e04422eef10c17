//! Response decoding: success bodies, server errors, `IPROTO_ID` replies and
//! watcher events.

use crate::error::{ErrorFrame, ProtocolError, ServerError};
use crate::feature::FeatureSet;
use crate::keys::{body, error, RequestType, TYPE_ERROR};
use crate::message::{Body, Header, Message};
use rmpv::Value;

const UNKNOWN_ERROR: &str = "Unknown error";

/// Splits a reply into its body or the server error it carries.
pub fn into_result(message: Message) -> Result<Body, ServerError> {
    match message.header.error_code() {
        Some(code) => Err(server_error(code, &message.body)),
        None => Ok(message.body),
    }
}

/// Decodes the error payload of an error response.
///
/// The extended stack under `IPROTO_ERROR` is preferred for the frame list;
/// the message comes from `IPROTO_ERROR_24` when present, otherwise from the
/// top of the stack.
pub fn server_error(code: u32, body: &Body) -> ServerError {
    let stack = body
        .get(body::ERROR)
        .map(decode_stack)
        .unwrap_or_default();

    let message = body
        .get_str(body::ERROR_24)
        .map(str::to_string)
        .or_else(|| stack.first().map(|frame| frame.message.clone()))
        .unwrap_or_else(|| UNKNOWN_ERROR.to_string());

    ServerError::new(code, message).with_stack(stack)
}

fn decode_stack(value: &Value) -> Vec<ErrorFrame> {
    let Some(entries) = lookup(value, error::STACK).and_then(Value::as_array) else {
        return Vec::new();
    };
    entries.iter().map(decode_frame).collect()
}

fn decode_frame(value: &Value) -> ErrorFrame {
    let text = |key| {
        lookup(value, key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let number = |key| lookup(value, key).and_then(Value::as_u64).unwrap_or(0);

    ErrorFrame {
        error_type: text(error::TYPE),
        file: text(error::FILE),
        line: number(error::LINE),
        message: text(error::MESSAGE),
        errno: number(error::ERRNO),
        code: number(error::CODE) as u32,
        fields: match lookup(value, error::FIELDS) {
            Some(Value::Map(fields)) => fields.clone(),
            _ => Vec::new(),
        },
    }
}

fn lookup(map: &Value, key: u64) -> Option<&Value> {
    map.as_map()?
        .iter()
        .find(|(k, _)| k.as_u64() == Some(key))
        .map(|(_, v)| v)
}

/// Renders a server error as a reply. Used by test servers and tools.
pub fn error_message(sync: u64, err: &ServerError) -> Message {
    let stack: Vec<Value> = err
        .stack
        .iter()
        .map(|frame| {
            Value::Map(vec![
                (Value::from(error::TYPE), Value::from(frame.error_type.as_str())),
                (Value::from(error::FILE), Value::from(frame.file.as_str())),
                (Value::from(error::LINE), Value::from(frame.line)),
                (Value::from(error::MESSAGE), Value::from(frame.message.as_str())),
                (Value::from(error::ERRNO), Value::from(frame.errno)),
                (Value::from(error::CODE), Value::from(frame.code)),
                (Value::from(error::FIELDS), Value::Map(frame.fields.clone())),
            ])
        })
        .collect();

    let mut body = Body::new().with(body::ERROR_24, err.message.as_str());
    if !stack.is_empty() {
        body.insert(
            body::ERROR,
            Value::Map(vec![(Value::from(error::STACK), Value::Array(stack))]),
        );
    }
    Message::new(Header::new(TYPE_ERROR | err.code, sync), body)
}

/// Server side of the `IPROTO_ID` exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdResponse {
    pub version: u64,
    pub features: FeatureSet,
    pub auth_type: Option<String>,
}

impl IdResponse {
    pub fn from_body(body: &Body) -> Result<Self, ProtocolError> {
        let version = body
            .get_u64(body::VERSION)
            .ok_or(ProtocolError::MissingField("version"))?;

        let features = match body.get(body::FEATURES) {
            Some(Value::Array(codes)) => {
                FeatureSet::from_codes(codes.iter().filter_map(Value::as_u64))
            }
            Some(_) => return Err(ProtocolError::unexpected("features", "array")),
            None => FeatureSet::empty(),
        };

        Ok(Self {
            version,
            features,
            auth_type: body.get_str(body::AUTH_TYPE).map(str::to_string),
        })
    }

    pub fn to_body(&self) -> Body {
        Body::new()
            .with(body::VERSION, self.version)
            .with(
                body::FEATURES,
                Value::Array(self.features.codes().into_iter().map(Value::from).collect()),
            )
            .with_opt(body::AUTH_TYPE, self.auth_type.as_deref())
    }
}

/// A watcher notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub key: String,
    /// Current value of the key; `Nil` when the key has never been broadcast.
    pub data: Value,
}

impl Event {
    pub fn new(key: impl Into<String>, data: Value) -> Self {
        Self {
            key: key.into(),
            data,
        }
    }

    pub fn from_body(mut body: Body) -> Result<Self, ProtocolError> {
        let key = match body.remove(body::EVENT_KEY) {
            Some(Value::String(s)) => s
                .into_str()
                .ok_or_else(|| ProtocolError::unexpected("event key", "UTF-8 string"))?,
            Some(_) => return Err(ProtocolError::unexpected("event key", "string")),
            None => return Err(ProtocolError::MissingField("event key")),
        };
        let data = body.remove(body::EVENT_DATA).unwrap_or(Value::Nil);
        Ok(Self { key, data })
    }

    /// Renders the event as a server push message.
    pub fn to_message(&self) -> Message {
        Message::new(
            Header::request(RequestType::Event, 0),
            Body::new()
                .with(body::EVENT_KEY, self.key.as_str())
                .with(body::EVENT_DATA, self.data.clone()),
        )
    }
}

/// Reply to `IPROTO_PREPARE`.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub stmt_id: u64,
    pub bind_count: u64,
    pub bind_metadata: Value,
    pub metadata: Value,
}

impl Prepared {
    pub fn from_body(mut body: Body) -> Result<Self, ProtocolError> {
        let stmt_id = body
            .get_u64(body::STMT_ID)
            .ok_or(ProtocolError::MissingField("statement id"))?;
        Ok(Self {
            stmt_id,
            bind_count: body.get_u64(body::BIND_COUNT).unwrap_or(0),
            bind_metadata: body.remove(body::BIND_METADATA).unwrap_or(Value::Nil),
            metadata: body.remove(body::METADATA).unwrap_or(Value::Nil),
        })
    }
}
