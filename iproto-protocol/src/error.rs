//! Protocol error types and server error payloads.

use rmpv::Value;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid length prefix marker: {0:#04x}")]
    InvalidLengthPrefix(u8),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("stream truncated: {buffered} bytes of an incomplete frame buffered")]
    Truncated { buffered: usize },

    #[error("{0} bytes left over after frame body")]
    TrailingBytes(usize),

    #[error("invalid {field}: expected {expected}")]
    UnexpectedType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    #[error("MessagePack encode error: {0}")]
    Encode(String),

    #[error("bad greeting: {0}")]
    BadGreeting(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn unexpected(field: &'static str, expected: &'static str) -> Self {
        ProtocolError::UnexpectedType { field, expected }
    }

    /// Returns whether this error came from greeting validation.
    pub fn is_bad_greeting(&self) -> bool {
        matches!(self, ProtocolError::BadGreeting(_))
    }
}

/// Well-known server error codes.
pub mod codes {
    pub const UNKNOWN: u32 = 0;
    pub const TUPLE_FOUND: u32 = 3;
    pub const NO_SUCH_SPACE: u32 = 36;
    pub const ACCESS_DENIED: u32 = 42;
    pub const NO_SUCH_USER: u32 = 45;
    pub const PASSWORD_MISMATCH: u32 = 47;
    pub const UNKNOWN_REQUEST_TYPE: u32 = 48;
    pub const TRANSACTION_CONFLICT: u32 = 97;
    pub const TRANSACTION_TIMEOUT: u32 = 256;
}

/// One frame of a server-side error stack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorFrame {
    /// Error class, e.g. `ClientError`.
    pub error_type: String,
    pub file: String,
    pub line: u64,
    pub message: String,
    pub errno: u64,
    pub code: u32,
    /// Extra typed fields attached to the error.
    pub fields: Vec<(Value, Value)>,
}

/// An error reported by the server in a response body.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("server error {code}: {message}")]
pub struct ServerError {
    /// Numeric error code (the response type with the error bit cleared).
    pub code: u32,
    /// Message of the top-level error.
    pub message: String,
    /// Full error stack, outermost first. Empty for servers that only send
    /// the legacy string payload.
    pub stack: Vec<ErrorFrame>,
}

impl ServerError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stack: Vec::new(),
        }
    }

    pub fn with_stack(mut self, stack: Vec<ErrorFrame>) -> Self {
        self.stack = stack;
        self
    }

    /// Returns whether the server rolled back a stream transaction because its
    /// timeout elapsed.
    pub fn is_transaction_timeout(&self) -> bool {
        self.code == codes::TRANSACTION_TIMEOUT
            || self.message.contains("aborted by timeout")
    }

    /// Returns whether the server does not know the request type.
    pub fn is_unknown_request(&self) -> bool {
        self.code == codes::UNKNOWN_REQUEST_TYPE
    }

    /// Returns whether the error is an authentication or access failure.
    pub fn is_access_error(&self) -> bool {
        matches!(
            self.code,
            codes::ACCESS_DENIED | codes::NO_SUCH_USER | codes::PASSWORD_MISMATCH
        )
    }
}
