//! Protocol constants: header keys, body keys and request type codes.

/// Header map keys.
pub mod header {
    pub const REQUEST_TYPE: u64 = 0x00;
    pub const SYNC: u64 = 0x01;
    pub const REPLICA_ID: u64 = 0x02;
    pub const LSN: u64 = 0x03;
    pub const TIMESTAMP: u64 = 0x04;
    pub const SCHEMA_VERSION: u64 = 0x05;
    pub const SERVER_VERSION: u64 = 0x06;
    pub const GROUP_ID: u64 = 0x07;
    pub const TSN: u64 = 0x08;
    pub const FLAGS: u64 = 0x09;
    pub const STREAM_ID: u64 = 0x0a;
}

/// Body map keys.
pub mod body {
    pub const SPACE_ID: u64 = 0x10;
    pub const INDEX_ID: u64 = 0x11;
    pub const LIMIT: u64 = 0x12;
    pub const OFFSET: u64 = 0x13;
    pub const ITERATOR: u64 = 0x14;
    pub const INDEX_BASE: u64 = 0x15;
    pub const FETCH_POSITION: u64 = 0x1f;
    pub const KEY: u64 = 0x20;
    pub const TUPLE: u64 = 0x21;
    pub const FUNCTION_NAME: u64 = 0x22;
    pub const USER_NAME: u64 = 0x23;
    pub const EXPR: u64 = 0x27;
    pub const OPS: u64 = 0x28;
    pub const OPTIONS: u64 = 0x2b;
    pub const AFTER_POSITION: u64 = 0x2e;
    pub const AFTER_TUPLE: u64 = 0x2f;
    pub const DATA: u64 = 0x30;
    pub const ERROR_24: u64 = 0x31;
    pub const METADATA: u64 = 0x32;
    pub const BIND_METADATA: u64 = 0x33;
    pub const BIND_COUNT: u64 = 0x34;
    pub const POSITION: u64 = 0x35;
    pub const SQL_TEXT: u64 = 0x40;
    pub const SQL_BIND: u64 = 0x41;
    pub const SQL_INFO: u64 = 0x42;
    pub const STMT_ID: u64 = 0x43;
    pub const ERROR: u64 = 0x52;
    pub const VERSION: u64 = 0x54;
    pub const FEATURES: u64 = 0x55;
    pub const TIMEOUT: u64 = 0x56;
    pub const EVENT_KEY: u64 = 0x57;
    pub const EVENT_DATA: u64 = 0x58;
    pub const TXN_ISOLATION: u64 = 0x59;
    pub const AUTH_TYPE: u64 = 0x5b;
    pub const SPACE_NAME: u64 = 0x5e;
    pub const INDEX_NAME: u64 = 0x5f;
}

/// Keys of the extended error payload found under [`body::ERROR`].
pub mod error {
    pub const STACK: u64 = 0x00;

    pub const TYPE: u64 = 0x00;
    pub const FILE: u64 = 0x01;
    pub const LINE: u64 = 0x02;
    pub const MESSAGE: u64 = 0x03;
    pub const ERRNO: u64 = 0x04;
    pub const CODE: u64 = 0x05;
    pub const FIELDS: u64 = 0x06;
}

/// Bit set on the request type of every error response.
pub const TYPE_ERROR: u32 = 0x8000;

/// IProto request and response type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RequestType {
    Ok = 0,
    Select = 1,
    Insert = 2,
    Replace = 3,
    Update = 4,
    Delete = 5,
    Auth = 7,
    Eval = 8,
    Upsert = 9,
    Call = 10,
    Execute = 11,
    Prepare = 13,
    Begin = 14,
    Commit = 15,
    Rollback = 16,
    Ping = 64,
    Id = 73,
    Watch = 74,
    Unwatch = 75,
    Event = 76,
    WatchOnce = 77,
    Chunk = 128,
}

impl RequestType {
    /// Returns the wire code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Maps a wire code back to a known type.
    pub fn from_code(code: u32) -> Option<Self> {
        let ty = match code {
            0 => RequestType::Ok,
            1 => RequestType::Select,
            2 => RequestType::Insert,
            3 => RequestType::Replace,
            4 => RequestType::Update,
            5 => RequestType::Delete,
            7 => RequestType::Auth,
            8 => RequestType::Eval,
            9 => RequestType::Upsert,
            10 => RequestType::Call,
            11 => RequestType::Execute,
            13 => RequestType::Prepare,
            14 => RequestType::Begin,
            15 => RequestType::Commit,
            16 => RequestType::Rollback,
            64 => RequestType::Ping,
            73 => RequestType::Id,
            74 => RequestType::Watch,
            75 => RequestType::Unwatch,
            76 => RequestType::Event,
            77 => RequestType::WatchOnce,
            128 => RequestType::Chunk,
            _ => return None,
        };
        Some(ty)
    }

    /// Upper-case name as used in logs and error messages.
    pub fn name(self) -> &'static str {
        match self {
            RequestType::Ok => "OK",
            RequestType::Select => "SELECT",
            RequestType::Insert => "INSERT",
            RequestType::Replace => "REPLACE",
            RequestType::Update => "UPDATE",
            RequestType::Delete => "DELETE",
            RequestType::Auth => "AUTH",
            RequestType::Eval => "EVAL",
            RequestType::Upsert => "UPSERT",
            RequestType::Call => "CALL",
            RequestType::Execute => "EXECUTE",
            RequestType::Prepare => "PREPARE",
            RequestType::Begin => "BEGIN",
            RequestType::Commit => "COMMIT",
            RequestType::Rollback => "ROLLBACK",
            RequestType::Ping => "PING",
            RequestType::Id => "ID",
            RequestType::Watch => "WATCH",
            RequestType::Unwatch => "UNWATCH",
            RequestType::Event => "EVENT",
            RequestType::WatchOnce => "WATCH_ONCE",
            RequestType::Chunk => "CHUNK",
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type_codes_roundtrip() {
        for ty in [
            RequestType::Select,
            RequestType::Call,
            RequestType::Ping,
            RequestType::Id,
            RequestType::WatchOnce,
            RequestType::Chunk,
        ] {
            assert_eq!(RequestType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(RequestType::from_code(6), None);
        assert_eq!(RequestType::from_code(TYPE_ERROR | 42), None);
    }

    #[test]
    fn test_request_type_display() {
        assert_eq!(RequestType::WatchOnce.to_string(), "WATCH_ONCE");
        assert_eq!(RequestType::Eval.to_string(), "EVAL");
    }
}
