//! # iproto-protocol
//!
//! Wire protocol implementation for IProto, the binary protocol of Tarantool.
//!
//! This crate provides:
//! - MessagePack length-prefixed framing
//! - Integer-keyed header/body messages and protocol constants
//! - Greeting banner parsing and the `chap-sha1` scramble
//! - Typed requests, server error decoding and feature sets
//!
//! It performs no I/O.

pub mod auth;
pub mod codec;
pub mod error;
pub mod feature;
pub mod frame;
pub mod greeting;
pub mod keys;
pub mod message;
pub mod request;
pub mod response;

pub use codec::{Decoder, Encoder};
pub use error::{codes, ErrorFrame, ProtocolError, ServerError};
pub use feature::{Feature, FeatureSet};
pub use frame::{Frame, LENGTH_PREFIX_SIZE};
pub use greeting::{Greeting, GREETING_SIZE};
pub use keys::{RequestType, TYPE_ERROR};
pub use message::{Body, Header, IntMap, Message};
pub use request::{
    After, IndexRef, IteratorType, Request, Select, SpaceRef, Statement, TxnIsolation,
};
pub use response::{Event, IdResponse, Prepared};

/// Re-exported so callers can build request tuples without naming rmpv.
pub use rmpv::Value;

/// Protocol version declared in `IPROTO_ID`.
pub const PROTOCOL_VERSION: u64 = 6;

/// Default IProto port.
pub const DEFAULT_PORT: u16 = 3301;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Watcher key used by the server to announce graceful shutdown.
pub const SHUTDOWN_EVENT_KEY: &str = "box.shutdown";
