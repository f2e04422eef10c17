//! # iproto-client
//!
//! Async client for IProto, the binary protocol of Tarantool.
//!
//! This crate provides:
//! - Connection lifecycle: greeting, feature negotiation, authentication
//! - Request multiplexing over one socket with per-request timeouts
//! - Out-of-band pushes, watchers and graceful shutdown handling
//! - Transaction streams
//! - Optional TLS support

mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod negotiation;
mod pending;
mod shutdown;
pub mod stream;
pub mod tls;
pub mod transport;
pub mod watcher;

pub use client::{Client, Transaction};
pub use config::{ConfigError, ConnectionConfig, TlsClientConfig};
pub use connection::{Connection, ConnectionState, RequestOptions, ResponseHandle};
pub use error::{ClientError, CloseCause, ConnectErrorKind};
pub use negotiation::ServerInfo;
pub use stream::TransactionState;
pub use watcher::{WatchStream, WatcherRegistry};
