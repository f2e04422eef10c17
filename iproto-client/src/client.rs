//! High-level client API.

use crate::config::ConnectionConfig;
use crate::connection::{Connection, RequestOptions};
use crate::error::ClientError;
use crate::watcher::{WatchStream, WatcherRegistry};
use iproto_protocol::{Body, Prepared, Request, Select, Statement, TxnIsolation, Value};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// High-level client for an IProto server.
///
/// Wraps a [`Connection`] and survives reconnects: watcher subscriptions are
/// kept in a registry shared by every connection the client creates.
pub struct Client {
    config: ConnectionConfig,
    watchers: Arc<WatcherRegistry>,
    conn: RwLock<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        let watchers = Arc::new(WatcherRegistry::new());
        let conn = Connection::with_watchers(config.clone(), watchers.clone());
        Self {
            config,
            watchers,
            conn: RwLock::new(conn),
        }
    }

    /// Connects to the server.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connection().connect().await?;
        Ok(())
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.connection().is_established()
    }

    /// Closes the current connection and connects a new one. Watched keys
    /// are subscribed again on the new connection.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        let fresh = Connection::with_watchers(self.config.clone(), self.watchers.clone());
        let old = std::mem::replace(&mut *self.conn.write(), fresh.clone());
        old.close().await;
        tracing::debug!("Reconnecting to {}", self.config.addr);
        fresh.connect().await?;
        Ok(())
    }

    /// Closes the connection.
    pub async fn close(&self) {
        self.connection().close().await
    }

    /// Returns the current connection.
    pub fn connection(&self) -> Connection {
        self.conn.read().clone()
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    async fn request(&self, request: Request) -> Result<Body, ClientError> {
        self.connection().request(request).await
    }

    async fn data(&self, request: Request) -> Result<Value, ClientError> {
        let mut body = self.request(request).await?;
        Ok(body.take_data())
    }

    // =========================================================================
    // System operations
    // =========================================================================

    /// Pings the server.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request(Request::Ping).await?;
        Ok(())
    }

    /// Authenticates as `user`.
    pub async fn authorize(&self, user: &str, password: &str) -> Result<(), ClientError> {
        self.connection().authorize(user, password).await
    }

    // =========================================================================
    // Data operations
    // =========================================================================

    /// Runs a select and returns the matching tuples.
    pub async fn select(&self, select: Select) -> Result<Value, ClientError> {
        self.data(select.into()).await
    }

    pub async fn insert(&self, space: u32, tuple: Vec<Value>) -> Result<Value, ClientError> {
        self.data(Request::insert(space, tuple)).await
    }

    pub async fn replace(&self, space: u32, tuple: Vec<Value>) -> Result<Value, ClientError> {
        self.data(Request::replace(space, tuple)).await
    }

    pub async fn update(
        &self,
        space: u32,
        index: u32,
        key: Vec<Value>,
        ops: Vec<Value>,
    ) -> Result<Value, ClientError> {
        self.data(Request::update(space, index, key, ops)).await
    }

    pub async fn delete(
        &self,
        space: u32,
        index: u32,
        key: Vec<Value>,
    ) -> Result<Value, ClientError> {
        self.data(Request::delete(space, index, key)).await
    }

    pub async fn upsert(
        &self,
        space: u32,
        tuple: Vec<Value>,
        ops: Vec<Value>,
    ) -> Result<Value, ClientError> {
        self.data(Request::upsert(space, tuple, ops)).await
    }

    // =========================================================================
    // Stored code
    // =========================================================================

    /// Calls a stored function and returns its results.
    pub async fn call(&self, function: &str, args: Vec<Value>) -> Result<Value, ClientError> {
        self.data(Request::call(function, args)).await
    }

    /// Evaluates a Lua expression and returns its results.
    pub async fn eval(&self, expr: &str, args: Vec<Value>) -> Result<Value, ClientError> {
        self.data(Request::eval(expr, args)).await
    }

    // =========================================================================
    // SQL
    // =========================================================================

    /// Executes an SQL statement (text or prepared id). Returns the full
    /// reply body: rows under `DATA`, metadata and SQL info when present.
    pub async fn execute(
        &self,
        statement: impl Into<Statement>,
        binds: Vec<Value>,
    ) -> Result<Body, ClientError> {
        self.request(Request::execute(statement, binds)).await
    }

    pub async fn prepare(&self, sql: &str) -> Result<Prepared, ClientError> {
        let body = self.request(Request::prepare(sql)).await?;
        Ok(Prepared::from_body(body)?)
    }

    // =========================================================================
    // Watchers
    // =========================================================================

    pub async fn watch(&self, key: &str) -> Result<WatchStream, ClientError> {
        self.connection().watch(key).await
    }

    pub async fn unwatch(&self, key: &str) -> Result<(), ClientError> {
        self.connection().unwatch(key).await
    }

    pub async fn watch_once(&self, key: &str) -> Result<Value, ClientError> {
        self.connection().watch_once(key).await
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Starts a transaction on a fresh stream of the current connection.
    pub async fn transaction(
        &self,
        timeout: Option<Duration>,
        isolation: TxnIsolation,
    ) -> Result<Transaction, ClientError> {
        let conn = self.connection();
        let stream_id = conn.allocate_stream_id();
        conn.begin(stream_id, timeout, isolation).await?;
        Ok(Transaction { conn, stream_id })
    }
}

/// An interactive transaction bound to one stream.
pub struct Transaction {
    conn: Connection,
    stream_id: u64,
}

impl Transaction {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Runs a request inside the transaction.
    pub async fn request(&self, request: Request) -> Result<Body, ClientError> {
        self.conn
            .call(request, RequestOptions::new().with_stream(self.stream_id))
            .await
    }

    pub async fn commit(self) -> Result<(), ClientError> {
        self.conn.commit(self.stream_id).await
    }

    pub async fn rollback(self) -> Result<(), ClientError> {
        self.conn.rollback(self.stream_id).await
    }
}
