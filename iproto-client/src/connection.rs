//! Connection management.
//!
//! A [`Connection`] owns one socket. Encoded requests are queued to a writer
//! task, which is the only place bytes reach the socket, and correlated with
//! their replies by sync id; a background read loop decodes incoming frames
//! and routes them to the waiting callers, push consumers and watchers.
//!
//! State moves one way only:
//!
//! ```text
//! Init -> Connecting -> AwaitingGreeting -> Established -> Closing -> Closed
//! ```
//!
//! Any failure during connect ends in `Closed`. A closed connection is never
//! reused; [`Client`](crate::Client) builds a new one to reconnect.

use crate::auth::Authenticator;
use crate::config::ConnectionConfig;
use crate::error::{ClientError, CloseCause};
use crate::negotiation::ServerInfo;
use crate::pending::{Pending, PendingTable, PushOutcome};
use crate::shutdown::ShutdownCoordinator;
use crate::stream::{StreamTracker, TransactionState};
use crate::transport::{self, ClientStream};
use crate::watcher::{Dispatch, WatchStream, WatcherRegistry};
use bytes::BytesMut;
use futures::future::{BoxFuture, FutureExt, Shared};
use iproto_protocol::response::{self, Event, IdResponse};
use iproto_protocol::{
    Body, Decoder, Encoder, Feature, FeatureSet, Greeting, Message, Request, TxnIsolation,
    Value, PROTOCOL_VERSION, SHUTDOWN_EVENT_KEY,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::time::Instant;

type ConnectAttempt = Shared<BoxFuture<'static, Result<Greeting, ClientError>>>;

/// How long a closing writer task waits for the socket shutdown.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Connecting,
    AwaitingGreeting,
    Established,
    /// No new requests are accepted; pending ones are being resolved.
    Closing(CloseCause),
    Closed(CloseCause),
}

impl ConnectionState {
    /// Error returned to a request submitted in this state, if any.
    fn send_error(self) -> Option<ClientError> {
        match self {
            ConnectionState::Established => None,
            ConnectionState::Init
            | ConnectionState::Connecting
            | ConnectionState::AwaitingGreeting => Some(ClientError::NotEstablished),
            ConnectionState::Closing(cause) | ConnectionState::Closed(cause) => {
                Some(ClientError::Closed(cause))
            }
        }
    }

    pub fn closed_cause(self) -> Option<CloseCause> {
        match self {
            ConnectionState::Closed(cause) => Some(cause),
            _ => None,
        }
    }

    pub fn is_established(self) -> bool {
        self == ConnectionState::Established
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Init => f.write_str("init"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::AwaitingGreeting => f.write_str("awaiting greeting"),
            ConnectionState::Established => f.write_str("established"),
            ConnectionState::Closing(cause) => write!(f, "closing ({})", cause),
            ConnectionState::Closed(cause) => write!(f, "closed ({})", cause),
        }
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the configured request timeout.
    pub timeout: Option<Duration>,
    /// Runs the request inside a transaction stream.
    pub stream_id: Option<u64>,
    /// Receives `IPROTO_CHUNK` pushes sent before the final reply.
    pub push: Option<mpsc::UnboundedSender<Body>>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_stream(mut self, stream_id: u64) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    pub fn with_push(mut self, push: mpsc::UnboundedSender<Body>) -> Self {
        self.push = Some(push);
        self
    }
}

/// Resolves to the final reply of a request.
#[derive(Debug)]
pub struct ResponseHandle {
    sync: u64,
    rx: oneshot::Receiver<Result<Body, ClientError>>,
}

impl ResponseHandle {
    fn ready(sync: u64, result: Result<Body, ClientError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { sync, rx }
    }

    /// Sync id the request was sent with.
    pub fn sync(&self) -> u64 {
        self.sync
    }
}

impl Future for ResponseHandle {
    type Output = Result<Body, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(ClientError::Closed(CloseCause::Client))))
    }
}

/// A connection to an IProto server.
///
/// Cheap to clone; clones share the socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    connect_attempt: Mutex<Option<ConnectAttempt>>,
    closing: AtomicBool,
    /// Queue of the writer task. `None` before the handshake and after close.
    writer: Mutex<Option<mpsc::UnboundedSender<BytesMut>>>,
    read_stop: Notify,
    write_stop: Notify,
    /// Set once features are known and watcher keys have been replayed.
    watch_ready: Mutex<bool>,
    pending: PendingTable,
    next_sync: AtomicU64,
    greeting: RwLock<Option<Greeting>>,
    server_info: RwLock<Option<ServerInfo>>,
    /// Last schema version seen in a reply header; 0 until the first one.
    schema_version: AtomicU64,
    auth: Authenticator,
    watchers: Arc<WatcherRegistry>,
    streams: StreamTracker,
    shutdown: ShutdownCoordinator,
    ignored: broadcast::Sender<Message>,
    close_listeners: Mutex<HashMap<CloseCause, Vec<oneshot::Sender<CloseCause>>>>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_watchers(config, Arc::new(WatcherRegistry::new()))
    }

    /// Creates a connection that subscribes the keys of an existing registry
    /// when it connects.
    pub fn with_watchers(config: ConnectionConfig, watchers: Arc<WatcherRegistry>) -> Self {
        let (ignored, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Init);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                connect_attempt: Mutex::new(None),
                closing: AtomicBool::new(false),
                writer: Mutex::new(None),
                read_stop: Notify::new(),
                write_stop: Notify::new(),
                watch_ready: Mutex::new(false),
                pending: PendingTable::new(),
                next_sync: AtomicU64::new(1),
                greeting: RwLock::new(None),
                server_info: RwLock::new(None),
                schema_version: AtomicU64::new(0),
                auth: Authenticator::new(),
                watchers,
                streams: StreamTracker::new(),
                shutdown: ShutdownCoordinator::new(),
                ignored,
                close_listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a connection and connects it.
    pub async fn open(config: ConnectionConfig) -> Result<Self, ClientError> {
        let conn = Self::new(config);
        conn.connect().await?;
        Ok(conn)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_established(&self) -> bool {
        self.state().is_established()
    }

    /// Connects, reads the greeting, negotiates features, authenticates when
    /// credentials are configured and replays watcher subscriptions.
    ///
    /// Concurrent callers share a single attempt and all observe its
    /// outcome. The attempt runs on its own task, so dropping the returned
    /// future does not abort it.
    pub async fn connect(&self) -> Result<Greeting, ClientError> {
        let attempt = {
            let mut slot = self.inner.connect_attempt.lock();
            slot.get_or_insert_with(|| {
                let inner = self.inner.clone();
                let task = tokio::spawn(async move { inner.establish().await });
                async move {
                    task.await.unwrap_or_else(|e| {
                        Err(ClientError::from(io::Error::new(
                            io::ErrorKind::Other,
                            format!("connect task failed: {}", e),
                        )))
                    })
                }
                .boxed()
                .shared()
            })
            .clone()
        };
        attempt.await
    }

    /// Sends a request and returns a handle resolving to its final reply.
    ///
    /// Fails right away when the connection is not established or the
    /// request needs a feature the server did not negotiate. Once this
    /// returns the frame is queued whole; dropping the handle does not cut it
    /// short. A failed write closes the connection, which fails the handle.
    /// `IPROTO_WATCH` and `IPROTO_UNWATCH` get no reply; their handle
    /// resolves to an empty body once the frame is queued.
    pub async fn send(
        &self,
        request: Request,
        options: RequestOptions,
    ) -> Result<ResponseHandle, ClientError> {
        self.inner.send(request, options).await
    }

    /// Sends a request and waits for its reply.
    pub async fn call(
        &self,
        request: Request,
        options: RequestOptions,
    ) -> Result<Body, ClientError> {
        self.inner.call(request, options).await
    }

    /// Sends a request with default options and waits for its reply.
    pub async fn request(&self, request: Request) -> Result<Body, ClientError> {
        self.call(request, RequestOptions::default()).await
    }

    /// Authenticates as `user`. A no-op when already authorized as `user`.
    pub async fn authorize(&self, user: &str, password: &str) -> Result<(), ClientError> {
        self.inner.authorize(user, password).await
    }

    /// User the connection is authorized as, if any.
    pub fn authorized_user(&self) -> Option<String> {
        self.inner.auth.current()
    }

    /// Subscribes to a watcher key.
    ///
    /// The server sends the current value right away and every later change.
    /// If the connection is not established yet, the key is subscribed when
    /// it connects.
    pub async fn watch(&self, key: &str) -> Result<WatchStream, ClientError> {
        let inner = &self.inner;
        inner.require_negotiated(Feature::Watchers)?;

        // Until the handshake replays the registry, a new key is left to it
        let ready = inner.watch_ready.lock();
        let (stream, first) = inner.watchers.register(key);
        if first && *ready && inner.state().is_established() {
            if let Err(err) = inner.send_oneway(Request::Watch {
                key: key.to_string(),
            }) {
                inner.watchers.unregister(key);
                return Err(err);
            }
        }
        Ok(stream)
    }

    /// Drops every consumer of `key`. Events already in flight are
    /// discarded.
    pub async fn unwatch(&self, key: &str) -> Result<(), ClientError> {
        let inner = &self.inner;
        let ready = inner.watch_ready.lock();
        if inner.watchers.unregister(key) && *ready && inner.state().is_established() {
            inner.send_oneway(Request::Unwatch {
                key: key.to_string(),
            })?;
        }
        Ok(())
    }

    /// Fetches the current value of a watcher key without subscribing.
    /// Returns `Nil` when the key was never broadcast.
    pub async fn watch_once(&self, key: &str) -> Result<Value, ClientError> {
        let mut body = self
            .request(Request::WatchOnce {
                key: key.to_string(),
            })
            .await?;
        Ok(match body.take_data() {
            Value::Array(mut values) if !values.is_empty() => values.swap_remove(0),
            _ => Value::Nil,
        })
    }

    /// Allocates a stream id unique within this connection.
    pub fn allocate_stream_id(&self) -> u64 {
        self.inner.streams.allocate()
    }

    pub fn stream_state(&self, stream_id: u64) -> Option<TransactionState> {
        self.inner.streams.state(stream_id)
    }

    /// Begins a transaction on a stream. The server rolls it back when
    /// `timeout` elapses; later requests on the stream then fail and the
    /// stream is marked [`TransactionState::AbortedByTimeout`].
    pub async fn begin(
        &self,
        stream_id: u64,
        timeout: Option<Duration>,
        isolation: TxnIsolation,
    ) -> Result<(), ClientError> {
        self.stream_request(
            stream_id,
            Request::Begin { timeout, isolation },
            TransactionState::Active,
        )
        .await
    }

    pub async fn commit(&self, stream_id: u64) -> Result<(), ClientError> {
        self.stream_request(stream_id, Request::Commit, TransactionState::Committed)
            .await
    }

    pub async fn rollback(&self, stream_id: u64) -> Result<(), ClientError> {
        self.stream_request(stream_id, Request::Rollback, TransactionState::RolledBack)
            .await
    }

    async fn stream_request(
        &self,
        stream_id: u64,
        request: Request,
        on_success: TransactionState,
    ) -> Result<(), ClientError> {
        self.call(request, RequestOptions::new().with_stream(stream_id))
            .await?;
        self.inner.streams.set(stream_id, on_success);
        Ok(())
    }

    /// Greeting received on connect.
    pub fn greeting(&self) -> Result<Greeting, ClientError> {
        self.inner
            .greeting
            .read()
            .clone()
            .ok_or(ClientError::NotNegotiated)
    }

    /// Negotiated protocol version, features and server identity.
    pub fn server_info(&self) -> Result<ServerInfo, ClientError> {
        self.inner
            .server_info
            .read()
            .clone()
            .ok_or(ClientError::NotNegotiated)
    }

    pub fn protocol_version(&self) -> Result<u64, ClientError> {
        self.server_info().map(|info| info.protocol_version)
    }

    pub fn features(&self) -> Result<FeatureSet, ClientError> {
        self.inner.features()
    }

    /// Schema version from the most recent reply header.
    pub fn schema_version(&self) -> Option<u64> {
        match self.inner.schema_version.load(Ordering::Relaxed) {
            0 => None,
            version => Some(version),
        }
    }

    /// Replies nobody was waiting for: late replies after a timeout, pushes
    /// for finished requests, unknown sync ids.
    pub fn subscribe_ignored(&self) -> broadcast::Receiver<Message> {
        self.inner.ignored.subscribe()
    }

    pub fn watchers(&self) -> Arc<WatcherRegistry> {
        self.inner.watchers.clone()
    }

    /// Resolves when the connection closes for `cause`. The sender is
    /// dropped if it closes for a different cause.
    pub fn on_close(&self, cause: CloseCause) -> oneshot::Receiver<CloseCause> {
        let (tx, rx) = oneshot::channel();
        let mut listeners = self.inner.close_listeners.lock();
        match self.state().closed_cause() {
            Some(closed) if closed == cause => {
                let _ = tx.send(closed);
            }
            Some(_) => {}
            None => listeners.entry(cause).or_default().push(tx),
        }
        rx
    }

    /// Waits until the connection is closed and returns the cause.
    pub async fn closed(&self) -> CloseCause {
        let mut rx = self.inner.state.subscribe();
        rx.wait_for(|state| state.closed_cause().is_some())
            .await
            .ok()
            .and_then(|state| state.closed_cause())
            .unwrap_or(CloseCause::Client)
    }

    /// Closes the connection. Pending requests fail with
    /// `Connection closed by client`. Idempotent.
    pub async fn close(&self) {
        self.inner
            .close(CloseCause::Client, ClientError::Closed(CloseCause::Client));
    }

    /// Stops accepting requests, waits for pending ones to finish, then
    /// closes with [`CloseCause::Shutdown`].
    pub async fn shutdown_close(&self) {
        self.inner.start_drain();
        self.closed().await;
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of request timers still armed.
    pub fn active_timer_count(&self) -> usize {
        self.inner.pending.active_timers()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.inner.config.addr)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Moves `from` to `to`. Fails with the state's error if another task
    /// moved the connection elsewhere (typically a concurrent close).
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> Result<(), ClientError> {
        let mut actual = from;
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                actual = *state;
                false
            }
        });
        if changed {
            tracing::trace!("Connection to {}: {} -> {}", self.config.addr, from, to);
            Ok(())
        } else {
            Err(actual.send_error().unwrap_or(ClientError::NotEstablished))
        }
    }

    fn state_error(&self) -> ClientError {
        self.state()
            .send_error()
            .unwrap_or(ClientError::Closed(CloseCause::Client))
    }

    fn features(&self) -> Result<FeatureSet, ClientError> {
        self.server_info
            .read()
            .as_ref()
            .map(|info| info.features)
            .ok_or(ClientError::NotNegotiated)
    }

    /// Fails if negotiation finished without `feature`. Passes while
    /// negotiation has not happened yet.
    fn require_negotiated(&self, feature: Feature) -> Result<(), ClientError> {
        match self.server_info.read().as_ref() {
            Some(info) if !info.features.contains(feature) => {
                Err(ClientError::FeatureNotSupported(feature))
            }
            _ => Ok(()),
        }
    }

    async fn establish(self: Arc<Self>) -> Result<Greeting, ClientError> {
        self.transition(ConnectionState::Init, ConnectionState::Connecting)?;
        match self.handshake().await {
            Ok(greeting) => {
                tracing::info!(
                    "Connected to {} ({} {})",
                    self.config.addr,
                    greeting.product,
                    greeting.version
                );
                Ok(greeting)
            }
            Err(err) => {
                tracing::debug!("Connect to {} failed: {}", self.config.addr, err);
                self.close(CloseCause::Client, ClientError::Closed(CloseCause::Client));
                Err(err)
            }
        }
    }

    async fn handshake(self: &Arc<Self>) -> Result<Greeting, ClientError> {
        let deadline = Instant::now() + self.config.connect_timeout();
        tracing::debug!("Connecting to {}...", self.config.addr);

        let mut stream = transport::open(&self.config, deadline).await?;
        self.transition(ConnectionState::Connecting, ConnectionState::AwaitingGreeting)?;

        let greeting = transport::read_greeting(&mut stream, &self.config, deadline).await?;
        tracing::debug!(
            "Greeting: {} {} ({}), instance {:?}",
            greeting.product,
            greeting.version,
            greeting.protocol,
            greeting.instance_uuid
        );
        *self.greeting.write() = Some(greeting.clone());

        {
            // A close that ran during the greeting leaves the flag set; the
            // stream is dropped here instead of being installed
            let mut slot = self.writer.lock();
            if self.closing.load(Ordering::SeqCst) {
                return Err(self.state_error());
            }
            self.transition(ConnectionState::AwaitingGreeting, ConnectionState::Established)?;

            let (reader, writer) = tokio::io::split(stream);
            let (frames, queue) = mpsc::unbounded_channel();
            tokio::spawn(self.clone().write_loop(writer, queue));
            tokio::spawn(self.clone().read_loop(reader));
            *slot = Some(frames);
        }

        self.negotiate(&greeting).await?;

        if let Some(user) = &self.config.user {
            let password = self.config.password.as_deref().unwrap_or("");
            self.authorize(user, password).await?;
        }

        self.resubscribe()?;
        Ok(greeting)
    }

    async fn negotiate(self: &Arc<Self>, greeting: &Greeting) -> Result<(), ClientError> {
        let request = Request::Id {
            version: PROTOCOL_VERSION,
            features: self.config.features,
        };
        let info = match self.call(request, RequestOptions::default()).await {
            Ok(body) => {
                let reply = IdResponse::from_body(&body)?;
                ServerInfo::negotiate(greeting, PROTOCOL_VERSION, self.config.features, &reply)
            }
            Err(ClientError::Server(err)) if err.is_unknown_request() => {
                tracing::debug!("Server does not support IPROTO_ID, assuming protocol 0");
                ServerInfo::legacy(greeting)
            }
            Err(err) => return Err(err),
        };
        tracing::debug!(
            "Negotiated protocol version {} with features [{}]",
            info.protocol_version,
            info.features
        );
        *self.server_info.write() = Some(info);
        Ok(())
    }

    async fn authorize(self: &Arc<Self>, user: &str, password: &str) -> Result<(), ClientError> {
        let salt = self
            .greeting
            .read()
            .as_ref()
            .map(|greeting| greeting.salt.clone())
            .ok_or(ClientError::NotEstablished)?;

        let Some(request) = self.auth.request(&salt, user, password) else {
            tracing::debug!("Already authorized as '{}'", user);
            return Ok(());
        };
        self.call(request, RequestOptions::default()).await?;
        self.auth.authorized(user);
        tracing::debug!("Authorized as '{}'", user);
        Ok(())
    }

    /// Subscribes every registered watcher key on this connection.
    fn resubscribe(&self) -> Result<(), ClientError> {
        if !self.features()?.contains(Feature::Watchers) {
            let keys = self.watchers.keys();
            if !keys.is_empty() {
                tracing::warn!(
                    "Server at {} does not support watchers; {} keys not subscribed",
                    self.config.addr,
                    keys.len()
                );
            }
            return Ok(());
        }

        if self.config.graceful_shutdown {
            self.watchers.register_internal(SHUTDOWN_EVENT_KEY);
        }
        let mut ready = self.watch_ready.lock();
        *ready = true;
        for key in self.watchers.keys_for_resubscribe() {
            tracing::debug!("Subscribing watcher '{}'", key);
            self.send_oneway(Request::Watch { key })?;
        }
        Ok(())
    }

    async fn call(
        self: &Arc<Self>,
        request: Request,
        options: RequestOptions,
    ) -> Result<Body, ClientError> {
        self.send(request, options).await?.await
    }

    async fn send(
        self: &Arc<Self>,
        request: Request,
        options: RequestOptions,
    ) -> Result<ResponseHandle, ClientError> {
        if let Some(err) = self.state().send_error() {
            return Err(err);
        }
        self.check_features(&request, options.stream_id)?;
        if let Some(stream_id) = options.stream_id {
            if !self.streams.contains(stream_id) {
                return Err(ClientError::UnknownStream(stream_id));
            }
        }

        let sync = self.next_sync.fetch_add(1, Ordering::Relaxed);
        let frame = Encoder::encode_request(&request, sync, options.stream_id)?;

        if !request.expects_reply() {
            self.queue_frame(frame)?;
            tracing::debug!("Queued {} sync={} (no reply expected)", request.describe(), sync);
            return Ok(ResponseHandle::ready(sync, Ok(Body::new())));
        }

        let (tx, rx) = oneshot::channel();
        let description = request.describe();
        let size = frame.len();
        {
            // Registered and queued under one lock, with no await between:
            // either both happen or neither does
            let writer = self.writer.lock();
            let queue = writer.as_ref().ok_or_else(|| self.state_error())?;
            self.pending.insert(
                sync,
                Pending::new(tx, options.push, options.stream_id, description.clone()),
            )?;
            if queue.send(frame).is_err() {
                self.pending.take(sync);
                return Err(self.state_error());
            }
        }
        tracing::debug!("Queued {} sync={} ({} bytes)", description, sync, size);

        if let Some(timeout) = options.timeout.or(self.config.request_timeout()) {
            let weak = Arc::downgrade(self);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    inner.expire(sync, timeout);
                }
            });
            self.pending.set_timer(sync, timer.abort_handle());
        }

        Ok(ResponseHandle { sync, rx })
    }

    /// Queues a request nobody waits a reply for.
    fn send_oneway(&self, request: Request) -> Result<(), ClientError> {
        if let Some(err) = self.state().send_error() {
            return Err(err);
        }
        let sync = self.next_sync.fetch_add(1, Ordering::Relaxed);
        let frame = Encoder::encode_request(&request, sync, None)?;
        self.queue_frame(frame)
    }

    fn check_features(&self, request: &Request, stream_id: Option<u64>) -> Result<(), ClientError> {
        let info = self.server_info.read();
        // Negotiation itself runs before the server info is known
        let Some(info) = info.as_ref() else {
            return Ok(());
        };
        let mut required = request.required_features();
        if stream_id.is_some() {
            required.insert(Feature::Streams);
        }
        let missing = required
            .iter()
            .find(|feature| !info.features.contains(*feature));
        match missing {
            Some(feature) => Err(ClientError::FeatureNotSupported(feature)),
            None => Ok(()),
        }
    }

    fn queue_frame(&self, frame: BytesMut) -> Result<(), ClientError> {
        let writer = self.writer.lock();
        let queue = writer.as_ref().ok_or_else(|| self.state_error())?;
        queue.send(frame).map_err(|_| self.state_error())
    }

    /// Writes queued frames in order. A frame is written whole unless the
    /// connection closes mid-write.
    async fn write_loop(
        self: Arc<Self>,
        mut writer: WriteHalf<ClientStream>,
        mut queue: mpsc::UnboundedReceiver<BytesMut>,
    ) {
        tracing::debug!("write_loop started");
        let failure = loop {
            let frame = tokio::select! {
                _ = self.write_stop.notified() => break None,
                frame = queue.recv() => match frame {
                    Some(frame) => frame,
                    None => break None,
                },
            };
            let written = tokio::select! {
                _ = self.write_stop.notified() => break None,
                written = writer.write_all(&frame) => written,
            };
            if let Err(e) = written {
                break Some(e);
            }
            tracing::trace!("write_loop: sent {} bytes", frame.len());
        };

        match failure {
            Some(e) => {
                tracing::debug!(
                    "write_loop: connection to {} lost: write error: {}",
                    self.config.addr,
                    e
                );
                let (cause, err) = self.shutdown.remote_close();
                self.close(cause, err);
            }
            None => {
                tracing::debug!("write_loop: stopped");
                if tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, writer.shutdown())
                    .await
                    .is_err()
                {
                    tracing::debug!("write_loop: socket shutdown timed out");
                }
            }
        }
    }

    fn expire(&self, sync: u64, elapsed: Duration) {
        if let Some(entry) = self.pending.take(sync) {
            tracing::debug!("{} sync={} timed out", entry.description, sync);
            let request = entry.description.clone();
            entry.complete(Err(ClientError::Timeout { request, elapsed }));
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: ReadHalf<ClientStream>) {
        tracing::debug!("read_loop started");
        let buffer_size = self.config.read_buffer_size;
        let mut decoder =
            Decoder::with_capacity(buffer_size).with_max_frame_size(self.config.max_response_size);

        let reason = 'read: loop {
            decoder.buffer_mut().reserve(buffer_size);
            let read = tokio::select! {
                _ = self.read_stop.notified() => {
                    tracing::debug!("read_loop: stopped");
                    return;
                }
                read = reader.read_buf(decoder.buffer_mut()) => read,
            };

            match read {
                Ok(0) => {
                    break match decoder.finish() {
                        Ok(()) => "end of stream".to_string(),
                        Err(e) => format!("end of stream inside a frame: {}", e),
                    };
                }
                Ok(n) => tracing::trace!("read_loop: received {} bytes", n),
                Err(e) => break format!("read error: {}", e),
            }

            loop {
                match decoder.decode_message() {
                    Ok(Some(message)) => self.dispatch(message),
                    Ok(None) => break,
                    Err(e) => break 'read format!("undecodable stream: {}", e),
                }
            }
        };

        tracing::debug!("read_loop: connection to {} lost: {}", self.config.addr, reason);
        let (cause, err) = self.shutdown.remote_close();
        self.close(cause, err);
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        if let Some(version) = message.header.schema_version {
            self.schema_version.store(version, Ordering::Relaxed);
        }
        if message.header.is_event() {
            return self.handle_event(message.body);
        }

        let sync = message.sync();
        if message.header.is_push() {
            match self.pending.push(sync, message.body.clone()) {
                PushOutcome::Delivered => {}
                PushOutcome::NoConsumer => {
                    tracing::debug!("Dropping push for sync={}: no push consumer", sync)
                }
                PushOutcome::NotPending => self.ignore(message),
            }
            return;
        }

        let Some(entry) = self.pending.take(sync) else {
            return self.ignore(message);
        };
        let result = response::into_result(message).map_err(ClientError::Server);
        if let (Some(stream_id), Err(ClientError::Server(err))) = (entry.stream_id, &result) {
            if err.is_transaction_timeout() {
                tracing::debug!("Transaction on stream {} aborted by timeout", stream_id);
                self.streams.mark_aborted(stream_id);
            }
        }
        entry.complete(result);
    }

    fn ignore(&self, message: Message) {
        tracing::warn!(
            "Ignoring packet sync={} type={:#x}: no pending request",
            message.sync(),
            message.header.code
        );
        let _ = self.ignored.send(message);
    }

    fn handle_event(self: &Arc<Self>, body: Body) {
        let event = match Event::from_body(body) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Dropping malformed event: {}", e);
                return;
            }
        };
        tracing::debug!("Event for watcher '{}'", event.key);

        if ShutdownCoordinator::is_notice(&event) && self.shutdown.record_notice() {
            tracing::info!(
                "Server {} is shutting down, draining {} pending requests",
                self.config.addr,
                self.pending.len()
            );
            self.start_drain();
        }

        // The server sends the next change only after an acknowledgement
        if self.watchers.dispatch(&event) == Dispatch::Delivered
            && self.watchers.is_registered(&event.key)
        {
            let key = event.key;
            if let Err(e) = self.send_oneway(Request::Watch { key: key.clone() }) {
                tracing::debug!("Watcher '{}' not acknowledged: {}", key, e);
            }
        }
    }

    /// Refuses new requests and closes with [`CloseCause::Shutdown`] once
    /// nothing is pending.
    fn start_drain(self: &Arc<Self>) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Established {
                *state = ConnectionState::Closing(CloseCause::Shutdown);
                true
            } else {
                false
            }
        });
        if !self.shutdown.begin_drain() {
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            inner.pending.wait_drained().await;
            inner.close(CloseCause::Shutdown, ClientError::FinishedByShutdown);
        });
    }

    /// Never waits on the socket: the writer task is told to stop and
    /// shuts the socket down on its own.
    fn close(&self, cause: CloseCause, pending_err: ClientError) {
        let queue = {
            let mut writer = self.writer.lock();
            if self.closing.swap(true, Ordering::SeqCst) {
                return;
            }
            writer.take()
        };
        self.state.send_replace(ConnectionState::Closing(cause));
        self.read_stop.notify_one();
        self.write_stop.notify_one();
        drop(queue);

        let failed = self.pending.close(pending_err);

        let listeners = {
            let mut listeners = self.close_listeners.lock();
            self.state.send_replace(ConnectionState::Closed(cause));
            std::mem::take(&mut *listeners)
        };
        // Listeners for other causes are dropped unfired
        for (listener_cause, senders) in listeners {
            if listener_cause == cause {
                for tx in senders {
                    let _ = tx.send(cause);
                }
            }
        }

        tracing::debug!(
            "Connection to {} closed by {} ({} pending requests failed)",
            self.config.addr,
            cause,
            failed
        );
    }
}
