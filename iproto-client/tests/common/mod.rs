//! Scripted IProto server for integration tests.

#![allow(dead_code)]

use iproto_client::ConnectionConfig;
use iproto_protocol::keys::body;
use iproto_protocol::response::{error_message, Event, IdResponse};
use iproto_protocol::{
    Body, Decoder, FeatureSet, Greeting, Header, Message, ProtocolError, RequestType,
    ServerError, Value, PROTOCOL_VERSION,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

pub const SALT: [u8; 32] = [7; 32];

pub fn greeting() -> Greeting {
    Greeting {
        product: "Tarantool".to_string(),
        version: "2.11.1".to_string(),
        protocol: "Binary".to_string(),
        instance_uuid: Some(uuid::Uuid::nil()),
        salt: SALT.to_vec(),
    }
}

/// Routes client logs to the test harness; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A listening server that runs `handler` for every accepted connection.
pub struct MockServer {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl MockServer {
    pub async fn start<F, Fut>(handler: F) -> Self
    where
        F: Fn(ServerConn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handler(ServerConn::new(stream)));
            }
        });
        Self { addr, accepted }
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.addr.to_string())
            .with_connect_timeout(Duration::from_secs(2))
            .with_request_timeout(Some(Duration::from_secs(5)))
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Server side of one connection.
pub struct ServerConn {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    decoder: Decoder,
}

impl ServerConn {
    fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader,
            writer,
            decoder: Decoder::new(),
        }
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        let _ = self.writer.write_all(bytes).await;
    }

    pub async fn greet(&mut self) {
        let raw = greeting().encode().unwrap();
        self.write_raw(&raw).await;
    }

    /// Reads the next message; `None` once the client disconnects or sends
    /// something undecodable.
    pub async fn recv(&mut self) -> Option<Message> {
        self.try_recv().await.ok()?
    }

    /// Like [`recv`](Self::recv), but reports bytes that do not decode.
    pub async fn try_recv(&mut self) -> Result<Option<Message>, ProtocolError> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            if let Some(message) = self.decoder.decode_message()? {
                return Ok(Some(message));
            }
            match self.reader.read(&mut buf).await {
                Ok(0) => {
                    self.decoder.finish()?;
                    return Ok(None);
                }
                Err(_) => return Ok(None),
                Ok(n) => self.decoder.extend(&buf[..n]),
            }
        }
    }

    pub async fn send(&mut self, message: &Message) {
        let frame = message.encode().unwrap();
        self.write_raw(&frame).await;
    }

    pub async fn reply(&mut self, sync: u64, body: Body) {
        self.send(&Message::new(Header::new(0, sync), body)).await;
    }

    pub async fn reply_data(&mut self, sync: u64, data: Vec<Value>) {
        self.reply(sync, Body::new().with(body::DATA, Value::Array(data)))
            .await;
    }

    pub async fn reply_error(&mut self, sync: u64, err: &ServerError) {
        self.send(&error_message(sync, err)).await;
    }

    pub async fn push(&mut self, sync: u64, data: Value) {
        let message = Message::new(
            Header::request(RequestType::Chunk, sync),
            Body::new().with(body::DATA, Value::Array(vec![data])),
        );
        self.send(&message).await;
    }

    pub async fn event(&mut self, key: &str, data: Value) {
        self.send(&Event::new(key, data).to_message()).await;
    }

    /// Sends the greeting and answers `IPROTO_ID` with `features`.
    pub async fn handshake_with(&mut self, features: FeatureSet) {
        self.greet().await;
        let id = self.recv().await.expect("IPROTO_ID");
        assert_eq!(id.header.request_type(), Some(RequestType::Id));
        let reply = IdResponse {
            version: PROTOCOL_VERSION,
            features,
            auth_type: Some("chap-sha1".to_string()),
        };
        self.reply(id.sync(), reply.to_body()).await;
    }

    pub async fn handshake(&mut self) {
        self.handshake_with(FeatureSet::all()).await;
    }

    /// Answers pings and echoes call arguments until the client leaves.
    /// Watch frames are consumed silently.
    pub async fn serve(mut self) {
        while let Some(message) = self.recv().await {
            self.answer(message).await;
        }
    }

    pub async fn answer(&mut self, message: Message) {
        let sync = message.sync();
        match message.header.request_type() {
            Some(RequestType::Watch | RequestType::Unwatch) => {}
            Some(RequestType::Call) => {
                let args = match message.body.get(body::TUPLE) {
                    Some(Value::Array(args)) => args.clone(),
                    _ => Vec::new(),
                };
                self.reply_data(sync, args).await;
            }
            _ => self.reply(sync, Body::new()).await,
        }
    }
}

/// First argument of a `CALL` request.
pub fn first_arg(message: &Message) -> Option<&Value> {
    match message.body.get(body::TUPLE) {
        Some(Value::Array(args)) => args.first(),
        _ => None,
    }
}

/// Key of a `WATCH`/`UNWATCH` request.
pub fn watch_key(message: &Message) -> Option<String> {
    message.body.get_str(body::EVENT_KEY).map(str::to_string)
}
