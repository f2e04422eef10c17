//! Socket transport: address resolution, TCP connect, optional TLS, and the
//! unframed greeting read.

use crate::config::ConnectionConfig;
use crate::error::{ClientError, ConnectErrorKind};
use crate::tls::{create_insecure_tls_connector, create_tls_connector};
use iproto_protocol::greeting::{Greeting, GREETING_SIZE};
use pin_project_lite::pin_project;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_rustls::client::TlsStream as ClientTlsStream;

pin_project! {
    /// A client stream that can be either plain TCP or TLS.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: ClientTlsStream<TcpStream> },
    }
}

impl ClientStream {
    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls { .. })
    }
}

/// Resolves the configured address and opens a stream, all before `deadline`.
pub(crate) async fn open(
    config: &ConnectionConfig,
    deadline: Instant,
) -> Result<ClientStream, ClientError> {
    let addr = config.addr.as_str();
    let timed_out = || ClientError::connect(addr, ConnectErrorKind::Timeout, "connect budget elapsed");

    let candidates: Vec<SocketAddr> = timeout_at(deadline, tokio::net::lookup_host(addr))
        .await
        .map_err(|_| timed_out())?
        .map_err(|e| ClientError::connect_io(addr, ConnectErrorKind::Resolve, e))?
        .collect();
    if candidates.is_empty() {
        return Err(ClientError::connect(
            addr,
            ConnectErrorKind::Resolve,
            "no addresses found",
        ));
    }
    tracing::debug!("{} resolved to {:?}", addr, candidates);

    let mut last_err = None;
    let mut tcp_stream = None;
    for candidate in candidates {
        match timeout_at(deadline, TcpStream::connect(candidate)).await {
            Err(_) => return Err(timed_out()),
            Ok(Ok(stream)) => {
                tcp_stream = Some(stream);
                break;
            }
            Ok(Err(e)) => {
                tracing::debug!("Connect to {} failed: {}", candidate, e);
                last_err = Some(e);
            }
        }
    }
    let tcp_stream = match (tcp_stream, last_err) {
        (Some(stream), _) => stream,
        (None, Some(e)) => {
            return Err(ClientError::connect_io(
                addr,
                ConnectErrorKind::classify(&e),
                e,
            ))
        }
        (None, None) => return Err(ClientError::connect(addr, ConnectErrorKind::Other, "no candidates")),
    };

    // Requests are small and latency-bound
    tcp_stream.set_nodelay(true).ok();

    let Some(tls_config) = config.tls_enabled() else {
        return Ok(ClientStream::Plain { stream: tcp_stream });
    };

    let host = config.host();
    let (connector, server_name) = if tls_config.insecure {
        tracing::warn!("Using insecure TLS (certificate verification disabled)");
        create_insecure_tls_connector(tls_config, host)?
    } else {
        create_tls_connector(tls_config, host)?
    };

    tracing::debug!("Performing TLS handshake...");
    let tls_stream = timeout_at(deadline, connector.connect(server_name, tcp_stream))
        .await
        .map_err(|_| ClientError::HandshakeTimeout(config.connect_timeout()))?
        .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
    tracing::debug!("TLS handshake complete");

    Ok(ClientStream::Tls { stream: tls_stream })
}

/// Reads and parses the 128-byte greeting before `deadline`.
pub(crate) async fn read_greeting(
    stream: &mut ClientStream,
    config: &ConnectionConfig,
    deadline: Instant,
) -> Result<Greeting, ClientError> {
    let mut raw = [0u8; GREETING_SIZE];
    match timeout_at(deadline, stream.read_exact(&mut raw)).await {
        Err(_) => return Err(ClientError::HandshakeTimeout(config.connect_timeout())),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(ClientError::BadGreeting(
                "connection closed before the greeting was received".to_string(),
            ))
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(_)) => {}
    }
    Ok(Greeting::parse(&raw)?)
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_flush(cx),
            ClientStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ConnectionConfig::new(addr.to_string());
        let err = open(&config, deadline()).await.err().unwrap();
        assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Refused));
    }

    #[tokio::test]
    async fn test_unresolvable() {
        let config = ConnectionConfig::new("no-such-host.invalid:3301");
        let err = open(&config, deadline()).await.err().unwrap();
        assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Resolve));
    }

    #[tokio::test]
    async fn test_short_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"Tarantool 2.11.1 (Binary)").await.unwrap();
        });

        let config = ConnectionConfig::new(addr.to_string());
        let mut stream = open(&config, deadline()).await.unwrap();
        assert!(!stream.is_tls());
        let err = read_greeting(&mut stream, &config, deadline()).await.unwrap_err();
        assert!(matches!(err, ClientError::BadGreeting(_)));
    }

    #[tokio::test]
    async fn test_greeting_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            let _ = done_rx.await;
        });

        let config = ConnectionConfig::new(addr.to_string());
        let mut stream = open(&config, deadline()).await.unwrap();
        let soon = Instant::now() + Duration::from_millis(50);
        let err = read_greeting(&mut stream, &config, soon).await.unwrap_err();
        assert!(matches!(err, ClientError::HandshakeTimeout(_)));
        drop(done_tx);
    }
}
