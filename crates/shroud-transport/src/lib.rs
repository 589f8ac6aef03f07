//! Transport abstraction layer for shroud tunnels
//!
//! The client core never talks to sockets or tunnel protocols directly. It
//! sees three capabilities, all defined here:
//!
//! ```text
//! AnonymousDialer   open a TCP connection to host:port through an anonymizing proxy
//! TunnelConnector   turn a proxy endpoint into a live TunnelSession
//! TunnelSession     register a hostname, yielding a TunnelListener
//! TunnelListener    accept streams for that hostname; None once the tunnel closed
//! ```
//!
//! `shroud-transport-h2` implements the tunnel traits over HTTP/2; tests
//! implement them with in-memory fakes.

pub mod socks5;
pub mod splice;

pub use socks5::{Socks5Credentials, Socks5Dialer};
pub use splice::{splice, CopyReport, SpliceReport};

use async_trait::async_trait;
use shroud_proto::ProxyEndpoint;
use std::fmt::Debug;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("SOCKS5 proxy refused the connection: {0}")]
    SocksRejected(String),

    #[error("Proxy rejected listen request: {0}")]
    ListenRejected(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Any bidirectional byte stream that can cross task boundaries
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased byte stream returned by dialers
pub type BoxedIo = Box<dyn TunnelIo>;

/// Opens TCP connections through an anonymizing network.
#[async_trait]
pub trait AnonymousDialer: Send + Sync + Debug {
    /// Connect to `host:port`. Implementations should resolve `host` on the
    /// far side so no DNS query leaks from the local machine.
    async fn dial(&self, host: &str, port: u16) -> TransportResult<BoxedIo>;
}

/// Plain TCP dialer, for tests and local development only
#[derive(Debug, Clone, Default)]
pub struct DirectDialer;

#[async_trait]
impl AnonymousDialer for DirectDialer {
    async fn dial(&self, host: &str, port: u16) -> TransportResult<BoxedIo> {
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            TransportError::ConnectionError(format!("Failed to connect to {}:{}: {}", host, port, e))
        })?;
        Ok(Box::new(stream))
    }
}

/// A stream accepted from a tunnel
#[derive(Debug)]
pub struct AcceptedStream<S> {
    /// Identifier unique within the session, for logging
    pub stream_id: u64,
    pub stream: S,
}

/// Establishes sessions with proxy endpoints.
#[async_trait]
pub trait TunnelConnector: Send + Sync + Debug {
    type Session: TunnelSession;

    /// Connect to `endpoint`, authenticating the proxy by its host name
    async fn connect(&self, endpoint: &ProxyEndpoint) -> TransportResult<Self::Session>;
}

/// One live connection to one proxy endpoint.
#[async_trait]
pub trait TunnelSession: Send + Sync + Debug {
    type Listener: TunnelListener;

    /// Ask the proxy to route public connections for `hostname` to us
    async fn listen(&self, hostname: &str) -> TransportResult<Self::Listener>;
}

/// Source of inbound streams for one registered hostname.
#[async_trait]
pub trait TunnelListener: Send + Debug {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Next inbound stream.
    ///
    /// Returns `Ok(None)` once the tunnel has closed and no more streams
    /// will arrive.
    async fn accept(&mut self) -> TransportResult<Option<AcceptedStream<Self::Stream>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_direct_dialer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello").await.unwrap();
        });

        let mut stream = DirectDialer.dial("127.0.0.1", port).await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_direct_dialer_refused() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = DirectDialer.dial("127.0.0.1", port).await;
        assert!(matches!(result, Err(TransportError::ConnectionError(_))));
    }
}
