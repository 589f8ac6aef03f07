//! Proxy server configuration

use shroud_cert::CertError;
use shroud_transport::TransportError;
use shroud_transport_h2::H2TunnelConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Time a public client gets to send its ClientHello
pub const CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Time a shroud client gets to accept a stream for a public connection
pub const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProxyServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Invalid address '{0}': expected host:port or 'none'")]
    InvalidAddress(String),

    #[error("HTTP redirect server failed: {0}")]
    Redirect(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Where shroud clients connect
    pub tunnel_addr: SocketAddr,
    /// Where the public connects with TLS
    pub tls_addr: SocketAddr,
    /// Plain HTTP redirect listener, `None` when disabled
    pub http_addr: Option<SocketAddr>,
    pub tunnel_cert_path: PathBuf,
    pub tunnel_key_path: PathBuf,
    pub client_hello_timeout: Duration,
    pub stream_open_timeout: Duration,
    pub tunnel: H2TunnelConfig,
}

impl ProxyServerConfig {
    pub fn new(
        tunnel_addr: SocketAddr,
        tls_addr: SocketAddr,
        http_addr: Option<SocketAddr>,
        tunnel_cert_path: PathBuf,
        tunnel_key_path: PathBuf,
    ) -> Self {
        Self {
            tunnel_addr,
            tls_addr,
            http_addr,
            tunnel_cert_path,
            tunnel_key_path,
            client_hello_timeout: CLIENT_HELLO_TIMEOUT,
            stream_open_timeout: STREAM_OPEN_TIMEOUT,
            tunnel: H2TunnelConfig::default(),
        }
    }
}

/// Parse a listen address where `none` disables the listener
pub fn parse_optional_addr(value: &str) -> Result<Option<SocketAddr>, ProxyServerError> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| ProxyServerError::InvalidAddress(value.to_string()))
}
