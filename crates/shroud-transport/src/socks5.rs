//! SOCKS5 client (RFC 1928, CONNECT only) with optional RFC 1929
//! username/password authentication.
//!
//! The target is always sent as a domain name so the proxy resolves it.
//! Pointed at a Tor SOCKS port this keeps every DNS query inside the
//! anonymizing network.

use crate::{AnonymousDialer, BoxedIo, TransportError, TransportResult};
use async_trait::async_trait;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// SOCKS5 protocol constants
const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH_REQUIRED: u8 = 0x00;
const USERNAME_PASSWORD: u8 = 0x02;
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;
const AUTH_VERSION: u8 = 0x01;
const CONNECT_COMMAND: u8 = 0x01;
const IPV4_ADDRESS: u8 = 0x01;
const DOMAIN_NAME: u8 = 0x03;
const IPV6_ADDRESS: u8 = 0x04;

const SUCCESS: u8 = 0x00;

/// Circuits through Tor can take a long time to build
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct Socks5Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Socks5Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socks5Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Dials through a SOCKS5 proxy such as the Tor client's SOCKS port
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy_addr: String,
    credentials: Option<Socks5Credentials>,
    dial_timeout: Duration,
}

impl Socks5Dialer {
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            credentials: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    /// Authenticate with username/password.
    ///
    /// Tor uses distinct credentials to isolate circuits from each other.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Socks5Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }

    async fn dial_inner(&self, host: &str, port: u16) -> TransportResult<TcpStream> {
        let mut stream = TcpStream::connect(&self.proxy_addr).await.map_err(|e| {
            TransportError::ConnectionError(format!(
                "Failed to reach SOCKS5 proxy {}: {}",
                self.proxy_addr, e
            ))
        })?;
        stream.set_nodelay(true).ok();

        connect_via(&mut stream, host, port, self.credentials.as_ref()).await?;
        Ok(stream)
    }
}

#[async_trait]
impl AnonymousDialer for Socks5Dialer {
    async fn dial(&self, host: &str, port: u16) -> TransportResult<BoxedIo> {
        debug!("Dialing {}:{} via SOCKS5 proxy {}", host, port, self.proxy_addr);

        let stream = tokio::time::timeout(self.dial_timeout, self.dial_inner(host, port))
            .await
            .map_err(|_| TransportError::Timeout)??;

        debug!("SOCKS5 connection to {}:{} established", host, port);
        Ok(Box::new(stream))
    }
}

/// Run the SOCKS5 handshake on an already connected stream and ask the proxy
/// to CONNECT to `host:port`.
pub async fn connect_via<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<&Socks5Credentials>,
) -> TransportResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if host.is_empty() || host.len() > 255 {
        return Err(TransportError::ConfigurationError(format!(
            "SOCKS5 target host must be 1-255 bytes, got {}",
            host.len()
        )));
    }

    // === Greeting ===
    // VER | NMETHODS | METHODS
    let greeting: &[u8] = match credentials {
        Some(_) => &[SOCKS_VERSION, 1, USERNAME_PASSWORD],
        None => &[SOCKS_VERSION, 1, NO_AUTH_REQUIRED],
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(TransportError::ProtocolError(format!(
            "Unsupported SOCKS version in reply: {}",
            choice[0]
        )));
    }

    match (choice[1], credentials) {
        (NO_AUTH_REQUIRED, None) => {}
        (USERNAME_PASSWORD, Some(creds)) => authenticate(stream, creds).await?,
        (NO_ACCEPTABLE_METHODS, _) => {
            return Err(TransportError::AuthenticationFailed(
                "SOCKS5 proxy accepted none of the offered methods".to_string(),
            ))
        }
        (method, _) => {
            return Err(TransportError::ProtocolError(format!(
                "SOCKS5 proxy selected unexpected method {:#04x}",
                method
            )))
        }
    }

    // === Request ===
    // VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS_VERSION, CONNECT_COMMAND, 0x00, DOMAIN_NAME]);
    request.push(host.len() as u8);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    // === Reply ===
    // VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(TransportError::ProtocolError(format!(
            "Unsupported SOCKS version in reply: {}",
            header[0]
        )));
    }
    if header[1] != SUCCESS {
        return Err(TransportError::SocksRejected(reply_message(header[1]).to_string()));
    }

    let bound = match header[3] {
        IPV4_ADDRESS => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        IPV6_ADDRESS => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        DOMAIN_NAME => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        other => {
            return Err(TransportError::ProtocolError(format!(
                "Unsupported address type in SOCKS5 reply: {}",
                other
            )))
        }
    };
    let mut bound_port = [0u8; 2];
    stream.read_exact(&mut bound_port).await?;

    debug!(
        "SOCKS5 proxy bound {}:{} for {}:{}",
        bound,
        u16::from_be_bytes(bound_port),
        host,
        port
    );
    Ok(())
}

/// RFC 1929 username/password subnegotiation
async fn authenticate<S>(stream: &mut S, creds: &Socks5Credentials) -> TransportResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if creds.username.len() > 255 || creds.password.len() > 255 {
        return Err(TransportError::ConfigurationError(
            "SOCKS5 username and password must each be at most 255 bytes".to_string(),
        ));
    }

    let mut request = Vec::with_capacity(3 + creds.username.len() + creds.password.len());
    request.push(AUTH_VERSION);
    request.push(creds.username.len() as u8);
    request.extend_from_slice(creds.username.as_bytes());
    request.push(creds.password.len() as u8);
    request.extend_from_slice(creds.password.as_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != SUCCESS {
        return Err(TransportError::AuthenticationFailed(
            "SOCKS5 proxy rejected username/password".to_string(),
        ));
    }
    Ok(())
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}
