//! Client side of a tunnel: dial a proxy, register a hostname, then serve
//! the HTTP/2 streams the proxy opens.

use async_trait::async_trait;
use bytes::Bytes;
use rustls::pki_types::{CertificateDer, ServerName};
use shroud_proto::{ProxyEndpoint, TunnelCodec, TunnelMessage, PROTOCOL_VERSION, TUNNEL_ALPN};
use shroud_transport::{
    AcceptedStream, AnonymousDialer, BoxedIo, TransportError, TransportResult, TunnelConnector,
    TunnelListener, TunnelSession,
};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::H2TunnelConfig;
use crate::pump::spawn_pump;

/// Accepted streams waiting for the tunnel owner; more are refused
pub const ACCEPT_QUEUE_SIZE: usize = 64;

/// Connects to proxies through an anonymous dialer
pub struct H2TunnelConnector {
    dialer: Arc<dyn AnonymousDialer>,
    tls_connector: TlsConnector,
    config: H2TunnelConfig,
}

impl std::fmt::Debug for H2TunnelConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2TunnelConnector")
            .field("dialer", &self.dialer)
            .finish()
    }
}

impl H2TunnelConnector {
    /// Proxies are verified against the web PKI plus `extra_roots`
    pub fn new(
        dialer: Arc<dyn AnonymousDialer>,
        extra_roots: &[CertificateDer<'static>],
        config: H2TunnelConfig,
    ) -> TransportResult<Self> {
        config.validate()?;

        let client_config = shroud_cert::client_config(extra_roots, &[TUNNEL_ALPN])
            .map_err(|e| TransportError::TlsError(e.to_string()))?;

        Ok(Self {
            dialer,
            tls_connector: TlsConnector::from(Arc::new(client_config)),
            config,
        })
    }

    async fn establish(&self, endpoint: &ProxyEndpoint) -> TransportResult<TlsStream<BoxedIo>> {
        let io = self.dialer.dial(&endpoint.host, endpoint.port).await?;

        let server_name = ServerName::try_from(endpoint.tls_name().to_string())
            .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))?;

        let tls_stream = self
            .tls_connector
            .connect(server_name, io)
            .await
            .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

        let (_, session) = tls_stream.get_ref();
        if session.alpn_protocol() != Some(TUNNEL_ALPN) {
            return Err(TransportError::ProtocolError(format!(
                "Proxy {} does not speak the tunnel protocol",
                endpoint
            )));
        }

        Ok(tls_stream)
    }
}

#[async_trait]
impl TunnelConnector for H2TunnelConnector {
    type Session = H2Session;

    async fn connect(&self, endpoint: &ProxyEndpoint) -> TransportResult<Self::Session> {
        debug!("Connecting to proxy {}", endpoint);

        let tls_stream = tokio::time::timeout(self.config.handshake_timeout, self.establish(endpoint))
            .await
            .map_err(|_| TransportError::Timeout)??;

        info!("Tunnel connection established to {}", endpoint);

        Ok(H2Session {
            endpoint: endpoint.clone(),
            io: Mutex::new(Some(tls_stream)),
            config: self.config.clone(),
        })
    }
}

/// A TLS connection to one proxy, not yet switched to HTTP/2.
///
/// A session registers exactly one hostname.
pub struct H2Session {
    endpoint: ProxyEndpoint,
    io: Mutex<Option<TlsStream<BoxedIo>>>,
    config: H2TunnelConfig,
}

impl std::fmt::Debug for H2Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Session")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[async_trait]
impl TunnelSession for H2Session {
    type Listener = H2TunnelListener;

    async fn listen(&self, hostname: &str) -> TransportResult<Self::Listener> {
        let mut io = self.io.lock().await.take().ok_or_else(|| {
            TransportError::ConfigurationError(format!(
                "Session to {} is already listening",
                self.endpoint
            ))
        })?;

        let request = TunnelMessage::Listen {
            hostname: hostname.to_string(),
            version: PROTOCOL_VERSION,
        };

        let reply = tokio::time::timeout(self.config.handshake_timeout, async {
            TunnelCodec::write_message(&mut io, &request).await?;
            TunnelCodec::read_message(&mut io).await
        })
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        match reply {
            TunnelMessage::Listening { hostname: bound } if bound == hostname => {}
            TunnelMessage::ListenRejected { reason } => {
                return Err(TransportError::ListenRejected(reason));
            }
            other => {
                return Err(TransportError::ProtocolError(format!(
                    "Unexpected handshake reply: {:?}",
                    other
                )));
            }
        }

        // Roles reverse here: the proxy opens streams, we accept them
        let connection = self
            .config
            .server_builder()
            .handshake::<_, Bytes>(io)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("H2 handshake failed: {}", e)))?;

        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);
        let label = format!("{}@{}", hostname, self.endpoint);
        tokio::spawn(drive_connection(
            connection,
            tx,
            self.config.stream_buffer_size,
            label,
        ));

        info!("Listening for {} on {}", hostname, self.endpoint);

        Ok(H2TunnelListener {
            hostname: hostname.to_string(),
            endpoint: self.endpoint.clone(),
            accept_rx: rx,
        })
    }
}

/// Accept loop of the HTTP/2 connection.
///
/// Runs until the connection closes. Once the listener is dropped the
/// connection is shut down gracefully so streams already handed out can
/// finish.
async fn drive_connection(
    mut connection: h2::server::Connection<TlsStream<BoxedIo>, Bytes>,
    tx: mpsc::Sender<AcceptedStream<DuplexStream>>,
    buffer_size: usize,
    label: String,
) {
    let mut closing = false;

    loop {
        let next = if closing {
            Some(connection.accept().await)
        } else {
            tokio::select! {
                next = connection.accept() => Some(next),
                _ = tx.closed() => None,
            }
        };

        let result = match next {
            Some(Some(result)) => result,
            Some(None) => break,
            None => {
                debug!("[{}] Listener dropped, shutting down tunnel", label);
                connection.graceful_shutdown();
                closing = true;
                continue;
            }
        };

        let (request, mut respond) = match result {
            Ok(accepted) => accepted,
            Err(e) => {
                if !e.is_go_away() && !e.is_io() {
                    warn!("[{}] H2 accept error: {}", label, e);
                }
                break;
            }
        };

        if closing {
            respond.send_reset(h2::Reason::REFUSED_STREAM);
            continue;
        }

        // The connection is only polled by this loop, so it must never wait
        // on the listener. A full queue refuses the stream instead.
        let permit = match tx.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                warn!("[{}] Accept queue full, refusing stream", label);
                respond.send_reset(h2::Reason::REFUSED_STREAM);
                continue;
            }
            Err(TrySendError::Closed(())) => {
                respond.send_reset(h2::Reason::REFUSED_STREAM);
                continue;
            }
        };

        let response = match http::Response::builder().status(http::StatusCode::OK).body(()) {
            Ok(response) => response,
            Err(e) => {
                warn!("[{}] Failed to build response: {}", label, e);
                continue;
            }
        };

        let send = match respond.send_response(response, false) {
            Ok(send) => send,
            Err(e) => {
                debug!("[{}] Failed to accept stream: {}", label, e);
                continue;
            }
        };

        let stream_id = u64::from(send.stream_id().as_u32());
        let stream = spawn_pump(send, request.into_body(), buffer_size, stream_id);
        debug!("[{}] Accepted stream {}", label, stream_id);

        permit.send(AcceptedStream { stream_id, stream });
    }

    debug!("[{}] H2 connection closed", label);
}

/// Streams for one hostname on one proxy
pub struct H2TunnelListener {
    hostname: String,
    endpoint: ProxyEndpoint,
    accept_rx: mpsc::Receiver<AcceptedStream<DuplexStream>>,
}

impl std::fmt::Debug for H2TunnelListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2TunnelListener")
            .field("hostname", &self.hostname)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[async_trait]
impl TunnelListener for H2TunnelListener {
    type Stream = DuplexStream;

    async fn accept(&mut self) -> TransportResult<Option<AcceptedStream<Self::Stream>>> {
        Ok(self.accept_rx.recv().await)
    }
}
