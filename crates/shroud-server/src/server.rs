//! Public proxy server
//!
//! Three listeners share one [`TunnelRegistry`]:
//! - tunnel listener: shroud clients register a hostname over TLS
//! - public listener: raw TLS from the internet, routed on SNI, never
//!   decrypted
//! - redirect listener: plain HTTP sent to HTTPS

use shroud_proto::{normalize_hostname, TUNNEL_ALPN};
use shroud_transport::{splice, TransportError};
use shroud_transport_h2::{accept_tunnel, read_listen_request, reject, H2TunnelConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::{ProxyServerConfig, ProxyServerError, STREAM_OPEN_TIMEOUT};
use crate::redirect::redirect_router;
use crate::registry::TunnelRegistry;
use crate::sni::{read_client_hello, SniError};

/// Accepts tunnel connections from shroud clients
pub struct TunnelAcceptor {
    acceptor: TlsAcceptor,
    registry: Arc<TunnelRegistry>,
    config: H2TunnelConfig,
}

impl TunnelAcceptor {
    /// `tls_config` must advertise the tunnel ALPN protocol
    pub fn new(
        tls_config: rustls::ServerConfig,
        registry: Arc<TunnelRegistry>,
        config: H2TunnelConfig,
    ) -> Self {
        Self {
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            registry,
            config,
        }
    }

    /// Accept tunnels forever
    pub async fn serve(self, listener: TcpListener) {
        let this = Arc::new(self);
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("New tunnel connection from {}", peer_addr);
                    let this = this.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle(socket).await {
                            warn!("Tunnel connection from {} failed: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Tunnel listener accept error: {}", e);
                }
            }
        }
    }

    async fn handle(&self, socket: TcpStream) -> Result<(), TransportError> {
        let _ = socket.set_nodelay(true);

        let mut tls = tokio::time::timeout(self.config.handshake_timeout, self.acceptor.accept(socket))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

        let requested = read_listen_request(&mut tls, &self.config).await?;
        let Some(hostname) = normalize_hostname(&requested) else {
            reject(&mut tls, &format!("Invalid hostname '{}'", requested)).await?;
            return Err(TransportError::ProtocolError(format!(
                "invalid hostname '{}'",
                requested
            )));
        };

        let reservation = match self.registry.reserve(&hostname) {
            Ok(reservation) => reservation,
            Err(e) => {
                info!("Rejecting tunnel for {}: {}", hostname, e);
                reject(&mut tls, &e.to_string()).await?;
                let _ = tls.shutdown().await;
                return Ok(());
            }
        };

        // The reply echoes the name exactly as the client sent it
        let tunnel = Arc::new(accept_tunnel(tls, &requested, &self.config).await?);
        let tunnel_id = tunnel.id();
        reservation.bind(tunnel.clone());
        info!("[tunnel {}] Listening for {}", tunnel_id, hostname);

        tunnel.closed().await;
        self.registry.unregister(&hostname, tunnel_id);
        info!("[tunnel {}] Closed, {} unbound", tunnel_id, hostname);

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum PublicConnectionError {
    #[error("Timed out waiting for ClientHello")]
    Timeout,

    #[error(transparent)]
    Sni(#[from] SniError),

    #[error("No tunnel for {0}")]
    NoTunnel(String),

    #[error("Timed out opening a stream to the tunnel for {0}")]
    OpenTimeout(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Failed to replay ClientHello: {0}")]
    Replay(#[source] std::io::Error),
}

/// Routes public TLS connections into tunnels by SNI
pub struct PublicListener {
    registry: Arc<TunnelRegistry>,
    client_hello_timeout: Duration,
    open_timeout: Duration,
}

impl PublicListener {
    pub fn new(registry: Arc<TunnelRegistry>, client_hello_timeout: Duration) -> Self {
        Self {
            registry,
            client_hello_timeout,
            open_timeout: STREAM_OPEN_TIMEOUT,
        }
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Route connections forever
    pub async fn serve(self, listener: TcpListener) {
        let this = Arc::new(self);
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let this = this.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle(socket, peer_addr).await {
                            debug!("Public connection from {} dropped: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Public listener accept error: {}", e);
                }
            }
        }
    }

    async fn handle(
        &self,
        mut socket: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), PublicConnectionError> {
        let _ = socket.set_nodelay(true);

        let hello = tokio::time::timeout(self.client_hello_timeout, read_client_hello(&mut socket))
            .await
            .map_err(|_| PublicConnectionError::Timeout)??;

        let tunnel = self
            .registry
            .lookup(&hello.server_name)
            .ok_or_else(|| PublicConnectionError::NoTunnel(hello.server_name.clone()))?;

        debug!(
            "[tunnel {}] Public connection from {} for {}",
            tunnel.id(),
            peer_addr,
            hello.server_name
        );

        let mut stream = tokio::time::timeout(self.open_timeout, tunnel.open_stream())
            .await
            .map_err(|_| PublicConnectionError::OpenTimeout(hello.server_name.clone()))??;
        stream
            .write_all(&hello.raw)
            .await
            .map_err(PublicConnectionError::Replay)?;

        let report = splice(socket, stream).await;
        debug!(
            "[tunnel {}] Public connection from {} closed ({} bytes in, {} bytes out)",
            tunnel.id(),
            peer_addr,
            report.forward.bytes + hello.raw.len() as u64,
            report.backward.bytes
        );

        Ok(())
    }
}

/// Serve the HTTP redirect on `listener`, or never return when disabled
async fn serve_redirect(listener: Option<TcpListener>) -> Result<(), ProxyServerError> {
    match listener {
        Some(listener) => axum::serve(listener, redirect_router())
            .await
            .map_err(ProxyServerError::Redirect),
        None => std::future::pending().await,
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ProxyServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ProxyServerError::Bind { addr, source })
}

/// The whole proxy: tunnel, public and redirect listeners
pub struct ProxyServer {
    config: ProxyServerConfig,
    registry: Arc<TunnelRegistry>,
}

impl ProxyServer {
    pub fn new(config: ProxyServerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(TunnelRegistry::new()),
        }
    }

    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.registry.clone()
    }

    /// Load certificates, bind every listener, then serve until one fails
    pub async fn start(self) -> Result<(), ProxyServerError> {
        self.config.tunnel.validate()?;
        let tls_config = shroud_cert::server_config_from_files(
            &self.config.tunnel_cert_path,
            &self.config.tunnel_key_path,
            &[TUNNEL_ALPN],
        )?;

        let tunnel_listener = bind(self.config.tunnel_addr).await?;
        let public_listener = bind(self.config.tls_addr).await?;
        let http_listener = match self.config.http_addr {
            Some(addr) => Some(bind(addr).await?),
            None => None,
        };

        info!("Tunnel listener on {}", self.config.tunnel_addr);
        info!("Public TLS listener on {} (SNI routing)", self.config.tls_addr);
        match self.config.http_addr {
            Some(addr) => info!("HTTP redirect listener on {}", addr),
            None => info!("HTTP redirect listener disabled"),
        }

        let tunnels = TunnelAcceptor::new(tls_config, self.registry.clone(), self.config.tunnel);
        let public = PublicListener::new(self.registry, self.config.client_hello_timeout)
            .with_open_timeout(self.config.stream_open_timeout);

        run_until_first_exit(
            tunnels.serve(tunnel_listener),
            public.serve(public_listener),
            serve_redirect(http_listener),
        )
        .await
    }
}

async fn run_until_first_exit(
    tunnels: impl Future<Output = ()>,
    public: impl Future<Output = ()>,
    redirect: impl Future<Output = Result<(), ProxyServerError>>,
) -> Result<(), ProxyServerError> {
    tokio::select! {
        _ = tunnels => Ok(()),
        _ = public => Ok(()),
        result = redirect => result,
    }
}
