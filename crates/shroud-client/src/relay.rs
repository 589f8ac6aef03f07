//! Relay Engine: connects one public stream to the private service

use shroud_transport::{splice, SpliceReport};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ServiceConfig};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to connect to local service {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with public client failed: {0}")]
    Tls(#[source] io::Error),

    #[error("Relay cancelled")]
    Cancelled,
}

/// Relay `public` to `service_addr`, terminating TLS on `public` first when
/// `tls` is set.
///
/// Completes when both copy directions are done. Dropping `public` on error
/// closes it.
pub async fn relay<S>(
    public: S,
    service_addr: &str,
    tls: Option<&TlsAcceptor>,
) -> Result<SpliceReport, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // Dial before the handshake so an unreachable service costs no TLS work
    let service = TcpStream::connect(service_addr)
        .await
        .map_err(|source| RelayError::Dial {
            addr: service_addr.to_string(),
            source,
        })?;
    let _ = service.set_nodelay(true);

    match tls {
        Some(acceptor) => {
            let public = acceptor.accept(public).await.map_err(RelayError::Tls)?;
            Ok(splice(public, service).await)
        }
        None => Ok(splice(public, service).await),
    }
}

/// Relays for one [`ServiceConfig`]
#[derive(Clone)]
pub struct RelayEngine {
    service_addr: String,
    tls: Option<TlsAcceptor>,
}

impl std::fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEngine")
            .field("service_addr", &self.service_addr)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl RelayEngine {
    /// Loads the TLS key pair when the service terminates TLS
    pub fn new(service: &ServiceConfig) -> Result<Self, ConfigError> {
        let tls = match &service.tls {
            Some(files) => {
                let config =
                    shroud_cert::server_config_from_files(&files.cert_path, &files.key_path, &[])?;
                Some(TlsAcceptor::from(Arc::new(config)))
            }
            None => None,
        };

        Ok(Self {
            service_addr: service.local_addr.clone(),
            tls,
        })
    }

    pub fn with_acceptor(service_addr: impl Into<String>, tls: Option<TlsAcceptor>) -> Self {
        Self {
            service_addr: service_addr.into(),
            tls,
        }
    }

    pub fn service_addr(&self) -> &str {
        &self.service_addr
    }

    pub fn terminates_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Relay one stream, giving up when `cancel` fires.
    ///
    /// Both copy directions stop together on cancellation.
    pub async fn relay<S>(
        &self,
        stream_id: u64,
        public: S,
        cancel: CancellationToken,
    ) -> Result<SpliceReport, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        debug!(stream_id, "Relaying to {}", self.service_addr);

        let report = tokio::select! {
            result = relay(public, &self.service_addr, self.tls.as_ref()) => result,
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
        };

        match &report {
            Ok(report) => log_report(stream_id, report),
            Err(RelayError::Cancelled) => debug!(stream_id, "Relay cancelled"),
            Err(e) => warn!(stream_id, "Relay failed: {}", e),
        }
        report
    }
}

fn log_report(stream_id: u64, report: &SpliceReport) {
    info!(
        stream_id,
        to_service = report.forward.bytes,
        to_client = report.backward.bytes,
        "Relay finished"
    );
    if let Some(e) = &report.forward.error {
        warn!(stream_id, "Error copying to local service: {}", e);
    }
    if let Some(e) = &report.backward.error {
        warn!(stream_id, "Error copying to public client: {}", e);
    }
}
