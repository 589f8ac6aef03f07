//! Proxy Set Source: the list of proxy endpoints to tunnel through
//!
//! Either the explicit list from the command line, or the answer of the
//! discovery service fetched through the anonymous dialer. The discovery
//! request is a single HTTP/1.1 GET run with hyper over the dialed stream.

use rustls::pki_types::{CertificateDer, ServerName};
use shroud_proto::{EndpointError, ProxyEndpoint};
use shroud_transport::{AnonymousDialer, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::{header, Method, Request};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use url::Url;

use crate::config::{ConfigError, ProxySource};

/// Discovery responses are a handful of lines
const MAX_RESPONSE_BODY: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProxySourceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to connect to discovery service {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: TransportError,
    },

    #[error("TLS error talking to discovery service: {0}")]
    Tls(String),

    #[error("Failed to fetch proxies: {0}")]
    Fetch(#[from] hyper::Error),

    #[error("Discovery service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid discovery response: {0}")]
    InvalidResponse(String),

    #[error("Discovery service returned an invalid proxy address: {0}")]
    InvalidEndpoint(#[from] EndpointError),

    #[error("Discovery service returned no proxies for '{0}'")]
    Empty(String),

    #[error("Timeout fetching proxies")]
    Timeout,
}

/// Queries the discovery service through the anonymous dialer
pub struct ProxyDiscoverer {
    dialer: Arc<dyn AnonymousDialer>,
    tls_connector: TlsConnector,
    timeout: Duration,
}

impl std::fmt::Debug for ProxyDiscoverer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyDiscoverer")
            .field("dialer", &self.dialer)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ProxyDiscoverer {
    /// The discovery certificate is checked against the web PKI plus
    /// `extra_roots`
    pub fn new(
        dialer: Arc<dyn AnonymousDialer>,
        extra_roots: &[CertificateDer<'static>],
    ) -> Result<Self, ProxySourceError> {
        let client_config = shroud_cert::client_config(extra_roots, &[b"http/1.1"])
            .map_err(|e| ProxySourceError::Tls(e.to_string()))?;

        Ok(Self {
            dialer,
            tls_connector: TlsConnector::from(Arc::new(client_config)),
            // Building a Tor circuit dominates this
            timeout: Duration::from_secs(120),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `discover_url` with `q=<domain>` set, replacing any existing `q`
    pub fn query_url(discover_url: &Url, domain: &str) -> Url {
        let mut url = discover_url.clone();
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != "q")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("q", domain);
        url
    }

    /// Ask the discovery service which proxies serve `domain`
    pub async fn discover(
        &self,
        discover_url: &Url,
        domain: &str,
    ) -> Result<Vec<ProxyEndpoint>, ProxySourceError> {
        let url = Self::query_url(discover_url, domain);
        debug!("Discovering proxies from {}", url);

        let (status, body) = tokio::time::timeout(self.timeout, self.fetch(&url))
            .await
            .map_err(|_| ProxySourceError::Timeout)??;

        if status != 200 {
            return Err(ProxySourceError::Status {
                status,
                body: body.trim().to_string(),
            });
        }

        let endpoints = ProxyEndpoint::parse_lines(&body)?;
        if endpoints.is_empty() {
            return Err(ProxySourceError::Empty(domain.to_string()));
        }
        Ok(endpoints)
    }

    async fn fetch(&self, url: &Url) -> Result<(u16, String), ProxySourceError> {
        let host = url
            .host_str()
            .ok_or_else(|| ProxySourceError::InvalidResponse("URL has no host".to_string()))?;
        let port = url.port_or_known_default().unwrap_or(443);

        let host_header = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let target = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        let stream = self
            .dialer
            .dial(host, port)
            .await
            .map_err(|source| ProxySourceError::Connect {
                host: host.to_string(),
                port,
                source,
            })?;

        if url.scheme() == "https" {
            // IPv6 hosts come bracketed out of the URL
            let name = host.trim_start_matches('[').trim_end_matches(']');
            let server_name = ServerName::try_from(name.to_string())
                .map_err(|e| ProxySourceError::Tls(format!("Invalid server name: {}", e)))?;
            let tls_stream = self
                .tls_connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ProxySourceError::Tls(e.to_string()))?;
            http_get(tls_stream, &host_header, &target).await
        } else {
            http_get(stream, &host_header, &target).await
        }
    }
}

/// Issue one `GET` for `target` on `stream` and return status code and body
async fn http_get<S>(stream: S, host: &str, target: &str) -> Result<(u16, String), ProxySourceError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;

    // Spawn connection driver
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Discovery connection closed: {}", e);
        }
    });

    let request = Request::builder()
        .method(Method::GET)
        .uri(target)
        .header(header::HOST, host)
        .header(header::ACCEPT, "text/plain")
        .header(header::CONNECTION, "close")
        .header(
            header::USER_AGENT,
            concat!("shroud/", env!("CARGO_PKG_VERSION")),
        )
        .body(Empty::<Bytes>::new())
        .map_err(|e| ProxySourceError::InvalidResponse(format!("Failed to build request: {}", e)))?;

    let response = sender.send_request(request).await?;
    let status = response.status().as_u16();

    let body = Limited::new(response.into_body(), MAX_RESPONSE_BODY)
        .collect()
        .await
        .map_err(|e| ProxySourceError::InvalidResponse(format!("Failed to read body: {}", e)))?
        .to_bytes();

    let body = String::from_utf8(body.to_vec())
        .map_err(|e| ProxySourceError::InvalidResponse(format!("body is not UTF-8: {}", e)))?;
    Ok((status, body))
}

impl ProxySource {
    /// Resolve the configured source into endpoints
    pub async fn endpoints(
        &self,
        domain: &str,
        discoverer: &ProxyDiscoverer,
    ) -> Result<Vec<ProxyEndpoint>, ProxySourceError> {
        match self {
            ProxySource::Explicit(endpoints) => {
                info!("Using explicit proxy addresses: {}", join(endpoints));
                Ok(endpoints.clone())
            }
            ProxySource::Discover(url) => {
                let endpoints = discoverer.discover(url, domain).await?;
                info!("Discovered public proxy servers at: {}", join(&endpoints));
                Ok(endpoints)
            }
        }
    }
}

fn join(endpoints: &[ProxyEndpoint]) -> String {
    endpoints
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Obtain the endpoints for `domain` from either an explicit comma separated
/// list or the discovery service, validating the options before any network
/// activity.
pub async fn get_endpoints(
    explicit_list: Option<&str>,
    domain: &str,
    discover_url: Option<&str>,
    dialer: Arc<dyn AnonymousDialer>,
) -> Result<Vec<ProxyEndpoint>, ProxySourceError> {
    let source = ProxySource::from_options(explicit_list, discover_url)?;
    let discoverer = ProxyDiscoverer::new(dialer, &[])?;
    source.endpoints(domain, &discoverer).await
}
