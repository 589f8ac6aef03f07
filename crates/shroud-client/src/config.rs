//! Client configuration
//!
//! Everything here is validated before any network activity; a
//! [`ConfigError`] is always fatal.

use shroud_cert::CertError;
use shroud_proto::{normalize_address, normalize_hostname, AddressError, EndpointError, ProxyEndpoint};
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid domain '{0}'")]
    InvalidDomain(String),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("--tls-crt and --tls-key must be given together")]
    PartialTls,

    #[error("You must specify --discover-url or --proxy-addrs")]
    NoProxySource,

    #[error("Invalid proxy address list: {0}")]
    ProxyList(#[from] EndpointError),

    #[error("Proxy address list is empty")]
    EmptyProxyList,

    #[error("Invalid discover URL '{url}': {reason}")]
    DiscoverUrl { url: String, reason: String },

    #[error(transparent)]
    Cert(#[from] CertError),
}

/// PEM files used to terminate inbound TLS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// The one service this client exposes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Public domain, lowercase, without trailing dot
    pub domain: String,
    /// Normalized `host:port` of the private service
    pub local_addr: String,
    /// Terminate TLS before forwarding when set
    pub tls: Option<TlsFiles>,
}

impl ServiceConfig {
    pub fn new(
        domain: &str,
        local_addr: &str,
        tls_crt: Option<PathBuf>,
        tls_key: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let domain = normalize_domain(domain)?;
        let local_addr = normalize_address(local_addr)?;

        let tls = match (tls_crt, tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsFiles {
                cert_path,
                key_path,
            }),
            (None, None) => None,
            _ => return Err(ConfigError::PartialTls),
        };

        Ok(Self {
            domain,
            local_addr,
            tls,
        })
    }
}

fn normalize_domain(domain: &str) -> Result<String, ConfigError> {
    normalize_hostname(domain).ok_or_else(|| ConfigError::InvalidDomain(domain.to_string()))
}

/// Where the proxy endpoints come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySource {
    /// Endpoints given on the command line
    Explicit(Vec<ProxyEndpoint>),
    /// Ask the discovery service
    Discover(Url),
}

impl ProxySource {
    /// Pick the source from the two mutually exclusive options.
    ///
    /// Empty strings count as unset. When both are set the explicit list wins.
    pub fn from_options(
        proxy_addrs: Option<&str>,
        discover_url: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let proxy_addrs = proxy_addrs.filter(|s| !s.trim().is_empty());
        let discover_url = discover_url.filter(|s| !s.trim().is_empty());

        match (proxy_addrs, discover_url) {
            (Some(list), discover) => {
                if discover.is_some() {
                    warn!("Ignoring --discover-url in favor of --proxy-addrs");
                }
                let endpoints = ProxyEndpoint::parse_list(list)?;
                if endpoints.is_empty() {
                    return Err(ConfigError::EmptyProxyList);
                }
                Ok(ProxySource::Explicit(endpoints))
            }
            (None, Some(url)) => Ok(ProxySource::Discover(parse_discover_url(url)?)),
            (None, None) => Err(ConfigError::NoProxySource),
        }
    }
}

fn parse_discover_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: &str| ConfigError::DiscoverUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(invalid("scheme must be https or http"));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(url)
}

/// Full client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub service: ServiceConfig,
    pub proxy_source: ProxySource,
    /// SOCKS5 address of the running Tor client
    pub tor_addr: String,
    /// SOCKS5 username/password, used by Tor for circuit isolation
    pub tor_credentials: Option<(String, String)>,
    /// Extra CA trusted for proxy and discovery certificates
    pub tunnel_ca: Option<PathBuf>,
    /// Upper bound on concurrent relays per endpoint, 0 = unbounded
    pub max_relays: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_config_normalizes() {
        let service = ServiceConfig::new("X.Example.", "5050", None, None).unwrap();
        assert_eq!(service.domain, "x.example");
        assert_eq!(service.local_addr, "127.0.0.1:5050");
        assert!(service.tls.is_none());
    }

    #[test]
    fn test_service_config_rejects_bad_address() {
        let err = ServiceConfig::new("x.example", "not-an-address", None, None).unwrap_err();
        assert!(matches!(err, ConfigError::Address(_)));
    }

    #[test]
    fn test_service_config_rejects_bad_domain() {
        for domain in ["", ".", "x..example", "x.example:443", "x example"] {
            assert!(
                matches!(
                    ServiceConfig::new(domain, "5050", None, None),
                    Err(ConfigError::InvalidDomain(_))
                ),
                "{domain:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_tls_files_come_in_pairs() {
        let err = ServiceConfig::new("x.example", "5050", Some("x.crt".into()), None).unwrap_err();
        assert!(matches!(err, ConfigError::PartialTls));

        let service = ServiceConfig::new(
            "x.example",
            "5050",
            Some("x.crt".into()),
            Some("x.key".into()),
        )
        .unwrap();
        assert!(service.tls.is_some());
    }

    #[test]
    fn test_proxy_source_requires_one_option() {
        assert!(matches!(
            ProxySource::from_options(None, None),
            Err(ConfigError::NoProxySource)
        ));
        assert!(matches!(
            ProxySource::from_options(Some(""), Some(" ")),
            Err(ConfigError::NoProxySource)
        ));
    }

    #[test]
    fn test_explicit_list_wins() {
        let source = ProxySource::from_options(
            Some("p1.proxy:4443,p2.proxy:4443"),
            Some("https://discover.v1.shroud.io/proxies"),
        )
        .unwrap();

        assert_eq!(
            source,
            ProxySource::Explicit(vec![
                ProxyEndpoint::new("p1.proxy", 4443),
                ProxyEndpoint::new("p2.proxy", 4443),
            ])
        );
    }

    #[test]
    fn test_explicit_list_is_validated() {
        let err = ProxySource::from_options(Some("p1.proxy"), None).unwrap_err();
        assert!(matches!(err, ConfigError::ProxyList(_)));
    }

    #[test]
    fn test_discover_url_is_validated() {
        let source =
            ProxySource::from_options(None, Some("https://discover.v1.shroud.io/proxies")).unwrap();
        assert!(matches!(source, ProxySource::Discover(_)));

        let err = ProxySource::from_options(None, Some("ftp://discover.example/")).unwrap_err();
        assert!(matches!(err, ConfigError::DiscoverUrl { .. }));

        let err = ProxySource::from_options(None, Some("not a url")).unwrap_err();
        assert!(matches!(err, ConfigError::DiscoverUrl { .. }));
    }
}
