//! Discovery service configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--tls-crt and --tls-key are required unless --plaintext is set")]
    MissingTls,

    #[error("--tls-crt and --tls-key must be given together")]
    PartialTls,

    #[error("--plaintext cannot be combined with --tls-crt/--tls-key")]
    ConflictingTls,

    #[error("Proxy domain must not be empty")]
    EmptyProxyDomain,
}

/// How the HTTP endpoint is exposed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenMode {
    Tls { cert_path: PathBuf, key_path: PathBuf },
    /// For running behind a TLS-terminating load balancer, or in tests
    Plaintext,
}

#[derive(Debug, Clone)]
pub struct DiscoverConfig {
    pub listen_addr: SocketAddr,
    pub mode: ListenMode,
    /// Base domain of the proxy fleet
    pub proxy_domain: String,
    /// Nameserver to query instead of the system configuration
    pub nameserver: Option<SocketAddr>,
}

impl DiscoverConfig {
    pub fn new(
        listen_addr: SocketAddr,
        tls_crt: Option<PathBuf>,
        tls_key: Option<PathBuf>,
        plaintext: bool,
        proxy_domain: impl Into<String>,
        nameserver: Option<SocketAddr>,
    ) -> Result<Self, ConfigError> {
        let mode = match (tls_crt, tls_key, plaintext) {
            (None, None, true) => ListenMode::Plaintext,
            (Some(_), _, true) | (_, Some(_), true) => return Err(ConfigError::ConflictingTls),
            (Some(cert_path), Some(key_path), false) => ListenMode::Tls {
                cert_path,
                key_path,
            },
            (None, None, false) => return Err(ConfigError::MissingTls),
            _ => return Err(ConfigError::PartialTls),
        };

        let proxy_domain = proxy_domain.into();
        let proxy_domain = proxy_domain.trim_end_matches('.');
        if proxy_domain.is_empty() {
            return Err(ConfigError::EmptyProxyDomain);
        }

        Ok(Self {
            listen_addr,
            mode,
            proxy_domain: proxy_domain.to_string(),
            nameserver,
        })
    }
}
