//! Certificate handling for every shroud role
//!
//! Loads PEM certificates and keys into rustls configurations, builds client
//! configurations trusting the public web PKI plus any extra roots, and
//! generates self-signed certificates for development and tests.

pub mod self_signed;

pub use self_signed::{generate_self_signed_cert, SelfSignedCertificate, SelfSignedError};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse certificates in {path}: {source}")]
    ParseCerts {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse private key in {path}: {source}")]
    ParseKey {
        path: String,
        source: std::io::Error,
    },

    #[error("No certificates found in {0}")]
    NoCertificates(String),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error("Invalid root certificate: {0}")]
    InvalidRoot(String),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install ring as the process-wide rustls crypto provider.
///
/// Safe to call any number of times; every config builder here calls it.
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

/// Load every certificate of a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let display = path.display().to_string();
    let file = File::open(path).map_err(|source| CertError::Open {
        path: display.clone(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertError::ParseCerts {
            path: display.clone(),
            source,
        })?;

    if certs.is_empty() {
        return Err(CertError::NoCertificates(display));
    }
    Ok(certs)
}

/// Load the first private key of a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let display = path.display().to_string();
    let file = File::open(path).map_err(|source| CertError::Open {
        path: display.clone(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| CertError::ParseKey {
            path: display.clone(),
            source,
        })?
        .ok_or(CertError::NoPrivateKey(display))
}

/// Server configuration from PEM certificate and key files
pub fn server_config_from_files(
    cert_path: &Path,
    key_path: &Path,
    alpn: &[&[u8]],
) -> Result<rustls::ServerConfig, CertError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    server_config(certs, key, alpn)
}

/// Server configuration from DER certificate chain and key
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn: &[&[u8]],
) -> Result<rustls::ServerConfig, CertError> {
    ensure_crypto_provider();

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Client configuration trusting the web PKI roots plus `extra_roots`.
///
/// The server name is chosen per connection, which is what pins a tunnel to
/// the proxy it dialed.
pub fn client_config(
    extra_roots: &[CertificateDer<'static>],
    alpn: &[&[u8]],
) -> Result<rustls::ClientConfig, CertError> {
    ensure_crypto_provider();

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for cert in extra_roots {
        roots
            .add(cert.clone())
            .map_err(|e| CertError::InvalidRoot(e.to_string()))?;
    }

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}
