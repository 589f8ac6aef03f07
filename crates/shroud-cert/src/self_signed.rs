//! Self-signed certificate generation for development and testing

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SelfSignedError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),
}

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    /// Certificate in DER format (binary)
    pub cert_der: CertificateDer<'static>,

    /// Private key in DER format (binary)
    pub key_der: PrivateKeyDer<'static>,

    /// Certificate in PEM format (text)
    pub pem_cert: String,

    /// Private key in PEM format (text)
    pub pem_key: String,
}

impl SelfSignedCertificate {
    /// Save certificate and key to PEM files
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.pem_cert)?;
        std::fs::write(key_path, &self.pem_key)?;
        Ok(())
    }
}

/// Generate a certificate valid for `domains`.
///
/// **DO NOT use in production.** Proxies and the discovery service need
/// certificates from a public CA so anonymous clients can verify them.
pub fn generate_self_signed_cert(domains: &[&str]) -> Result<SelfSignedCertificate, SelfSignedError> {
    let names: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
    let mut params = CertificateParams::new(names)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        domains.first().copied().unwrap_or("shroud"),
    );
    dn.push(DnType::OrganizationName, "Shroud Dev");
    params.distinguished_name = dn;

    let key_pair =
        KeyPair::generate().map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?;

    Ok(SelfSignedCertificate {
        cert_der: cert.der().clone(),
        key_der,
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}
