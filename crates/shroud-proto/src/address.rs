//! Normalization of the local service address given on the command line

use crate::endpoint::{parse_port, split_host_port, EndpointError};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{input}' is not a valid address or local port: {source}")]
pub struct AddressError {
    pub input: String,
    #[source]
    pub source: EndpointError,
}

/// Turn a port or `host:port` into a dialable `host:port`.
///
/// - `"5050"` becomes `"127.0.0.1:5050"`
/// - `":5050"` becomes `"127.0.0.1:5050"`
/// - `"0.0.0.0:5050"` and `"localhost:5050"` are returned unchanged
pub fn normalize_address(addr: &str) -> Result<String, AddressError> {
    let addr = addr.trim();
    let candidate = if !addr.is_empty() && addr.bytes().all(|b| b.is_ascii_digit()) {
        format!(":{}", addr)
    } else {
        addr.to_string()
    };

    let to_error = |source| AddressError {
        input: addr.to_string(),
        source,
    };

    let (host, port) = split_host_port(&candidate).map_err(to_error)?;
    let port = parse_port(&candidate, port).map_err(to_error)?;

    let host = if host.is_empty() { "127.0.0.1" } else { host };
    if host.contains(':') {
        Ok(format!("[{}]:{}", host, port))
    } else {
        Ok(format!("{}:{}", host, port))
    }
}
