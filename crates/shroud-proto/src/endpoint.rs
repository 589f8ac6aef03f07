//! Proxy endpoint addresses

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("'{0}' is missing a port")]
    MissingPort(String),

    #[error("'{0}' is missing a host")]
    MissingHost(String),

    #[error("'{input}' has an invalid port: {reason}")]
    InvalidPort { input: String, reason: String },

    #[error("'{0}' has an unterminated IPv6 literal")]
    UnterminatedIpv6(String),
}

/// One proxy node, identified by host and port.
///
/// The host is kept as given (DNS name or IP literal) because it doubles as
/// the TLS server name the tunnel is pinned to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Name the proxy's TLS certificate must be valid for
    pub fn tls_name(&self) -> &str {
        &self.host
    }

    /// Parse a comma separated list such as `"p1.proxy:4443,p2.proxy:4443"`.
    ///
    /// Surrounding whitespace and empty items are ignored.
    pub fn parse_list(list: &str) -> Result<Vec<Self>, EndpointError> {
        list.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::parse)
            .collect()
    }

    /// Parse a newline delimited list, the body format of the discovery service.
    pub fn parse_lines(body: &str) -> Result<Vec<Self>, EndpointError> {
        body.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::parse)
            .collect()
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals (`[::1]:4443`).
pub(crate) fn split_host_port(input: &str) -> Result<(&str, &str), EndpointError> {
    if let Some(rest) = input.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| EndpointError::UnterminatedIpv6(input.to_string()))?;
        let host = &rest[..end];
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| EndpointError::MissingPort(input.to_string()))?;
        return Ok((host, port));
    }

    let (host, port) = input
        .rsplit_once(':')
        .ok_or_else(|| EndpointError::MissingPort(input.to_string()))?;

    // An unbracketed host must not contain another colon
    if host.contains(':') {
        return Err(EndpointError::UnterminatedIpv6(input.to_string()));
    }

    Ok((host, port))
}

pub(crate) fn parse_port(input: &str, port: &str) -> Result<u16, EndpointError> {
    port.parse::<u16>()
        .map_err(|e| EndpointError::InvalidPort {
            input: input.to_string(),
            reason: e.to_string(),
        })
}

impl FromStr for ProxyEndpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = split_host_port(s)?;
        if host.is_empty() {
            return Err(EndpointError::MissingHost(s.to_string()));
        }
        let port = parse_port(s, port)?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        let ep: ProxyEndpoint = "p1.proxy:4443".parse().unwrap();
        assert_eq!(ep, ProxyEndpoint::new("p1.proxy", 4443));
        assert_eq!(ep.tls_name(), "p1.proxy");
        assert_eq!(ep.to_string(), "p1.proxy:4443");
    }

    #[test]
    fn test_parse_ipv6_endpoint() {
        let ep: ProxyEndpoint = "[::1]:4443".parse().unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.to_string(), "[::1]:4443");
    }

    #[test]
    fn test_parse_endpoint_errors() {
        assert!(matches!(
            "p1.proxy".parse::<ProxyEndpoint>(),
            Err(EndpointError::MissingPort(_))
        ));
        assert!(matches!(
            ":4443".parse::<ProxyEndpoint>(),
            Err(EndpointError::MissingHost(_))
        ));
        assert!(matches!(
            "p1.proxy:https".parse::<ProxyEndpoint>(),
            Err(EndpointError::InvalidPort { .. })
        ));
    }

    #[test]
    fn test_parse_list() {
        let eps = ProxyEndpoint::parse_list("p1.proxy:4443, p2.proxy:4443,").unwrap();
        assert_eq!(
            eps,
            vec![
                ProxyEndpoint::new("p1.proxy", 4443),
                ProxyEndpoint::new("p2.proxy", 4443)
            ]
        );
    }

    #[test]
    fn test_parse_lines_skips_blank() {
        let eps = ProxyEndpoint::parse_lines("p1.proxy:4443\n\np2.proxy:5000\n").unwrap();
        assert_eq!(eps.len(), 2);
        assert_eq!(eps[1].port, 5000);
    }
}
