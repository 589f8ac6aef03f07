//! DNS lookups used by the resolver
//!
//! The resolver only needs two record types, so lookups sit behind the
//! small [`DnsLookup`] trait. [`HickoryLookup`] is the production
//! implementation; tests use in-memory tables.

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("DNS query for {name} failed: {reason}")]
    Query { name: String, reason: String },

    #[error("CNAME record is not the right type: {0}")]
    UnexpectedRecord(String),

    #[error("Failed to load DNS configuration: {0}")]
    Config(String),
}

/// One SRV answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    /// Target as published, usually fully qualified with a trailing dot
    pub target: String,
}

impl SrvRecord {
    pub fn new(target: impl Into<String>, port: u16) -> Self {
        Self {
            priority: 0,
            weight: 0,
            port,
            target: target.into(),
        }
    }
}

#[async_trait]
pub trait DnsLookup: Send + Sync + std::fmt::Debug {
    /// Target of the first answer to a CNAME query, or `None` when there is
    /// no answer at all. A first answer of another type is an error.
    async fn lookup_cname(&self, name: &str) -> Result<Option<String>, DnsError>;

    /// All SRV answers for `name`; an empty list when there are none
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, DnsError>;
}

/// Lookups through hickory with caching disabled, so every query reaches
/// the nameserver and record changes take effect immediately.
pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
    description: String,
}

impl std::fmt::Debug for HickoryLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HickoryLookup")
            .field("nameservers", &self.description)
            .finish()
    }
}

impl HickoryLookup {
    /// Use the nameservers of the system configuration (`/etc/resolv.conf`)
    pub fn from_system_conf() -> Result<Self, DnsError> {
        let (config, opts) = hickory_resolver::system_conf::read_system_conf()
            .map_err(|e| DnsError::Config(e.to_string()))?;
        Ok(Self::with_config(config, opts, "system".to_string()))
    }

    /// Send every query to one nameserver over UDP (TCP for truncated replies)
    pub fn with_nameserver(addr: SocketAddr) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        Self::with_config(config, ResolverOpts::default(), addr.to_string())
    }

    fn with_config(config: ResolverConfig, mut opts: ResolverOpts, description: String) -> Self {
        opts.cache_size = 0;
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            description,
        }
    }
}

/// Absolute form of `name`, so search domains never apply
fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn lookup_cname(&self, name: &str) -> Result<Option<String>, DnsError> {
        let query = fqdn(name);
        debug!("CNAME query for {}", query);

        match self.resolver.lookup(query.as_str(), RecordType::CNAME).await {
            Ok(lookup) => {
                // Only the first answer counts; a name carries at most one CNAME
                let Some(record) = lookup.record_iter().next() else {
                    return Ok(None);
                };
                match record.data() {
                    Some(RData::CNAME(cname)) => Ok(Some(cname.0.to_utf8())),
                    Some(other) => Err(DnsError::UnexpectedRecord(other.to_string())),
                    None => Err(DnsError::UnexpectedRecord(format!(
                        "empty {} record",
                        record.record_type()
                    ))),
                }
            }
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(None),
                _ => Err(DnsError::Query {
                    name: query,
                    reason: e.to_string(),
                }),
            },
        }
    }

    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, DnsError> {
        let query = fqdn(name);
        debug!("SRV query for {}", query);

        match self.resolver.srv_lookup(query.as_str()).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|srv| SrvRecord {
                    priority: srv.priority(),
                    weight: srv.weight(),
                    port: srv.port(),
                    target: srv.target().to_utf8(),
                })
                .collect()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(DnsError::Query {
                    name: query,
                    reason: e.to_string(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fqdn() {
        assert_eq!(fqdn("x.example"), "x.example.");
        assert_eq!(fqdn("x.example."), "x.example.");
    }

    #[tokio::test]
    async fn test_with_nameserver_debug() {
        let lookup = HickoryLookup::with_nameserver("127.0.0.1:5353".parse().unwrap());
        assert!(format!("{:?}", lookup).contains("127.0.0.1:5353"));
    }
}
