//! Domain delegation check and proxy endpoint resolution
//!
//! A domain `D` opts into the proxy fleet by publishing a CNAME
//! `D -> D.<proxy domain>`. Proxy endpoints are published as SRV records at
//! `_shroud._tls.D.<proxy domain>`, with the fleet-wide set at
//! `_shroud._tls.<proxy domain>` as fallback.

use crate::dns::{DnsError, DnsLookup, SrvRecord};
use shroud_proto::{
    domain_routing_name, expected_alias_target, fleet_routing_name, un_fqdn, ProxyEndpoint,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Outcome of the delegation check
#[derive(Debug)]
pub enum Verification {
    /// The domain points at the fleet
    Valid,
    /// The domain is not delegated; the reason tells the operator how to fix it
    Invalid(String),
    /// DNS could not answer
    LookupFailed(DnsError),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Operator configuration error, reported verbatim
    #[error("{0}")]
    Invalid(String),

    #[error("Error while validating CNAME for '{domain}': {source}")]
    LookupFailed {
        domain: String,
        #[source]
        source: DnsError,
    },

    #[error("Error while getting proxy servers for '{domain}': {source}")]
    EndpointLookupFailed {
        domain: String,
        #[source]
        source: DnsError,
    },

    /// Neither the per-domain nor the fleet-wide records exist
    #[error("Error while getting proxy servers for '{domain}': No shroud SRV records found for '{name}'")]
    NoEndpoints { domain: String, name: String },
}

impl ResolveError {
    /// Whether the caller, not the fleet or DNS, is at fault
    pub fn is_invalid(&self) -> bool {
        matches!(self, ResolveError::Invalid(_))
    }
}

/// Resolves the proxy endpoints a domain should connect to
#[derive(Debug, Clone)]
pub struct Resolver {
    proxy_domain: String,
    lookup: Arc<dyn DnsLookup>,
}

impl Resolver {
    pub fn new(proxy_domain: impl Into<String>, lookup: Arc<dyn DnsLookup>) -> Self {
        Self {
            proxy_domain: proxy_domain.into(),
            lookup,
        }
    }

    pub fn proxy_domain(&self) -> &str {
        &self.proxy_domain
    }

    /// Check that `domain` has a CNAME pointing at `domain.<proxy domain>`
    pub async fn verify_delegation(&self, domain: &str) -> Verification {
        let expected = expected_alias_target(domain, &self.proxy_domain);

        let target = match self.lookup.lookup_cname(domain).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                return Verification::Invalid(format!(
                    "No CNAME record for {}, create one which targets {}",
                    domain, expected
                ))
            }
            Err(e) => return Verification::LookupFailed(e),
        };

        let target = un_fqdn(&target);
        if target != expected {
            return Verification::Invalid(format!(
                "CNAME record points to wrong target '{}', should point to '{}'",
                target, expected
            ));
        }

        Verification::Valid
    }

    /// Endpoints published for `domain`, falling back to the fleet-wide set
    /// when the domain has none of its own.
    ///
    /// Does not check delegation; SRV priority and weight are ignored.
    pub async fn find_endpoints(&self, domain: &str) -> Result<Vec<ProxyEndpoint>, ResolveError> {
        let lookup_failed = |source| ResolveError::EndpointLookupFailed {
            domain: domain.to_string(),
            source,
        };

        let name = domain_routing_name(domain, &self.proxy_domain);
        let records = self.lookup.lookup_srv(&name).await.map_err(lookup_failed)?;
        let endpoints = usable_endpoints(&records);
        if !endpoints.is_empty() {
            return Ok(endpoints);
        }

        let fleet = fleet_routing_name(&self.proxy_domain);
        debug!("No SRV records at {}, falling back to {}", name, fleet);

        let records = self.lookup.lookup_srv(&fleet).await.map_err(lookup_failed)?;
        let endpoints = usable_endpoints(&records);
        if endpoints.is_empty() {
            return Err(ResolveError::NoEndpoints {
                domain: domain.to_string(),
                name: fleet,
            });
        }
        Ok(endpoints)
    }

    /// Verify delegation, then find endpoints
    pub async fn resolve(&self, domain: &str) -> Result<Vec<ProxyEndpoint>, ResolveError> {
        match self.verify_delegation(domain).await {
            Verification::Valid => {}
            Verification::Invalid(reason) => return Err(ResolveError::Invalid(reason)),
            Verification::LookupFailed(source) => {
                return Err(ResolveError::LookupFailed {
                    domain: domain.to_string(),
                    source,
                })
            }
        }

        let endpoints = self.find_endpoints(domain).await?;
        info!(domain = %domain, count = endpoints.len(), "Resolved proxy endpoints");
        Ok(endpoints)
    }
}

/// SRV targets as endpoints. A target of "." means "no service here" and is
/// skipped.
fn usable_endpoints(records: &[SrvRecord]) -> Vec<ProxyEndpoint> {
    records
        .iter()
        .map(|srv| (un_fqdn(&srv.target), srv.port))
        .filter(|(host, _)| !host.is_empty())
        .map(|(host, port)| ProxyEndpoint::new(host, port))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory DNS with a query log
    #[derive(Debug, Default)]
    struct StaticDns {
        cnames: HashMap<String, String>,
        srv: HashMap<String, Vec<SrvRecord>>,
        fail_cname: bool,
        fail_srv: bool,
        queries: Mutex<Vec<String>>,
    }

    impl StaticDns {
        fn cname(mut self, name: &str, target: &str) -> Self {
            self.cnames.insert(name.to_string(), target.to_string());
            self
        }

        fn srv(mut self, name: &str, records: &[(&str, u16)]) -> Self {
            self.srv.insert(
                name.to_string(),
                records.iter().map(|(t, p)| SrvRecord::new(*t, *p)).collect(),
            );
            self
        }

        fn queries(&self) -> Vec<String> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DnsLookup for StaticDns {
        async fn lookup_cname(&self, name: &str) -> Result<Option<String>, DnsError> {
            self.queries.lock().unwrap().push(format!("CNAME {}", name));
            if self.fail_cname {
                return Err(DnsError::Query {
                    name: name.to_string(),
                    reason: "connection timed out".to_string(),
                });
            }
            Ok(self.cnames.get(name).cloned())
        }

        async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, DnsError> {
            self.queries.lock().unwrap().push(format!("SRV {}", name));
            if self.fail_srv {
                return Err(DnsError::Query {
                    name: name.to_string(),
                    reason: "server failure".to_string(),
                });
            }
            Ok(self.srv.get(name).cloned().unwrap_or_default())
        }
    }

    const PROXY: &str = "proxy.v1.shroud.io";

    fn resolver(dns: StaticDns) -> (Resolver, Arc<StaticDns>) {
        let dns = Arc::new(dns);
        (Resolver::new(PROXY, dns.clone()), dns)
    }

    fn hosts(endpoints: &[ProxyEndpoint]) -> Vec<String> {
        let mut hosts: Vec<String> = endpoints.iter().map(|e| e.to_string()).collect();
        hosts.sort();
        hosts
    }

    #[tokio::test]
    async fn test_missing_cname_is_invalid() {
        let (resolver, _) = resolver(StaticDns::default());

        match resolver.verify_delegation("x.example").await {
            Verification::Invalid(reason) => {
                assert_eq!(
                    reason,
                    "No CNAME record for x.example, create one which targets x.example.proxy.v1.shroud.io"
                );
            }
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_cname_target_is_invalid() {
        let (resolver, _) = resolver(StaticDns::default().cname("x.example", "elsewhere.example."));

        let err = resolver.resolve("x.example").await.unwrap_err();
        assert!(err.is_invalid());
        assert_eq!(
            err.to_string(),
            "CNAME record points to wrong target 'elsewhere.example', should point to 'x.example.proxy.v1.shroud.io'"
        );
    }

    #[tokio::test]
    async fn test_target_comparison_is_exact() {
        // Only one trailing dot is stripped, and case is significant
        let (resolver, _) = resolver(
            StaticDns::default().cname("x.example", "X.example.proxy.v1.shroud.io."),
        );
        assert!(matches!(
            resolver.verify_delegation("x.example").await,
            Verification::Invalid(_)
        ));

        let (resolver, _) = resolver_with_cname("x.example.proxy.v1.shroud.io");
        assert!(matches!(
            resolver.verify_delegation("x.example").await,
            Verification::Valid
        ));
    }

    fn resolver_with_cname(target: &str) -> (Resolver, Arc<StaticDns>) {
        resolver(StaticDns::default().cname("x.example", target))
    }

    #[tokio::test]
    async fn test_cname_lookup_failure() {
        let (resolver, _) = resolver(StaticDns {
            fail_cname: true,
            ..Default::default()
        });

        let err = resolver.resolve("x.example").await.unwrap_err();
        assert!(!err.is_invalid());
        assert!(err
            .to_string()
            .starts_with("Error while validating CNAME for 'x.example': "));
    }

    #[tokio::test]
    async fn test_per_domain_records() {
        let (resolver, dns) = resolver(
            StaticDns::default()
                .cname("x.example", "x.example.proxy.v1.shroud.io.")
                .srv(
                    "_shroud._tls.x.example.proxy.v1.shroud.io",
                    &[("p1.proxy.", 4443), ("p2.proxy.", 4443)],
                )
                .srv("_shroud._tls.proxy.v1.shroud.io", &[("fleet.proxy.", 4443)]),
        );

        let endpoints = resolver.resolve("x.example").await.unwrap();
        assert_eq!(hosts(&endpoints), vec!["p1.proxy:4443", "p2.proxy:4443"]);

        // No fallback query when the domain has its own records
        assert_eq!(
            dns.queries(),
            vec![
                "CNAME x.example",
                "SRV _shroud._tls.x.example.proxy.v1.shroud.io"
            ]
        );
    }

    #[tokio::test]
    async fn test_fleet_fallback() {
        let (resolver, dns) = resolver(
            StaticDns::default()
                .cname("x.example", "x.example.proxy.v1.shroud.io.")
                .srv("_shroud._tls.proxy.v1.shroud.io", &[("fleet.proxy.", 443)]),
        );

        let endpoints = resolver.resolve("x.example").await.unwrap();
        assert_eq!(hosts(&endpoints), vec!["fleet.proxy:443"]);
        assert_eq!(dns.queries().len(), 3);
    }

    #[tokio::test]
    async fn test_root_target_means_no_service() {
        let (resolver, _) = resolver(
            StaticDns::default()
                .cname("x.example", "x.example.proxy.v1.shroud.io.")
                .srv(
                    "_shroud._tls.x.example.proxy.v1.shroud.io",
                    &[(".", 0), ("p1.proxy.", 4443)],
                ),
        );
        let endpoints = resolver.resolve("x.example").await.unwrap();
        assert_eq!(hosts(&endpoints), vec!["p1.proxy:4443"]);

        // Only "." at the domain name falls back to the fleet
        let (resolver, _) = self::resolver(
            StaticDns::default()
                .cname("x.example", "x.example.proxy.v1.shroud.io.")
                .srv("_shroud._tls.x.example.proxy.v1.shroud.io", &[(".", 0)])
                .srv("_shroud._tls.proxy.v1.shroud.io", &[("fleet.proxy.", 4443)]),
        );
        let endpoints = resolver.resolve("x.example").await.unwrap();
        assert_eq!(hosts(&endpoints), vec!["fleet.proxy:4443"]);

        // And "." at the fleet name too is an operational error
        let (resolver, _) = self::resolver(
            StaticDns::default()
                .cname("x.example", "x.example.proxy.v1.shroud.io.")
                .srv("_shroud._tls.proxy.v1.shroud.io", &[(".", 0)]),
        );
        let err = resolver.resolve("x.example").await.unwrap_err();
        assert!(matches!(err, ResolveError::NoEndpoints { .. }));
    }

    #[tokio::test]
    async fn test_no_records_anywhere_is_operational_error() {
        let (resolver, dns) =
            resolver(StaticDns::default().cname("x.example", "x.example.proxy.v1.shroud.io."));

        let err = resolver.resolve("x.example").await.unwrap_err();
        assert!(!err.is_invalid());
        assert_eq!(
            err.to_string(),
            "Error while getting proxy servers for 'x.example': No shroud SRV records found for '_shroud._tls.proxy.v1.shroud.io'"
        );
        assert_eq!(dns.queries().len(), 3);
    }

    #[tokio::test]
    async fn test_srv_lookup_failure_does_not_fall_back() {
        let (resolver, dns) = resolver(StaticDns {
            fail_srv: true,
            ..StaticDns::default().cname("x.example", "x.example.proxy.v1.shroud.io.")
        });

        let err = resolver.resolve("x.example").await.unwrap_err();
        assert!(matches!(err, ResolveError::EndpointLookupFailed { .. }));
        assert_eq!(dns.queries().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_skips_endpoint_lookup() {
        let (resolver, dns) = resolver(StaticDns::default());
        let _ = resolver.resolve("x.example").await;
        assert_eq!(dns.queries(), vec!["CNAME x.example"]);
    }
}
