//! DNS names used to delegate a domain to the proxy fleet
//!
//! A domain `x.com` served through the fleet at `proxy.shroud.io` must carry
//! a CNAME to `x.com.proxy.shroud.io`. Proxies for it are published as SRV
//! records at `_shroud._tls.x.com.proxy.shroud.io`, falling back to the
//! fleet-wide `_shroud._tls.proxy.shroud.io`.

/// Service and protocol labels of the SRV records
pub const SRV_SERVICE_PREFIX: &str = "_shroud._tls";

/// The CNAME target `domain` must point to
pub fn expected_alias_target(domain: &str, proxy_domain: &str) -> String {
    format!("{}.{}", domain, proxy_domain)
}

/// SRV name carrying the proxies dedicated to `domain`
pub fn domain_routing_name(domain: &str, proxy_domain: &str) -> String {
    format!("{}.{}.{}", SRV_SERVICE_PREFIX, domain, proxy_domain)
}

/// SRV name carrying the fleet-wide proxies
pub fn fleet_routing_name(proxy_domain: &str) -> String {
    format!("{}.{}", SRV_SERVICE_PREFIX, proxy_domain)
}

/// Chop off the trailing period of a fully qualified name
pub fn un_fqdn(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_names() {
        assert_eq!(
            expected_alias_target("x.example", "proxy.v1.shroud.io"),
            "x.example.proxy.v1.shroud.io"
        );
        assert_eq!(
            domain_routing_name("x.example", "proxy.v1.shroud.io"),
            "_shroud._tls.x.example.proxy.v1.shroud.io"
        );
        assert_eq!(
            fleet_routing_name("proxy.v1.shroud.io"),
            "_shroud._tls.proxy.v1.shroud.io"
        );
    }

    #[test]
    fn test_un_fqdn() {
        assert_eq!(un_fqdn("p1.proxy."), "p1.proxy");
        assert_eq!(un_fqdn("p1.proxy"), "p1.proxy");
        assert_eq!(un_fqdn("p1.proxy.."), "p1.proxy.");
    }
}
