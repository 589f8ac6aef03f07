//! Shroud discovery service
//!
//! Tells a client which proxies to use for its domain, after checking that
//! the domain really delegated itself to the proxy fleet.

pub mod config;
pub mod dns;
pub mod resolver;
pub mod server;

pub use config::{ConfigError, DiscoverConfig, ListenMode};
pub use dns::{DnsError, DnsLookup, HickoryLookup, SrvRecord};
pub use resolver::{ResolveError, Resolver, Verification};
pub use server::{router, DiscoverServer};
