//! Shroud client core
//!
//! Exposes one private service through every proxy endpoint that serves its
//! domain:
//!
//! 1. [`ProxySource`] yields the endpoints, from the command line or from the
//!    discovery service.
//! 2. [`TunnelOrchestrator`] keeps one tunnel per endpoint.
//! 3. [`RelayEngine`] splices every public stream to the private service,
//!    terminating TLS first when configured.

pub mod config;
pub mod orchestrator;
pub mod proxy_source;
pub mod relay;

pub use config::{ClientConfig, ConfigError, ProxySource, ServiceConfig, TlsFiles};
pub use orchestrator::{
    EndpointError, EndpointOutcome, EndpointState, RelayGate, TunnelOrchestrator,
};
pub use proxy_source::{get_endpoints, ProxyDiscoverer, ProxySourceError};
pub use relay::{relay, RelayEngine, RelayError};
