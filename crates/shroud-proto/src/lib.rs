//! Shroud protocol definitions
//!
//! Shared types for every shroud role: proxy endpoints, local address
//! normalization, the DNS routing names published by the proxy fleet, and the
//! handshake messages exchanged when a client registers a hostname with a
//! proxy.

pub mod address;
pub mod codec;
pub mod endpoint;
pub mod hostname;
pub mod messages;
pub mod routing;

pub use address::{normalize_address, AddressError};
pub use codec::{CodecError, TunnelCodec};
pub use endpoint::{EndpointError, ProxyEndpoint};
pub use hostname::normalize_hostname;
pub use messages::TunnelMessage;
pub use routing::{
    domain_routing_name, expected_alias_target, fleet_routing_name, un_fqdn, SRV_SERVICE_PREFIX,
};

/// Protocol version sent in the listen handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Base domain of the public proxy fleet
pub const DEFAULT_PROXY_DOMAIN: &str = "proxy.v1.shroud.io";

/// Discovery endpoint queried by clients that have no explicit proxy list
pub const DEFAULT_DISCOVER_URL: &str = "https://discover.v1.shroud.io/proxies";

/// HTTP path served by the discovery service
pub const DISCOVER_PATH: &str = "/proxies";

/// Default port proxies accept tunnel connections on
pub const DEFAULT_TUNNEL_PORT: u16 = 4443;

/// ALPN identifier negotiated on tunnel connections
pub const TUNNEL_ALPN: &[u8] = b"shroud/1";
