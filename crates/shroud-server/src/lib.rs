//! Shroud public proxy server
//!
//! Shroud clients dial in over TLS and register the hostname they serve.
//! Public TLS connections are routed to the matching tunnel by SNI and
//! passed through without decryption, so only the client ever sees
//! plaintext.

pub mod config;
pub mod redirect;
pub mod registry;
pub mod server;
pub mod sni;

pub use config::{
    parse_optional_addr, ProxyServerConfig, ProxyServerError, CLIENT_HELLO_TIMEOUT,
    STREAM_OPEN_TIMEOUT,
};
pub use redirect::redirect_router;
pub use registry::{RegistryError, Reservation, RoutedTunnel, TunnelRegistry};
pub use server::{ProxyServer, PublicConnectionError, PublicListener, TunnelAcceptor};
pub use sni::{extract_sni, read_client_hello, ClientHello, SniError};
