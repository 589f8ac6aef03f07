//! Tunnel handshake messages

use serde::{Deserialize, Serialize};

/// Messages exchanged on a fresh tunnel connection before it switches to
/// stream multiplexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelMessage {
    /// Client -> proxy: route TLS connections for `hostname` to this tunnel
    Listen { hostname: String, version: u32 },

    /// Proxy -> client: the hostname is bound to this tunnel
    Listening { hostname: String },

    /// Proxy -> client: the hostname could not be bound
    ListenRejected { reason: String },
}
