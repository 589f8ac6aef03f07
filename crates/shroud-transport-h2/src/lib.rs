//! HTTP/2 tunnel transport
//!
//! A tunnel is one TLS connection from the client to a proxy. It starts with
//! a short listen handshake (length-prefixed messages from `shroud-proto`)
//! and then turns into an HTTP/2 connection with the roles reversed:
//!
//! - the proxy is the HTTP/2 client and opens one stream per public
//!   connection it wants to hand over
//! - the shroud client is the HTTP/2 server and accepts those streams
//!
//! # Stream Mapping
//!
//! - Each public connection = one HTTP/2 bidirectional stream
//! - Data is sent as DATA frames
//! - Half-close = END_STREAM flag
//!
//! Each stream is exposed as a plain `AsyncRead + AsyncWrite` byte stream so
//! callers can splice it like a socket.

pub mod client;
pub mod config;
mod pump;
pub mod server;

pub use client::{H2Session, H2TunnelConnector, H2TunnelListener, ACCEPT_QUEUE_SIZE};
pub use config::H2TunnelConfig;
pub use server::{accept_tunnel, read_listen_request, reject, ProxyTunnel};
