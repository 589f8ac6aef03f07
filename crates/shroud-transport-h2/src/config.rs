//! HTTP/2 tunnel configuration

use shroud_transport::{TransportError, TransportResult};
use std::time::Duration;

/// Settings shared by both ends of a tunnel connection
#[derive(Debug, Clone)]
pub struct H2TunnelConfig {
    /// Time allowed for TLS plus the listen handshake
    pub handshake_timeout: Duration,

    /// Per-stream flow control window
    pub initial_window_size: u32,

    /// Connection-wide flow control window
    pub initial_connection_window_size: u32,

    /// Maximum concurrent streams, i.e. public connections per tunnel
    pub max_concurrent_streams: u32,

    /// Maximum frame size
    pub max_frame_size: u32,

    /// Buffer between an HTTP/2 stream and its byte stream adapter
    pub stream_buffer_size: usize,
}

impl Default for H2TunnelConfig {
    fn default() -> Self {
        Self {
            // Tor circuits are slow to build
            handshake_timeout: Duration::from_secs(60),
            initial_window_size: 1024 * 1024, // 1MB
            initial_connection_window_size: 4 * 1024 * 1024, // 4MB
            max_concurrent_streams: 1000,
            max_frame_size: 16 * 1024, // 16KB (HTTP/2 default)
            stream_buffer_size: 64 * 1024,
        }
    }
}

impl H2TunnelConfig {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.initial_window_size == 0 || self.initial_connection_window_size == 0 {
            return Err(TransportError::ConfigurationError(
                "Window sizes must be > 0".to_string(),
            ));
        }
        // RFC 9113 bounds SETTINGS_MAX_FRAME_SIZE
        if !(16_384..=16_777_215).contains(&self.max_frame_size) {
            return Err(TransportError::ConfigurationError(format!(
                "Max frame size {} out of range",
                self.max_frame_size
            )));
        }
        if self.stream_buffer_size == 0 {
            return Err(TransportError::ConfigurationError(
                "Stream buffer size must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn server_builder(&self) -> h2::server::Builder {
        let mut builder = h2::server::Builder::new();
        builder
            .initial_window_size(self.initial_window_size)
            .initial_connection_window_size(self.initial_connection_window_size)
            .max_concurrent_streams(self.max_concurrent_streams)
            .max_frame_size(self.max_frame_size);
        builder
    }

    pub(crate) fn client_builder(&self) -> h2::client::Builder {
        let mut builder = h2::client::Builder::new();
        builder
            .initial_window_size(self.initial_window_size)
            .initial_connection_window_size(self.initial_connection_window_size)
            .max_frame_size(self.max_frame_size);
        builder
    }
}
