//! Proxy side of a tunnel: read the listen request of a freshly accepted
//! tunnel connection, answer it, then open one HTTP/2 stream per public
//! connection.

use bytes::Bytes;
use h2::client::SendRequest;
use shroud_proto::{TunnelCodec, TunnelMessage, PROTOCOL_VERSION};
use shroud_transport::{TransportError, TransportResult};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::H2TunnelConfig;
use crate::pump::spawn_pump;

static NEXT_TUNNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Read the `Listen` request that opens every tunnel connection.
///
/// Returns the requested hostname. Version mismatches are answered with a
/// rejection before the error is returned.
pub async fn read_listen_request<IO>(io: &mut IO, config: &H2TunnelConfig) -> TransportResult<String>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let message = tokio::time::timeout(config.handshake_timeout, TunnelCodec::read_message(io))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

    match message {
        TunnelMessage::Listen { hostname, version } if version == PROTOCOL_VERSION => {
            Ok(hostname)
        }
        TunnelMessage::Listen { version, .. } => {
            let reason = format!(
                "unsupported protocol version {} (proxy speaks {})",
                version, PROTOCOL_VERSION
            );
            reject(io, &reason).await?;
            Err(TransportError::ProtocolError(reason))
        }
        other => Err(TransportError::ProtocolError(format!(
            "Expected listen request, got {:?}",
            other
        ))),
    }
}

/// Refuse a listen request
pub async fn reject<IO>(io: &mut IO, reason: &str) -> TransportResult<()>
where
    IO: AsyncWrite + Unpin,
{
    let message = TunnelMessage::ListenRejected {
        reason: reason.to_string(),
    };
    TunnelCodec::write_message(io, &message)
        .await
        .map_err(|e| TransportError::ProtocolError(e.to_string()))
}

/// Confirm the listen request and switch the connection to HTTP/2
pub async fn accept_tunnel<IO>(
    mut io: IO,
    hostname: &str,
    config: &H2TunnelConfig,
) -> TransportResult<ProxyTunnel>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let message = TunnelMessage::Listening {
        hostname: hostname.to_string(),
    };
    TunnelCodec::write_message(&mut io, &message)
        .await
        .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

    let (send_request, connection) = config
        .client_builder()
        .handshake::<_, Bytes>(io)
        .await
        .map_err(|e| TransportError::ConnectionError(format!("H2 handshake failed: {}", e)))?;

    let id = NEXT_TUNNEL_ID.fetch_add(1, Ordering::Relaxed);
    let closed = CancellationToken::new();

    let closed_clone = closed.clone();
    let host = hostname.to_string();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            if !e.is_go_away() && !e.is_io() {
                error!("[tunnel {} {}] H2 connection error: {}", id, host, e);
            }
        }
        debug!("[tunnel {} {}] H2 connection closed", id, host);
        closed_clone.cancel();
    });

    Ok(ProxyTunnel {
        id,
        hostname: hostname.to_string(),
        send_request: Mutex::new(send_request),
        closed,
        buffer_size: config.stream_buffer_size,
    })
}

/// A registered tunnel as seen by the proxy
pub struct ProxyTunnel {
    id: u64,
    hostname: String,
    send_request: Mutex<SendRequest<Bytes>>,
    closed: CancellationToken,
    buffer_size: usize,
}

impl std::fmt::Debug for ProxyTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyTunnel")
            .field("id", &self.id)
            .field("hostname", &self.hostname)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl ProxyTunnel {
    /// Process-unique tunnel identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the tunnel connection has ended
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Open a stream to the client for one public connection
    pub async fn open_stream(&self) -> TransportResult<DuplexStream> {
        if self.is_closed() {
            return Err(TransportError::StreamClosed);
        }

        // SendRequest is Clone; hold the lock only long enough to copy it
        let send_request = self.send_request.lock().await.clone();

        let mut ready = send_request.ready().await.map_err(|e| {
            TransportError::ConnectionError(format!("H2 connection not ready: {}", e))
        })?;

        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(format!("https://{}/", self.hostname))
            .body(())
            .map_err(|e| TransportError::ProtocolError(format!("Invalid stream request: {}", e)))?;

        let (response, send) = ready
            .send_request(request, false)
            .map_err(|e| TransportError::ConnectionError(format!("Failed to open stream: {}", e)))?;

        let stream_id = u64::from(send.stream_id().as_u32());

        let response = response.await.map_err(|e| {
            TransportError::ConnectionError(format!("Failed to get response: {}", e))
        })?;

        if response.status() != http::StatusCode::OK {
            return Err(TransportError::ConnectionError(format!(
                "Client returned {}",
                response.status()
            )));
        }

        debug!(
            "[tunnel {} {}] Opened stream {}",
            self.id, self.hostname, stream_id
        );

        Ok(spawn_pump(send, response.into_body(), self.buffer_size, stream_id))
    }
}
