//! Tunnel Orchestrator: one independent tunnel per proxy endpoint
//!
//! Each endpoint runs `Connecting -> Listening -> Relaying -> Closed|Failed`
//! in its own task. A failing endpoint only ends its own loop, and a failing
//! relay only ends itself.

use shroud_proto::ProxyEndpoint;
use shroud_transport::{
    AcceptedStream, TransportError, TunnelConnector, TunnelListener, TunnelSession,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::relay::RelayEngine;

/// Where an endpoint loop is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Connecting,
    Listening,
    Relaying,
    Failed,
    Closed,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointState::Connecting => "connecting",
            EndpointState::Listening => "listening",
            EndpointState::Relaying => "relaying",
            EndpointState::Failed => "failed",
            EndpointState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Failure of one endpoint; never affects the others
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Failed to connect to proxy: {0}")]
    Connect(#[source] TransportError),

    #[error("Failed to listen on proxy: {0}")]
    Listen(#[source] TransportError),

    #[error("Failed to accept stream: {0}")]
    Accept(#[source] TransportError),
}

/// How one endpoint loop ended
#[derive(Debug)]
pub struct EndpointOutcome {
    pub endpoint: ProxyEndpoint,
    /// `Closed` or `Failed`
    pub state: EndpointState,
    pub error: Option<EndpointError>,
    /// Streams accepted before the loop ended
    pub relays: u64,
}

impl EndpointOutcome {
    pub fn is_failed(&self) -> bool {
        self.state == EndpointState::Failed
    }
}

/// Optional cap on concurrent relays per endpoint
#[derive(Debug, Clone)]
pub struct RelayGate {
    semaphore: Option<Arc<Semaphore>>,
}

impl RelayGate {
    /// `0` means unbounded
    pub fn new(max_relays: usize) -> Self {
        let semaphore = (max_relays > 0).then(|| Arc::new(Semaphore::new(max_relays)));
        Self { semaphore }
    }

    pub fn unbounded() -> Self {
        Self { semaphore: None }
    }

    pub fn is_bounded(&self) -> bool {
        self.semaphore.is_some()
    }

    /// Wait for a free slot. The slot frees when the permit drops.
    pub async fn admit(&self) -> Option<OwnedSemaphorePermit> {
        let semaphore = self.semaphore.clone()?;
        // The semaphore is never closed
        semaphore.acquire_owned().await.ok()
    }
}

/// Runs the tunnels for one service across every endpoint
pub struct TunnelOrchestrator<C: TunnelConnector> {
    connector: Arc<C>,
    domain: String,
    engine: RelayEngine,
    max_relays: usize,
}

impl<C> TunnelOrchestrator<C>
where
    C: TunnelConnector + 'static,
{
    pub fn new(connector: Arc<C>, domain: impl Into<String>, engine: RelayEngine) -> Self {
        Self {
            connector,
            domain: domain.into(),
            engine,
            max_relays: 0,
        }
    }

    /// Bound concurrent relays per endpoint, 0 = unbounded
    pub fn with_max_relays(mut self, max_relays: usize) -> Self {
        self.max_relays = max_relays;
        self
    }

    /// Run one loop per endpoint until all of them end or `cancel` fires.
    ///
    /// Outcomes of loops that ended on their own are returned; loops still
    /// running at cancellation are aborted together with their relays.
    pub async fn run(
        &self,
        endpoints: Vec<ProxyEndpoint>,
        cancel: CancellationToken,
    ) -> Vec<EndpointOutcome> {
        let mut loops = JoinSet::new();

        for endpoint in endpoints {
            let run = EndpointLoop {
                connector: self.connector.clone(),
                domain: self.domain.clone(),
                engine: self.engine.clone(),
                gate: RelayGate::new(self.max_relays),
                cancel: cancel.child_token(),
                endpoint,
            };
            loops.spawn(run.run());
        }

        let mut outcomes = Vec::new();
        loop {
            tokio::select! {
                joined = loops.join_next() => match joined {
                    Some(Ok(outcome)) => {
                        outcomes.push(outcome);
                    }
                    Some(Err(e)) => error!("Endpoint task panicked: {}", e),
                    None => break,
                },
                _ = cancel.cancelled() => {
                    info!("Shutting down tunnels");
                    loops.shutdown().await;
                    break;
                }
            }
        }

        let failed = outcomes.iter().filter(|o| o.is_failed()).count();
        if failed > 0 && failed == outcomes.len() && !cancel.is_cancelled() {
            error!("Every proxy endpoint failed");
        }
        outcomes
    }
}

struct EndpointLoop<C: TunnelConnector> {
    connector: Arc<C>,
    domain: String,
    engine: RelayEngine,
    gate: RelayGate,
    cancel: CancellationToken,
    endpoint: ProxyEndpoint,
}

impl<C> EndpointLoop<C>
where
    C: TunnelConnector + 'static,
{
    async fn run(self) -> EndpointOutcome {
        let endpoint = self.endpoint.clone();
        let relays = Arc::new(AtomicU64::new(0));

        let (state, error) = match self.serve(relays.clone()).await {
            Ok(()) => {
                info!(endpoint = %endpoint, "Tunnel closed");
                (EndpointState::Closed, None)
            }
            Err(e) => {
                error!(endpoint = %endpoint, "{}", e);
                (EndpointState::Failed, Some(e))
            }
        };

        // Stop relays that belong to this endpoint
        self.cancel.cancel();

        EndpointOutcome {
            endpoint,
            state,
            error,
            relays: relays.load(Ordering::Relaxed),
        }
    }

    async fn serve(&self, relays: Arc<AtomicU64>) -> Result<(), EndpointError> {
        debug!(endpoint = %self.endpoint, state = %EndpointState::Connecting, "Endpoint state");
        let session = self
            .connector
            .connect(&self.endpoint)
            .await
            .map_err(EndpointError::Connect)?;

        debug!(endpoint = %self.endpoint, state = %EndpointState::Listening, "Endpoint state");
        let mut listener = session
            .listen(&self.domain)
            .await
            .map_err(EndpointError::Listen)?;
        info!(
            endpoint = %self.endpoint,
            "Listening for connections to {}", self.domain
        );

        debug!(endpoint = %self.endpoint, state = %EndpointState::Relaying, "Endpoint state");
        let mut tasks = JoinSet::new();
        loop {
            // A full gate stops accepting until a relay finishes
            let permit = tokio::select! {
                permit = self.gate.admit() => permit,
                _ = self.cancel.cancelled() => return Ok(()),
            };

            let accepted = tokio::select! {
                accepted = listener.accept() => accepted.map_err(EndpointError::Accept)?,
                _ = self.cancel.cancelled() => return Ok(()),
            };
            let Some(AcceptedStream { stream_id, stream }) = accepted else {
                return Ok(());
            };

            relays.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint = %self.endpoint, stream_id, "Accepted stream");

            let engine = self.engine.clone();
            let cancel = self.cancel.child_token();
            tasks.spawn(async move {
                let _permit = permit;
                // Errors are logged by the engine and end only this relay
                let _ = engine.relay(stream_id, stream, cancel).await;
            });

            // Reap finished relays
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    warn!(endpoint = %self.endpoint, "Relay task panicked: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shroud_transport::TransportResult;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Per endpoint behavior of the fake proxy fleet
    #[derive(Debug)]
    enum Behavior {
        RefuseConnect,
        RejectListen,
        /// Hand out streams pushed through the channel; closes when the
        /// sender drops
        Serve(Mutex<Option<mpsc::Receiver<DuplexStream>>>),
    }

    #[derive(Debug, Default)]
    struct FakeConnector {
        endpoints: HashMap<String, Behavior>,
    }

    impl FakeConnector {
        fn with(mut self, host: &str, behavior: Behavior) -> Self {
            self.endpoints.insert(host.to_string(), behavior);
            self
        }

        fn serving(self, host: &str) -> (Self, mpsc::Sender<DuplexStream>) {
            let (tx, rx) = mpsc::channel(8);
            (self.with(host, Behavior::Serve(Mutex::new(Some(rx)))), tx)
        }
    }

    #[derive(Debug)]
    struct FakeSession {
        reject: bool,
        streams: Mutex<Option<mpsc::Receiver<DuplexStream>>>,
    }

    #[derive(Debug)]
    struct FakeListener {
        streams: mpsc::Receiver<DuplexStream>,
        next_id: u64,
    }

    #[async_trait]
    impl TunnelConnector for FakeConnector {
        type Session = FakeSession;

        async fn connect(&self, endpoint: &ProxyEndpoint) -> TransportResult<FakeSession> {
            match self.endpoints.get(&endpoint.host) {
                None | Some(Behavior::RefuseConnect) => Err(TransportError::ConnectionError(
                    format!("connection refused by {}", endpoint),
                )),
                Some(Behavior::RejectListen) => Ok(FakeSession {
                    reject: true,
                    streams: Mutex::new(None),
                }),
                Some(Behavior::Serve(rx)) => Ok(FakeSession {
                    reject: false,
                    streams: Mutex::new(rx.lock().unwrap().take()),
                }),
            }
        }
    }

    #[async_trait]
    impl TunnelSession for FakeSession {
        type Listener = FakeListener;

        async fn listen(&self, hostname: &str) -> TransportResult<FakeListener> {
            if self.reject {
                return Err(TransportError::ListenRejected(format!(
                    "{} is already bound",
                    hostname
                )));
            }
            let streams = self.streams.lock().unwrap().take().ok_or_else(|| {
                TransportError::ConfigurationError("session already listening".to_string())
            })?;
            Ok(FakeListener {
                streams,
                next_id: 0,
            })
        }
    }

    #[async_trait]
    impl TunnelListener for FakeListener {
        type Stream = DuplexStream;

        async fn accept(&mut self) -> TransportResult<Option<AcceptedStream<DuplexStream>>> {
            Ok(self.streams.recv().await.map(|stream| {
                self.next_id += 1;
                AcceptedStream {
                    stream_id: self.next_id,
                    stream,
                }
            }))
        }
    }

    async fn echo_service() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn endpoints(hosts: &[&str]) -> Vec<ProxyEndpoint> {
        hosts.iter().map(|h| ProxyEndpoint::new(*h, 4443)).collect()
    }

    #[test]
    fn test_relay_gate() {
        assert!(!RelayGate::new(0).is_bounded());
        assert!(!RelayGate::unbounded().is_bounded());
        assert!(RelayGate::new(4).is_bounded());
    }

    #[tokio::test]
    async fn test_bounded_gate_waits_for_permit() {
        let gate = RelayGate::new(1);
        let first = gate.admit().await;
        assert!(first.is_some());

        let blocked = tokio::time::timeout(Duration::from_millis(20), gate.admit()).await;
        assert!(blocked.is_err());

        drop(first);
        assert!(gate.admit().await.is_some());
    }

    #[tokio::test]
    async fn test_unbounded_gate_never_waits() {
        let gate = RelayGate::new(0);
        for _ in 0..100 {
            assert!(gate.admit().await.is_none());
        }
    }

    #[tokio::test]
    async fn test_max_relays_queues_second_stream() {
        let (connector, streams) = FakeConnector::default().serving("p1.proxy");
        let engine = RelayEngine::with_acceptor(echo_service().await, None);
        let orchestrator =
            TunnelOrchestrator::new(Arc::new(connector), "x.example", engine).with_max_relays(1);

        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move { orchestrator.run(endpoints(&["p1.proxy"]), cancel).await }
        });

        let (mut first, public) = tokio::io::duplex(1024);
        streams.send(public).await.unwrap();
        first.write_all(b"one").await.unwrap();
        let mut buf = [0u8; 3];
        first.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");

        // Waits behind the first relay
        let (mut second, public) = tokio::io::duplex(1024);
        streams.send(public).await.unwrap();
        second.write_all(b"two").await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(200), second.read_exact(&mut buf)).await;
        assert!(waiting.is_err());

        // Finishing the first relay frees the slot
        first.shutdown().await.unwrap();
        let mut rest = Vec::new();
        first.read_to_end(&mut rest).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), second.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"two");

        cancel.cancel();
        let _ = run.await;
    }

    #[tokio::test]
    async fn test_endpoint_failures_are_isolated() {
        let (connector, streams) = FakeConnector::default()
            .with("down.proxy", Behavior::RefuseConnect)
            .with("busy.proxy", Behavior::RejectListen)
            .serving("p1.proxy");
        let connector = Arc::new(connector);

        let engine = RelayEngine::with_acceptor(echo_service().await, None);
        let orchestrator = TunnelOrchestrator::new(connector, "x.example", engine);

        let run = tokio::spawn(async move {
            orchestrator
                .run(
                    endpoints(&["down.proxy", "busy.proxy", "p1.proxy"]),
                    CancellationToken::new(),
                )
                .await
        });

        // The healthy endpoint still relays
        let (mut client, public) = tokio::io::duplex(1024);
        streams.send(public).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.shutdown().await.unwrap();

        // Closing the healthy tunnel ends the run
        drop(streams);
        let outcomes = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();

        let by_host: HashMap<String, &EndpointOutcome> = outcomes
            .iter()
            .map(|o| (o.endpoint.host.clone(), o))
            .collect();
        assert_eq!(by_host.len(), 3);

        assert_eq!(by_host["down.proxy"].state, EndpointState::Failed);
        assert!(matches!(
            by_host["down.proxy"].error,
            Some(EndpointError::Connect(_))
        ));

        assert_eq!(by_host["busy.proxy"].state, EndpointState::Failed);
        assert!(matches!(
            by_host["busy.proxy"].error,
            Some(EndpointError::Listen(TransportError::ListenRejected(_)))
        ));

        assert_eq!(by_host["p1.proxy"].state, EndpointState::Closed);
        assert!(by_host["p1.proxy"].error.is_none());
        assert_eq!(by_host["p1.proxy"].relays, 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_everything() {
        let (connector, streams) = FakeConnector::default().serving("p1.proxy");
        let connector = Arc::new(connector);
        let engine = RelayEngine::with_acceptor(echo_service().await, None);
        let orchestrator = TunnelOrchestrator::new(connector, "x.example", engine);

        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move { orchestrator.run(endpoints(&["p1.proxy"]), cancel).await }
        });

        // A relay in flight
        let (mut client, public) = tokio::io::duplex(1024);
        streams.send(public).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();

        // The relay was torn down with the tunnel
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
