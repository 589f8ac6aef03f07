//! End-to-end tests of the HTTP/2 tunnel over real TCP + TLS on localhost

use rustls::pki_types::CertificateDer;
use shroud_proto::{ProxyEndpoint, TUNNEL_ALPN};
use shroud_transport::{
    DirectDialer, TransportError, TunnelConnector, TunnelListener, TunnelSession,
};
use shroud_transport_h2::{
    accept_tunnel, read_listen_request, reject, H2TunnelConfig, H2TunnelConnector, ProxyTunnel,
    ACCEPT_QUEUE_SIZE,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

struct TestProxy {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    root: CertificateDer<'static>,
}

async fn test_proxy() -> TestProxy {
    let cert = shroud_cert::generate_self_signed_cert(&["localhost"]).unwrap();
    let root = cert.cert_der.clone();
    let config = shroud_cert::server_config(vec![cert.cert_der], cert.key_der, &[TUNNEL_ALPN]).unwrap();

    TestProxy {
        listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        acceptor: TlsAcceptor::from(Arc::new(config)),
        root,
    }
}

impl TestProxy {
    fn endpoint(&self) -> ProxyEndpoint {
        ProxyEndpoint::new("localhost", self.listener.local_addr().unwrap().port())
    }

    fn connector(&self) -> H2TunnelConnector {
        H2TunnelConnector::new(
            Arc::new(DirectDialer),
            &[self.root.clone()],
            H2TunnelConfig::default().with_handshake_timeout(Duration::from_secs(5)),
        )
        .unwrap()
    }

    /// Accept one tunnel and register whatever hostname it asks for
    fn spawn_accept(self) -> tokio::task::JoinHandle<ProxyTunnel> {
        tokio::spawn(async move {
            let config = H2TunnelConfig::default();
            let (tcp, _) = self.listener.accept().await.unwrap();
            let mut tls = self.acceptor.accept(tcp).await.unwrap();
            let hostname = read_listen_request(&mut tls, &config).await.unwrap();
            accept_tunnel(tls, &hostname, &config).await.unwrap()
        })
    }
}

#[tokio::test]
async fn test_stream_round_trip() {
    let proxy = test_proxy().await;
    let endpoint = proxy.endpoint();
    let connector = proxy.connector();
    let proxy_task = proxy.spawn_accept();

    let session = connector.connect(&endpoint).await.unwrap();
    let mut listener = session.listen("x.example").await.unwrap();
    let tunnel = proxy_task.await.unwrap();
    assert_eq!(tunnel.hostname(), "x.example");

    let proxy_side = tokio::spawn(async move {
        let mut stream = tunnel.open_stream().await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
        tunnel
    });

    let accepted = listener.accept().await.unwrap().unwrap();
    let mut stream = accepted.stream;
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await.unwrap();
    assert_eq!(&request, b"ping");
    stream.write_all(b"pong").await.unwrap();

    proxy_side.await.unwrap();
}

#[tokio::test]
async fn test_half_close_propagates() {
    let proxy = test_proxy().await;
    let endpoint = proxy.endpoint();
    let connector = proxy.connector();
    let proxy_task = proxy.spawn_accept();

    let session = connector.connect(&endpoint).await.unwrap();
    let mut listener = session.listen("x.example").await.unwrap();
    let tunnel = proxy_task.await.unwrap();

    let proxy_side = tokio::spawn(async move {
        let mut stream = tunnel.open_stream().await.unwrap();
        stream.write_all(b"request").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        reply
    });

    let mut stream = listener.accept().await.unwrap().unwrap().stream;
    let mut request = Vec::new();
    stream.read_to_end(&mut request).await.unwrap();
    assert_eq!(request, b"request");

    // Our write side is still open after the peer finished
    stream.write_all(b"response").await.unwrap();
    stream.shutdown().await.unwrap();

    assert_eq!(proxy_side.await.unwrap(), b"response");
}

#[tokio::test]
async fn test_active_stream_flows_while_accept_queue_is_full() {
    let proxy = test_proxy().await;
    let endpoint = proxy.endpoint();
    let connector = proxy.connector();
    let proxy_task = proxy.spawn_accept();

    let session = connector.connect(&endpoint).await.unwrap();
    let mut listener = session.listen("x.example").await.unwrap();
    let tunnel = proxy_task.await.unwrap();

    let mut active = tunnel.open_stream().await.unwrap();
    let mut accepted = listener.accept().await.unwrap().unwrap().stream;
    tokio::spawn(async move {
        let (mut r, mut w) = tokio::io::split(&mut accepted);
        let _ = tokio::io::copy(&mut r, &mut w).await;
    });

    // Nobody accepts these: the queue fills up, then streams are refused
    let mut pending = Vec::new();
    let mut refused = 0;
    for _ in 0..ACCEPT_QUEUE_SIZE + 16 {
        match tokio::time::timeout(Duration::from_secs(3), tunnel.open_stream())
            .await
            .expect("open_stream must not hang")
        {
            Ok(stream) => pending.push(stream),
            Err(_) => refused += 1,
        }
    }
    assert_eq!(pending.len(), ACCEPT_QUEUE_SIZE);
    assert_eq!(refused, 16);

    active.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(3), active.read_exact(&mut reply))
        .await
        .expect("active stream stalled")
        .unwrap();
    assert_eq!(&reply, b"ping");

    // The queued streams are still delivered in order
    assert!(listener.accept().await.unwrap().is_some());
}

#[tokio::test]
async fn test_listen_rejected() {
    let proxy = test_proxy().await;
    let endpoint = proxy.endpoint();
    let connector = proxy.connector();

    tokio::spawn(async move {
        let config = H2TunnelConfig::default();
        let (tcp, _) = proxy.listener.accept().await.unwrap();
        let mut tls = proxy.acceptor.accept(tcp).await.unwrap();
        let _ = read_listen_request(&mut tls, &config).await.unwrap();
        reject(&mut tls, "hostname already bound").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let session = connector.connect(&endpoint).await.unwrap();
    match session.listen("x.example").await {
        Err(TransportError::ListenRejected(reason)) => assert_eq!(reason, "hostname already bound"),
        other => panic!("expected rejection, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_accept_returns_none_when_tunnel_closes() {
    let proxy = test_proxy().await;
    let endpoint = proxy.endpoint();
    let connector = proxy.connector();
    let proxy_task = proxy.spawn_accept();

    let session = connector.connect(&endpoint).await.unwrap();
    let mut listener = session.listen("x.example").await.unwrap();
    let tunnel = proxy_task.await.unwrap();

    drop(tunnel);

    let next = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_session_listens_once() {
    let proxy = test_proxy().await;
    let endpoint = proxy.endpoint();
    let connector = proxy.connector();
    let _proxy_task = proxy.spawn_accept();

    let session = connector.connect(&endpoint).await.unwrap();
    let _listener = session.listen("x.example").await.unwrap();

    let second = session.listen("y.example").await;
    assert!(matches!(second, Err(TransportError::ConfigurationError(_))));
}

#[tokio::test]
async fn test_untrusted_proxy_certificate() {
    let proxy = test_proxy().await;
    let endpoint = proxy.endpoint();

    // No extra roots: the self-signed certificate must be refused
    let connector =
        H2TunnelConnector::new(Arc::new(DirectDialer), &[], H2TunnelConfig::default()).unwrap();

    tokio::spawn(async move {
        let (tcp, _) = proxy.listener.accept().await.unwrap();
        let _ = proxy.acceptor.accept(tcp).await;
    });

    let result = connector.connect(&endpoint).await;
    assert!(matches!(result, Err(TransportError::TlsError(_))));
}
