//! HTTP surface of the discovery service: `GET /proxies?q=<domain>`

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use shroud_proto::DISCOVER_PATH;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{DiscoverConfig, ListenMode};
use crate::resolver::Resolver;

#[derive(Debug, Deserialize)]
pub struct ProxiesQuery {
    q: Option<String>,
}

/// Router serving the discovery endpoint
pub fn router(resolver: Arc<Resolver>) -> Router {
    Router::new()
        .route(DISCOVER_PATH, get(proxies_handler))
        .with_state(resolver)
        .layer(TraceLayer::new_for_http())
}

/// Resolve the proxies for `q`.
///
/// 200 with a newline separated `host:port` list, 403 when the domain is not
/// delegated to the fleet, 500 when DNS fails or the fleet publishes nothing.
async fn proxies_handler(
    State(resolver): State<Arc<Resolver>>,
    Query(query): Query<ProxiesQuery>,
) -> Response {
    let Some(domain) = query.q.filter(|q| !q.is_empty()) else {
        return plain_error(StatusCode::BAD_REQUEST, "Missing query parameter 'q'");
    };

    match resolver.resolve(&domain).await {
        Ok(endpoints) => {
            let body = endpoints
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n");
            ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
        }
        Err(e) if e.is_invalid() => {
            info!(domain = %domain, "Rejected discovery request: {}", e);
            plain_error(StatusCode::FORBIDDEN, &e.to_string())
        }
        Err(e) => {
            warn!(domain = %domain, "Discovery failed: {}", e);
            plain_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("{}\n", message),
    )
        .into_response()
}

/// Discovery HTTP(S) server
pub struct DiscoverServer {
    config: DiscoverConfig,
    resolver: Arc<Resolver>,
}

impl DiscoverServer {
    pub fn new(config: DiscoverConfig, resolver: Arc<Resolver>) -> Self {
        Self { config, resolver }
    }

    /// Serve until the process exits
    pub async fn start(self) -> Result<(), anyhow::Error> {
        let router = router(self.resolver.clone());
        let addr = self.config.listen_addr;

        match &self.config.mode {
            ListenMode::Tls {
                cert_path,
                key_path,
            } => {
                let tls = shroud_cert::server_config_from_files(
                    cert_path,
                    key_path,
                    &[b"h2", b"http/1.1"],
                )?;
                let rustls_config =
                    axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(tls));

                info!("Discovery service listening on https://{}{}", addr, DISCOVER_PATH);
                axum_server::bind_rustls(addr, rustls_config)
                    .serve(router.into_make_service())
                    .await
                    .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
            }
            ListenMode::Plaintext => {
                warn!("Serving discovery over plaintext HTTP");
                let listener = TcpListener::bind(addr).await?;
                info!("Discovery service listening on http://{}{}", addr, DISCOVER_PATH);
                axum::serve(listener, router)
                    .await
                    .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{DnsError, DnsLookup, SrvRecord};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    #[derive(Debug)]
    struct ScenarioDns {
        cname: Option<&'static str>,
        fail: bool,
    }

    #[async_trait]
    impl DnsLookup for ScenarioDns {
        async fn lookup_cname(&self, _name: &str) -> Result<Option<String>, DnsError> {
            if self.fail {
                return Err(DnsError::Query {
                    name: "x.example.".to_string(),
                    reason: "timed out".to_string(),
                });
            }
            Ok(self.cname.map(str::to_string))
        }

        async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, DnsError> {
            if name == "_shroud._tls.x.example.proxy.v1.shroud.io" {
                Ok(vec![
                    SrvRecord::new("p1.proxy.", 4443),
                    SrvRecord::new("p2.proxy.", 4443),
                ])
            } else {
                Ok(vec![])
            }
        }
    }

    fn app(cname: Option<&'static str>, fail: bool) -> Router {
        let resolver = Resolver::new("proxy.v1.shroud.io", Arc::new(ScenarioDns { cname, fail }));
        router(Arc::new(resolver))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_valid_domain_lists_proxies() {
        let app = app(Some("x.example.proxy.v1.shroud.io."), false);
        let (status, content_type, body) = get(app, "/proxies?q=x.example").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/plain"));
        let mut lines: Vec<&str> = body.lines().collect();
        lines.sort();
        assert_eq!(lines, vec!["p1.proxy:4443", "p2.proxy:4443"]);
    }

    #[tokio::test]
    async fn test_undelegated_domain_is_forbidden() {
        let (status, _, body) = get(app(None, false), "/proxies?q=x.example").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.contains("x.example.proxy.v1.shroud.io"));
    }

    #[tokio::test]
    async fn test_lookup_failure_is_server_error() {
        let (status, _, body) = get(app(None, true), "/proxies?q=x.example").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("Error while validating CNAME for 'x.example': "));
    }

    #[tokio::test]
    async fn test_missing_query_is_bad_request() {
        let (status, _, _) = get(app(None, false), "/proxies").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = get(app(None, false), "/proxies?q=").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
