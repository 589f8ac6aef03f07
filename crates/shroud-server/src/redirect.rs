//! Plain HTTP listener that sends everyone to HTTPS

use axum::{
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};

/// Router answering every request with a permanent redirect to the same
/// host and path over https
pub fn redirect_router() -> Router {
    Router::new().fallback(redirect_handler)
}

async fn redirect_handler(headers: HeaderMap, uri: Uri) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()));

    let Some(host) = host else {
        return (StatusCode::BAD_REQUEST, "Missing Host header\n").into_response();
    };

    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let location = format!("https://{}{}", host, path);

    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, location)],
    )
        .into_response()
}
