//! HTTP server and endpoints.

use crate::gateway::{HEADER_SESSION_ID, JSON_MIME_TYPE, ProxyGateway, ProxyRequest};
use crate::manager::{ManagerStats, SessionManager};
use crate::session::SessionInfo;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Instant;
use tracing::Instrument as _;

/// Hard cap on a proxied POST body.
pub const MAX_POST_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Shared application state.
pub struct AppState {
    pub gateway: ProxyGateway,
    pub start_time: Instant,
    pub version: &'static str,
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl AppState {
    #[must_use]
    pub fn new(gateway: ProxyGateway, version: &'static str) -> Self {
        Self {
            gateway,
            start_time: Instant::now(),
            version,
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        }
    }

    fn manager(&self) -> &Arc<SessionManager> {
        self.gateway.manager()
    }
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Proxy endpoint
        .route(
            "/containers/{container_id}/mcp-proxy/{server_name}",
            post(post_mcp_proxy).delete(delete_mcp_proxy),
        )
        .layer(DefaultBodyLimit::max(MAX_POST_BODY_BYTES))
        // Health and status
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

/// Attach request counting middleware (total + failed).
pub fn with_request_counting(router: Router, state: Arc<AppState>) -> Router {
    use axum::{
        body::Body,
        http::Request,
        middleware::{Next, from_fn_with_state},
    };

    async fn count_requests(
        State(state): State<Arc<AppState>>,
        request: Request<Body>,
        next: Next,
    ) -> Response {
        let should_count = request.uri().path().starts_with("/containers/");

        if should_count {
            state.total_requests.fetch_add(1, Ordering::Relaxed);
        }
        let response = next.run(request).await;
        if should_count && !response.status().is_success() {
            state.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        response
    }

    router.layer(from_fn_with_state(state, count_requests))
}

// ============================================================================
// Proxy Endpoint
// ============================================================================

fn session_id_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(HEADER_SESSION_ID)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Anything but JSON (or no content type at all) is refused.
fn ensure_json_content_type(headers: &HeaderMap) -> Result<(), (StatusCode, &'static str)> {
    let Some(ct) = headers.get(header::CONTENT_TYPE) else {
        return Ok(());
    };
    let ct = ct.to_str().unwrap_or_default().trim().to_ascii_lowercase();
    if ct.starts_with(JSON_MIME_TYPE) {
        Ok(())
    } else {
        Err((
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Unsupported Media Type: Content-Type must be application/json",
        ))
    }
}

/// POST /containers/{container_id}/mcp-proxy/{server_name}
async fn post_mcp_proxy(
    Path((container_id, server_name)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(rejection) = ensure_json_content_type(&headers) {
        return rejection.into_response();
    }

    let session_id = session_id_header(&headers);
    let span = tracing::info_span!(
        "mcp_proxy.post",
        container_id = %container_id,
        server_name = %server_name,
        session_id = tracing::field::Empty,
        body_bytes = body.len(),
    );
    if let Some(id) = session_id {
        span.record("session_id", id);
    }

    let request = ProxyRequest {
        container_id: &container_id,
        server_name: &server_name,
        session_id,
        accept: headers.get(header::ACCEPT).and_then(|h| h.to_str().ok()),
        body: &body,
    };
    state.gateway.handle(request).instrument(span).await
}

/// DELETE /containers/{container_id}/mcp-proxy/{server_name}
async fn delete_mcp_proxy(
    Path((container_id, server_name)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let session_id = session_id_header(&headers);
    let span = tracing::info_span!(
        "mcp_proxy.delete",
        container_id = %container_id,
        server_name = %server_name,
        session_id = session_id.unwrap_or_default(),
    );
    state
        .gateway
        .terminate(&container_id, &server_name, session_id)
        .instrument(span)
        .await
}

// ============================================================================
// Health Endpoints
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// GET /health - Always returns 200 if the proxy is running.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

// ============================================================================
// Status Endpoint
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    version: &'static str,
    uptime_seconds: u64,
    sessions: Vec<SessionInfo>,
    stats: StatsInfo,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsInfo {
    total_requests: u64,
    failed_requests: u64,
    #[serde(flatten)]
    sessions: ManagerStats,
}

/// GET /status - Live sessions and counters.
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StatusResponse {
        version: state.version,
        uptime_seconds: state.start_time.elapsed().as_secs(),
        sessions: state.manager().snapshot(),
        stats: StatsInfo {
            total_requests: state.total_requests.load(Ordering::Relaxed),
            failed_requests: state.failed_requests.load(Ordering::Relaxed),
            sessions: state.manager().stats(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn session_header_is_trimmed_and_optional() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_id_header(&headers), None);

        headers.insert(HEADER_SESSION_ID, HeaderValue::from_static("  "));
        assert_eq!(session_id_header(&headers), None);

        headers.insert(HEADER_SESSION_ID, HeaderValue::from_static(" abc "));
        assert_eq!(session_id_header(&headers), Some("abc"));
    }

    #[test]
    fn content_type_must_be_json_when_present() {
        let mut headers = HeaderMap::new();
        assert!(ensure_json_content_type(&headers).is_ok());

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        assert!(ensure_json_content_type(&headers).is_ok());

        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let (status, _) = ensure_json_content_type(&headers).expect_err("rejected");
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }
}
