//! The native HTTP surface (spec §6): `/v1/dispatch` takes the gateway's own
//! canonical request shape rather than a vendor dialect, a single catch-all
//! route that delegates everything to the router.

use std::sync::Arc;

use axon_common::{ErrorKind, GatewayError};
use axon_provider::{CanonicalPayload, CanonicalResponse, RequestKind, RequestOverrides, StreamChunk};
use axon_router::{DispatchBody, DispatchRequest, Router};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::metrics::Metrics;

pub struct AppState {
    pub router: Arc<Router>,
    pub metrics: Arc<Metrics>,
}

pub fn build_router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/v1/dispatch", post(dispatch_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct DispatchRequestBody {
    model: String,
    #[serde(default)]
    kind: RequestKind,
    payload: CanonicalPayload,
    #[serde(default)]
    overrides: RequestOverrides,
    #[serde(default)]
    mcp_enabled: bool,
}

#[derive(Debug, Serialize)]
struct DispatchResponseBody {
    request_id: String,
    provider_id: String,
    model_id: String,
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<CanonicalResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<GatewayError>,
}

async fn dispatch_handler(State(state): State<Arc<AppState>>, Json(body): Json<DispatchRequestBody>) -> impl IntoResponse {
    let mut request = DispatchRequest::new(body.model, body.kind, body.payload);
    request.overrides = body.overrides;
    request.mcp_enabled = body.mcp_enabled;

    state.metrics.begin_dispatch();
    let outcome = state.router.dispatch(request).await;

    let result = match outcome.body {
        DispatchBody::Unary(result) => result,
        DispatchBody::Stream { chunks } => drain_stream(chunks).await,
    };
    state.metrics.finish_dispatch(outcome.attempts, result.is_err());

    let status = result.as_ref().err().map(|e| status_for_kind(e.kind)).unwrap_or(StatusCode::OK);
    let body = DispatchResponseBody {
        request_id: outcome.request_id.to_string(),
        provider_id: outcome.provider_id,
        model_id: outcome.model_id,
        attempts: outcome.attempts,
        response: result.as_ref().ok().cloned(),
        error: result.err(),
    };

    (status, Json(body))
}

/// `/v1/dispatch` returns a single JSON document, so a streamed dispatch is
/// drained to its terminal chunk here rather than handed to the caller
/// incrementally — chunk-by-chunk delivery belongs to a transport with its
/// own streaming wire format, which is out of this core's scope (spec §1).
async fn drain_stream(mut chunks: mpsc::Receiver<StreamChunk>) -> Result<CanonicalResponse, GatewayError> {
    while let Some(chunk) = chunks.recv().await {
        match chunk {
            StreamChunk::Delta { .. } => continue,
            StreamChunk::Terminal { assembled } => return Ok(assembled),
            StreamChunk::Error { error } => return Err(error),
        }
    }
    Err(GatewayError::new(ErrorKind::Network, "stream closed before a terminal chunk arrived"))
}

fn status_for_kind(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation | ErrorKind::Translation => StatusCode::BAD_REQUEST,
        ErrorKind::Auth => StatusCode::UNAUTHORIZED,
        ErrorKind::NoKeyForModel | ErrorKind::Config => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::QueueFull | ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Upstream5xx | ErrorKind::Upstream4xx | ErrorKind::Network => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Cancelled => StatusCode::from_u16(499).expect("499 is a valid status code"),
        ErrorKind::PluginError | ErrorKind::McpToolError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
