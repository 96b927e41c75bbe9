//! # HTTP Server
//!
//! Two independent `axum` listeners, matching the `--metrics-addr` /
//! `--ssh-addr` split from §6:
//!
//! - `serve_metrics` exposes `/metrics`, `/healthz`, `/readyz`.
//! - `serve_control` exposes the ControlPlane routes of §4.6/§6, authenticated
//!   per-request via the `Authorization` header.
//!
//! "`--ssh-addr`" is a naming carry-over from the source tool (see
//! DESIGN.md); this binds plain HTTP/1.1, not an SSH transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::control_plane::{AuthContext, ControlPlane, ControlPlaneError};

/// Converts a Go-style `":2222"` address into a bindable `"0.0.0.0:2222"`.
fn bind_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

pub struct MetricsState {
    pub ready: Arc<AtomicBool>,
}

pub fn metrics_router(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(Arc::new(MetricsState { ready }))
}

pub async fn serve_metrics(addr: &str, ready: Arc<AtomicBool>) -> anyhow::Result<()> {
    let app = metrics_router(ready);
    let bind = bind_addr(addr);
    let listener = TcpListener::bind(&bind).await?;
    info!(addr = %bind, "metrics server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = crate::observability::metrics::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("failed to encode metrics: {e}").into_bytes(),
        );
    }

    (StatusCode::OK, [("content-type", "text/plain; version=0.0.4; charset=utf-8")], buffer)
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub fn control_router(control_plane: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/list/machine", get(list_machine_handler))
        .route("/list/service", get(list_service_handler))
        .route("/state/freeze", post(freeze_handler))
        .route("/state/unfreeze", post(unfreeze_handler))
        .route("/state/rollback", post(rollback_handler))
        .route("/do/pull", post(pull_handler))
        .with_state(control_plane)
}

pub async fn serve_control(addr: &str, control_plane: Arc<ControlPlane>) -> anyhow::Result<()> {
    let app = control_router(control_plane);
    let bind = bind_addr(addr);
    let listener = TcpListener::bind(&bind).await?;
    info!(addr = %bind, "control channel listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn bearer_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()
}

fn auth_message(method: &Method, uri: &Uri) -> Vec<u8> {
    format!("{method} {uri}").into_bytes()
}

fn authenticate(
    control_plane: &ControlPlane,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<AuthContext, ControlPlaneError> {
    control_plane.authenticate(&auth_message(method, uri), bearer_header(headers))
}

fn error_response(err: ControlPlaneError) -> Response {
    let status = match &err {
        ControlPlaneError::Unauthorized | ControlPlaneError::ReadOnly => StatusCode::UNAUTHORIZED,
        ControlPlaneError::UnknownService(_) => StatusCode::NOT_FOUND,
        ControlPlaneError::InvalidHash(_) => StatusCode::NOT_ACCEPTABLE,
        ControlPlaneError::KeyLoad { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

async fn list_machine_handler(
    State(control_plane): State<Arc<ControlPlane>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    match authenticate(&control_plane, &method, &uri, &headers) {
        Ok(_) => Json(control_plane.list_machines()).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_service_handler(
    State(control_plane): State<Arc<ControlPlane>>,
    Query(params): Query<HashMap<String, String>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = authenticate(&control_plane, &method, &uri, &headers) {
        return error_response(e);
    }
    let filter = params.get("service").map(String::as_str);
    match control_plane.list_services(filter).await {
        Ok(listing) => Json(listing).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, serde::Deserialize)]
struct ServiceParam {
    service: String,
}

async fn freeze_handler(
    State(control_plane): State<Arc<ControlPlane>>,
    Query(params): Query<ServiceParam>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let auth = match authenticate(&control_plane, &method, &uri, &headers) {
        Ok(a) => a,
        Err(e) => return error_response(e),
    };
    match control_plane.freeze(auth, &params.service).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn unfreeze_handler(
    State(control_plane): State<Arc<ControlPlane>>,
    Query(params): Query<ServiceParam>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let auth = match authenticate(&control_plane, &method, &uri, &headers) {
        Ok(a) => a,
        Err(e) => return error_response(e),
    };
    match control_plane.unfreeze(auth, &params.service).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, serde::Deserialize)]
struct RollbackParam {
    service: String,
    hash: String,
}

async fn rollback_handler(
    State(control_plane): State<Arc<ControlPlane>>,
    Query(params): Query<RollbackParam>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let auth = match authenticate(&control_plane, &method, &uri, &headers) {
        Ok(a) => a,
        Err(e) => return error_response(e),
    };
    match control_plane.rollback(auth, &params.service, &params.hash).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn pull_handler(
    State(control_plane): State<Arc<ControlPlane>>,
    Query(params): Query<ServiceParam>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let auth = match authenticate(&control_plane, &method, &uri, &headers) {
        Ok(a) => a,
        Err(e) => return error_response(e),
    };
    match control_plane.pull(auth, &params.service).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_addr_expands_bare_port() {
        assert_eq!(bind_addr(":9222"), "0.0.0.0:9222");
    }

    #[test]
    fn bind_addr_passes_through_explicit_host() {
        assert_eq!(bind_addr("127.0.0.1:9222"), "127.0.0.1:9222");
    }
}
