// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! HTTP control API served while `pier up` runs.
//!
//! Exposes the registry's command surface as JSON over HTTP, plus the
//! Prometheus text exposition at `/metrics`.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use pier_core::{PierError, PierId, PierRegistry, PierSpec};

/// Control API state shared across handlers
#[derive(Clone)]
struct ControlState {
    registry: Arc<PierRegistry>,
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    name: String,
    #[serde(default)]
    directory: Option<PathBuf>,
}

/// `?lines=N` keeps only the last N lines.
#[derive(Debug, Deserialize)]
struct OutputQuery {
    lines: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// A registry error on its way to an HTTP response.
#[derive(Debug)]
struct ApiError(PierError);

impl From<PierError> for ApiError {
    fn from(e: PierError) -> Self {
        Self(e)
    }
}

fn status_for(err: &PierError) -> StatusCode {
    match err {
        PierError::HardValidation(_) => StatusCode::BAD_REQUEST,
        PierError::NotFound(_) => StatusCode::NOT_FOUND,
        PierError::DuplicateId(_)
        | PierError::DuplicateDirectory { .. }
        | PierError::PortConflict { .. }
        | PierError::AlreadyRunning(_)
        | PierError::NotRunning(_)
        | PierError::MustStopFirst(_)
        | PierError::OperationInProgress(_)
        | PierError::InvalidStateTransition(_) => StatusCode::CONFLICT,
        PierError::PortExhausted { .. } | PierError::StoreUnavailable { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        PierError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Control request failed");
        }
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn parse_id(raw: &str) -> Result<PierId, ApiError> {
    PierId::new(raw).map_err(|e| ApiError(e.into()))
}

pub fn router(registry: Arc<PierRegistry>) -> Router {
    Router::new()
        .route("/piers", get(list_piers).post(create_pier))
        .route("/piers/{id}", get(get_pier).delete(delete_pier))
        .route("/piers/{id}/start", post(start_pier))
        .route("/piers/{id}/stop", post(stop_pier))
        .route("/piers/{id}/clear-data", post(clear_pier_data))
        .route("/piers/{id}/output", get(pier_output))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(ControlState { registry })
}

/// Serve the control API on `port` until `shutdown` resolves.
pub async fn serve(
    port: u16,
    registry: Arc<PierRegistry>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Control API listening on http://{}", addr);

    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn list_piers(State(state): State<ControlState>) -> impl IntoResponse {
    Json(state.registry.list())
}

async fn create_pier(
    State(state): State<ControlState>,
    Json(req): Json<CreateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let spec = PierSpec {
        name: req.name,
        directory: req.directory,
    };
    let pier = state.registry.create(spec).await?;
    Ok((StatusCode::CREATED, Json(pier)))
}

async fn get_pier(
    State(state): State<ControlState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    state
        .registry
        .get(&id)
        .map(Json)
        .ok_or(ApiError(PierError::NotFound(id)))
}

async fn start_pier(
    State(state): State<ControlState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.registry.start(&id).await?))
}

async fn stop_pier(
    State(state): State<ControlState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.registry.stop(&id).await?))
}

async fn clear_pier_data(
    State(state): State<ControlState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.registry.clear_app_data(&id).await?))
}

async fn delete_pier(
    State(state): State<ControlState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    state.registry.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pier_output(
    State(state): State<ControlState>,
    Path(id): Path<String>,
    Query(query): Query<OutputQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.registry.output(&id, query.lines)?))
}

async fn metrics() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::render(),
    )
}
