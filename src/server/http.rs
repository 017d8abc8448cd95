//! HTTP endpoint of a manager host
//!
//! - `POST /v1/schedule`: placement requests forwarded by peer schedulers
//! - `GET /health`: liveness plus a short summary of this host

use crate::common::{Error, ScheduleInput, ScheduleOutput};
use crate::manager::VolumeManager;
use crate::scheduler::Scheduler;
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Placement requests are small; anything bigger is rejected
const MAX_BODY_BYTES: usize = 1 << 20;

#[derive(Clone)]
pub struct ServerState {
    pub scheduler: Scheduler,
    pub manager: VolumeManager,
}

pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/v1/schedule", post(schedule))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn schedule(
    State(state): State<ServerState>,
    Json(input): Json<ScheduleInput>,
) -> Result<Json<ScheduleOutput>, Error> {
    tracing::debug!(
        "Schedule request for {} ({:?}) on host {}",
        input.item.instance.id,
        input.item.action,
        input.spec.host_id
    );
    let instance = state
        .scheduler
        .process(&input.spec, &input.item)
        .await
        .inspect_err(|e| tracing::warn!("Rejected schedule request: {}", e))?;
    Ok(Json(ScheduleOutput { instance }))
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    let host_id = state.scheduler.current_host_id();
    match state.manager.list().await {
        Ok(volumes) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "host_id": host_id,
                "volumes": volumes.len(),
                "attached": volumes.iter().filter(|v| v.is_attached()).count(),
                "version": env!("CARGO_PKG_VERSION"),
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "host_id": host_id,
                "error": e.to_string(),
                "version": env!("CARGO_PKG_VERSION"),
            })),
        ),
    }
}
