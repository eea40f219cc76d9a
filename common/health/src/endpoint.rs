use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::readiness::{ReadinessState, ReadinessStatus, StatusKey};

/// Answer of a single probe axis: 200 when healthy, 503 otherwise, with the
/// annotations in the body for debugging.
#[derive(Debug, Serialize)]
pub struct ProbeResponse {
    pub status: &'static str,
    pub healthy: bool,
    pub annotations: std::collections::HashMap<String, String>,
}

impl ProbeResponse {
    pub fn new(key: StatusKey, snapshot: ReadinessStatus) -> Self {
        Self {
            status: key.as_str(),
            healthy: !snapshot.is_unhealthy(key),
            annotations: snapshot.annotations,
        }
    }
}

impl IntoResponse for ProbeResponse {
    fn into_response(self) -> Response {
        let code = match self.healthy {
            true => StatusCode::OK,
            false => StatusCode::SERVICE_UNAVAILABLE,
        };
        (code, Json(self)).into_response()
    }
}

async fn liveness(State(state): State<ReadinessState>) -> ProbeResponse {
    ProbeResponse::new(StatusKey::Live, state.snapshot())
}

async fn readiness(State(state): State<ReadinessState>) -> ProbeResponse {
    ProbeResponse::new(StatusKey::Ready, state.snapshot())
}

async fn startup(State(state): State<ReadinessState>) -> ProbeResponse {
    ProbeResponse::new(StatusKey::Started, state.snapshot())
}

async fn snapshot(State(state): State<ReadinessState>) -> Json<ReadinessStatus> {
    Json(state.snapshot())
}

/// Read-only probe routes for the orchestrator. Nothing here mutates the state.
pub fn router(state: ReadinessState) -> Router {
    Router::new()
        .route("/_liveness", get(liveness))
        .route("/_readiness", get(readiness))
        .route("/_startup", get(startup))
        .route("/_health", get(snapshot))
        .with_state(state)
}
