//! HTTP handlers for the failover status surface

use super::server::AppState;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

/// Raw CARP notification posted by the OS event hook
#[derive(Deserialize)]
pub struct EventRequest {
    pub subsystem: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Handler for the peer's status RPC
pub async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.subscriber.engine().status().await;
    Json(json!({ "status": status }))
}

pub async fn refresh_status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.subscriber.engine().refresh_status().await;
    Json(json!({ "status": status }))
}

pub async fn pools_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.subscriber.engine().pools_imported().await {
        Ok(imported) => Json(json!({ "imported": imported })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

pub async fn in_progress_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "in_progress": state.subscriber.engine().in_progress() }))
}

/// Feed one notification to the subscriber. The engine runs in the
/// background, so this only acknowledges receipt.
pub async fn event_handler(
    State(state): State<AppState>,
    Json(payload): Json<EventRequest>,
) -> impl IntoResponse {
    match state.subscriber.publish(&payload.subsystem, &payload.kind) {
        Ok(event) => (StatusCode::ACCEPTED, Json(json!(event))).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

pub async fn force_master_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.subscriber.force_master().await {
        Ok(result) => Json(json!(result)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
