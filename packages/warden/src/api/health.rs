use axum::{Json, http::StatusCode, response::IntoResponse};
use serde_json::json;

/// Health check endpoint.
///
/// The managers hold no external connections to validate; if the router is
/// answering, the control plane is alive.
#[tracing::instrument]
pub async fn handle() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}
