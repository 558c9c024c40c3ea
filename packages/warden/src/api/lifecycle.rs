//! Lifecycle endpoints: sandbox state and scheduled stops.

use aerosol::axum::Dep;
use axum::Json;
use clients::warden::v1::{LifecycleStatusResponse, MessageResponse, StopRequest};

use crate::lifecycle::LifecycleController;

/// Sandbox state, scheduled stop (if any), and the keep-alive process set.
#[tracing::instrument(skip(lifecycle))]
pub async fn status(Dep(lifecycle): Dep<LifecycleController>) -> Json<LifecycleStatusResponse> {
    Json(lifecycle.status())
}

/// `GET /stop`: clear all keep-alive flags immediately.
#[tracing::instrument(skip(lifecycle))]
pub async fn stop_now(Dep(lifecycle): Dep<LifecycleController>) -> Json<MessageResponse> {
    lifecycle.stop(None);
    Json(MessageResponse {
        message: "keep-alive cleared".into(),
    })
}

/// `POST /stop`: clear keep-alive flags now, or after `timeout` seconds. A
/// fresh request cancels any previously scheduled stop.
#[tracing::instrument(skip(lifecycle))]
pub async fn stop(
    Dep(lifecycle): Dep<LifecycleController>,
    Json(request): Json<StopRequest>,
) -> Json<MessageResponse> {
    lifecycle.stop(request.timeout);
    let message = match request.timeout {
        Some(timeout) if timeout > 0 => format!("stop scheduled in {timeout}s"),
        _ => "keep-alive cleared".into(),
    };
    Json(MessageResponse { message })
}
