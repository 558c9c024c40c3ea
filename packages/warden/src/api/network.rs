//! Network endpoints: port snapshots and monitors, and the tunnel.

use aerosol::axum::Dep;
use axum::{
    Json,
    extract::Path,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use clients::warden::v1::{
    ApplyTunnelRequest, ErrorResponse, MessageResponse, MonitorPortsRequest, PortsResponse,
};
use tracing::{error, info};

use crate::{
    api::ApiError,
    error::Error,
    ports::PortTracker,
    tunnel::{TunnelController, config::TunnelConfig},
};

/// Snapshot of the TCP ports open in a pid's process subtree.
#[tracing::instrument(skip(ports))]
pub async fn ports(
    Dep(ports): Dep<PortTracker>,
    Path(pid): Path<u32>,
) -> Result<Json<PortsResponse>, ApiError> {
    let open = ports.open_ports(pid).await?;
    Ok(Json(PortsResponse {
        pid,
        ports: open.into_iter().collect(),
    }))
}

/// Register (or replace) the port-open callback for a pid.
#[tracing::instrument(skip(ports))]
pub async fn monitor(
    Dep(ports): Dep<PortTracker>,
    Path(pid): Path<u32>,
    Json(request): Json<MonitorPortsRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    ports.register(pid, request.callback)?;
    Ok(Json(MessageResponse {
        message: format!("port monitor registered for pid {pid}"),
    }))
}

/// Remove a pid's port-open callback.
#[tracing::instrument(skip(ports))]
pub async fn unmonitor(
    Dep(ports): Dep<PortTracker>,
    Path(pid): Path<u32>,
) -> Result<Json<MessageResponse>, ApiError> {
    ports.unregister(pid)?;
    Ok(Json(MessageResponse {
        message: format!("port monitor removed for pid {pid}"),
    }))
}

/// Apply a tunnel configuration (base64-encoded JSON), replacing any active
/// tunnel.
///
/// There is deliberately no read-back endpoint for this configuration: it
/// carries key material.
#[tracing::instrument(skip(tunnel, request))]
pub async fn apply_tunnel(
    Dep(tunnel): Dep<TunnelController>,
    Json(request): Json<ApplyTunnelRequest>,
) -> ApplyTunnelResponse {
    let config = match TunnelConfig::from_base64(&request.config) {
        Ok(config) => config,
        Err(err) => {
            info!(%err, "tunnel.apply.invalid_config");
            return ApplyTunnelResponse::Invalid(err.to_string());
        }
    };

    match tunnel.apply(config).await {
        Ok(()) => ApplyTunnelResponse::Updated,
        Err(err @ Error::InvalidArgument { .. }) => {
            info!(%err, "tunnel.apply.invalid_config");
            ApplyTunnelResponse::Invalid(err.to_string())
        }
        Err(err) => {
            error!(%err, "tunnel.apply.error");
            ApplyTunnelResponse::Failed(err.to_string())
        }
    }
}

#[derive(Debug)]
pub enum ApplyTunnelResponse {
    Updated,
    /// The config failed validation; nothing was touched.
    Invalid(String),
    /// The config was valid but the system could not build the tunnel.
    Failed(String),
}

impl IntoResponse for ApplyTunnelResponse {
    fn into_response(self) -> Response {
        match self {
            ApplyTunnelResponse::Updated => (
                StatusCode::OK,
                Json(MessageResponse {
                    message: "tunnel configuration updated".into(),
                }),
            )
                .into_response(),
            ApplyTunnelResponse::Invalid(error) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorResponse { error }),
            )
                .into_response(),
            ApplyTunnelResponse::Failed(error) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse { error }),
            )
                .into_response(),
        }
    }
}

/// Tear down the active tunnel.
#[tracing::instrument(skip(tunnel))]
pub async fn disconnect_tunnel(Dep(tunnel): Dep<TunnelController>) -> DisconnectTunnelResponse {
    match tunnel.stop().await {
        Ok(()) => DisconnectTunnelResponse::Disconnected,
        Err(err @ Error::InvalidState { .. }) => DisconnectTunnelResponse::NotRunning(err.to_string()),
        Err(err) => {
            error!(%err, "tunnel.disconnect.error");
            DisconnectTunnelResponse::Failed(err.to_string())
        }
    }
}

#[derive(Debug)]
pub enum DisconnectTunnelResponse {
    Disconnected,
    NotRunning(String),
    Failed(String),
}

impl IntoResponse for DisconnectTunnelResponse {
    fn into_response(self) -> Response {
        match self {
            DisconnectTunnelResponse::Disconnected => (
                StatusCode::OK,
                Json(MessageResponse {
                    message: "tunnel disconnected".into(),
                }),
            )
                .into_response(),
            DisconnectTunnelResponse::NotRunning(error) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { error })).into_response()
            }
            DisconnectTunnelResponse::Failed(error) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse { error }),
            )
                .into_response(),
        }
    }
}
