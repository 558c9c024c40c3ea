//! Userspace WireGuard tunnel control.
//!
//! One tunnel at a time; `apply` replaces the active tunnel atomically from
//! the caller's point of view (stop-then-build under the controller mutex).
//! Configuration is write-only: nothing here ever surfaces key material.

pub mod config;
#[cfg(target_os = "linux")]
pub mod device;
#[cfg(target_os = "linux")]
pub mod routes;
pub mod uapi;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
    error::{Error, Result},
    tunnel::config::TunnelConfig,
};

/// Operational snapshot of the tunnel. Never includes key material.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_all: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<jiff::Timestamp>,
}

#[cfg(target_os = "linux")]
struct ActiveTunnel {
    config: TunnelConfig,
    applied_at: jiff::Timestamp,
    device: device::WireguardDevice,
    router: routes::RouteManager,
    installed_routes: Vec<netlink_packet_route::route::RouteMessage>,
    route_guard: CancellationToken,
}

#[cfg(not(target_os = "linux"))]
struct ActiveTunnel {
    config: TunnelConfig,
    applied_at: jiff::Timestamp,
    route_guard: CancellationToken,
}

/// Singleton controller for the WireGuard egress tunnel.
///
/// ## Cloning
///
/// Cheaply cloneable; clones share the controller mutex.
#[derive(Clone)]
pub struct TunnelController {
    active: Arc<Mutex<Option<ActiveTunnel>>>,
}

impl std::fmt::Debug for TunnelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelController").finish_non_exhaustive()
    }
}

impl TunnelController {
    pub fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Replace the tunnel with one built from `config`. The existing tunnel
    /// (if any) is stopped first, under the same lock, so concurrent callers
    /// observe apply as atomic.
    #[instrument(skip(self, config), fields(interface = %config.interface_name))]
    pub async fn apply(&self, config: TunnelConfig) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.take() {
            info!("tunnel.apply.replacing_existing");
            teardown(existing).await;
        }
        let tunnel = bring_up(config).await?;
        info!("tunnel.apply.up");
        *active = Some(tunnel);
        Ok(())
    }

    /// Tear down the active tunnel. Errors when none is running.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        let existing = active
            .take()
            .ok_or_else(|| Error::invalid_state("no tunnel is running"))?;
        teardown(existing).await;
        info!("tunnel.stopped");
        Ok(())
    }

    pub async fn status(&self) -> TunnelStatus {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(tunnel) => TunnelStatus {
                running: true,
                interface_name: Some(tunnel.config.interface_name.clone()),
                peer_endpoint: Some(tunnel.config.peer_endpoint.to_string()),
                mtu: Some(tunnel.config.mtu),
                route_all: Some(tunnel.config.route_all),
                applied_at: Some(tunnel.applied_at),
            },
            None => TunnelStatus {
                running: false,
                interface_name: None,
                peer_endpoint: None,
                mtu: None,
                route_all: None,
                applied_at: None,
            },
        }
    }
}

impl Default for TunnelController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
async fn bring_up(config: TunnelConfig) -> Result<ActiveTunnel> {
    // Resolve the peer before creating anything so a bad endpoint costs
    // nothing.
    let endpoint_addr = tokio::net::lookup_host(config.peer_endpoint.to_string())
        .await
        .map_err(|err| {
            Error::resource(format!(
                "resolve peer endpoint {}: {err}",
                config.peer_endpoint
            ))
        })?
        .next()
        .ok_or_else(|| {
            Error::resource(format!(
                "peer endpoint {} resolved to no addresses",
                config.peer_endpoint
            ))
        })?;

    let device = device::WireguardDevice::create(&config.interface_name).await?;
    if let Err(err) = device.configure(&uapi::set_request(&config, endpoint_addr)).await {
        device.shutdown().await;
        return Err(err);
    }

    let router = match routes::RouteManager::connect().await {
        Ok(router) => router,
        Err(err) => {
            device.shutdown().await;
            return Err(err);
        }
    };

    let up = async {
        let if_index = router.link_index(&config.interface_name).await?;
        router.add_address(if_index, config.local_ip).await?;
        router.bring_up(if_index, config.mtu).await?;
        Ok::<u32, Error>(if_index)
    };
    let if_index = match up.await {
        Ok(if_index) => if_index,
        Err(err) => {
            device.shutdown().await;
            return Err(err);
        }
    };

    let mut installed_routes = Vec::new();
    let route_guard = CancellationToken::new();
    if config.route_all {
        let routed = route_all(&config, &router, if_index, endpoint_addr.ip(), &route_guard).await;
        match routed {
            Ok(messages) => installed_routes = messages,
            Err(err) => {
                device.shutdown().await;
                return Err(err);
            }
        }
    }

    Ok(ActiveTunnel {
        config,
        applied_at: jiff::Timestamp::now(),
        device,
        router,
        installed_routes,
        route_guard,
    })
}

/// Take over the default route: a host route keeps the encrypted packets
/// flowing to the peer via the original gateway, and the half-default pair
/// sends everything else through the tunnel.
#[cfg(target_os = "linux")]
async fn route_all(
    config: &TunnelConfig,
    router: &routes::RouteManager,
    tunnel_if_index: u32,
    peer_ip: std::net::IpAddr,
    route_guard: &CancellationToken,
) -> Result<Vec<netlink_packet_route::route::RouteMessage>> {
    let mut installed = Vec::new();

    let rollback = |installed: Vec<netlink_packet_route::route::RouteMessage>| async {
        for message in installed.into_iter().rev() {
            if let Err(err) = router.delete_route(message).await {
                warn!(?err, "tunnel.route_all.rollback_failed");
            }
        }
    };

    let default = match router.default_ipv4_route().await? {
        Some(default) => default,
        None => return Err(Error::resource("no IPv4 default route to take over")),
    };

    match peer_ip {
        std::net::IpAddr::V4(peer_v4) => {
            match router
                .add_ipv4_route(peer_v4, 32, Some(default.gateway), default.if_index)
                .await
            {
                Ok(message) => installed.push(message),
                Err(err) => {
                    rollback(installed).await;
                    return Err(err);
                }
            }
        }
        std::net::IpAddr::V6(_) => {
            warn!(
                endpoint = %config.peer_endpoint,
                "tunnel.route_all.v6_peer_without_host_route"
            );
        }
    }

    for (dest, prefix) in routes::HALF_DEFAULTS {
        match router.add_ipv4_route(dest, prefix, None, tunnel_if_index).await {
            Ok(message) => installed.push(message),
            Err(err) => {
                rollback(installed).await;
                return Err(err);
            }
        }
    }

    if let Err(err) = routes::spawn_default_route_guard(default.if_index, route_guard.clone()).await
    {
        rollback(installed).await;
        return Err(err);
    }
    Ok(installed)
}

#[cfg(target_os = "linux")]
async fn teardown(tunnel: ActiveTunnel) {
    tunnel.route_guard.cancel();
    // Route cleanup failures are logged, not fatal: the controller still
    // transitions to "not running".
    for message in tunnel.installed_routes.into_iter().rev() {
        if let Err(err) = tunnel.router.delete_route(message).await {
            warn!(?err, "tunnel.teardown.route_delete_failed");
        }
    }
    tunnel.device.shutdown().await;
}

#[cfg(not(target_os = "linux"))]
async fn bring_up(_config: TunnelConfig) -> Result<ActiveTunnel> {
    Err(Error::resource(
        "tunnel support requires a Linux network stack",
    ))
}

#[cfg(not(target_os = "linux"))]
async fn teardown(tunnel: ActiveTunnel) {
    tunnel.route_guard.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_without_tunnel_is_an_invalid_state() {
        let controller = TunnelController::new();
        let err = controller.stop().await.expect_err("no tunnel running");
        assert!(err.to_string().contains("no tunnel is running"));
    }

    #[tokio::test]
    async fn status_starts_not_running() {
        let controller = TunnelController::new();
        let status = controller.status().await;
        assert!(!status.running);
        assert_eq!(status.interface_name, None);
    }
}
