//! Route and address plumbing for the tunnel, over rtnetlink.
//!
//! Route-all does not delete the existing default route: it installs the
//! half-default pair `0.0.0.0/1` + `128.0.0.0/1` through the tunnel, which
//! outranks `0.0.0.0/0` by prefix length. Every route added here is recorded
//! so teardown removes exactly what was installed and nothing else.

use std::net::Ipv4Addr;

use futures::{StreamExt, TryStreamExt};
use netlink_packet_core::NetlinkPayload;
use netlink_packet_route::{
    AddressFamily, RouteNetlinkMessage,
    route::{RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteScope},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{Error, Result},
    tunnel::config::Cidr,
};

/// The two routes that together cover the IPv4 space and outrank any
/// existing default route.
pub const HALF_DEFAULTS: [(Ipv4Addr, u8); 2] = [
    (Ipv4Addr::new(0, 0, 0, 0), 1),
    (Ipv4Addr::new(128, 0, 0, 0), 1),
];

/// rtnetlink multicast group for IPv4 route changes.
const RTMGRP_IPV4_ROUTE: u32 = 0x40;

/// The current default gateway and the interface it lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: Ipv4Addr,
    pub if_index: u32,
}

/// Handle for link, address, and route edits.
pub struct RouteManager {
    handle: rtnetlink::Handle,
}

impl RouteManager {
    pub async fn connect() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|err| Error::resource(format!("open netlink connection: {err}")))?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Interface index for a link name.
    pub async fn link_index(&self, name: &str) -> Result<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        let link = links
            .try_next()
            .await
            .map_err(|err| Error::resource(format!("look up link {name}: {err}")))?
            .ok_or_else(|| Error::resource(format!("link {name} not found")))?;
        Ok(link.header.index)
    }

    /// Assign an address to a link.
    #[instrument(skip(self))]
    pub async fn add_address(&self, if_index: u32, address: Cidr) -> Result<()> {
        self.handle
            .address()
            .add(if_index, address.addr, address.prefix)
            .execute()
            .await
            .map_err(|err| Error::resource(format!("assign {address}: {err}")))
    }

    /// Set the link's MTU and bring it up.
    #[instrument(skip(self))]
    pub async fn bring_up(&self, if_index: u32, mtu: u32) -> Result<()> {
        self.handle
            .link()
            .set(if_index)
            .mtu(mtu)
            .up()
            .execute()
            .await
            .map_err(|err| Error::resource(format!("bring link up: {err}")))
    }

    /// Find the IPv4 default route in the main table.
    pub async fn default_ipv4_route(&self) -> Result<Option<DefaultRoute>> {
        let mut routes = self.handle.route().get(rtnetlink::IpVersion::V4).execute();
        while let Some(route) = routes
            .try_next()
            .await
            .map_err(|err| Error::resource(format!("dump routes: {err}")))?
        {
            if let Some(default) = as_default_route(&route) {
                return Ok(Some(default));
            }
        }
        Ok(None)
    }

    /// Add an IPv4 route and return the message used, for exact teardown.
    /// Gateway-less routes are scoped to the link.
    #[instrument(skip(self))]
    pub async fn add_ipv4_route(
        &self,
        dest: Ipv4Addr,
        prefix: u8,
        gateway: Option<Ipv4Addr>,
        if_index: u32,
    ) -> Result<RouteMessage> {
        let mut request = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(dest, prefix)
            .output_interface(if_index);
        match gateway {
            Some(gateway) => {
                request = request.gateway(gateway);
            }
            None => {
                request.message_mut().header.scope = RouteScope::Link;
            }
        }
        let message = request.message_mut().clone();
        request
            .replace()
            .execute()
            .await
            .map_err(|err| Error::resource(format!("add route {dest}/{prefix}: {err}")))?;
        info!(%dest, prefix, ?gateway, if_index, "tunnel.route.added");
        Ok(message)
    }

    /// Remove a previously added route. Missing routes are fine: cleanup is
    /// best-effort and the route may already be gone.
    pub async fn delete_route(&self, message: RouteMessage) -> Result<()> {
        self.handle
            .route()
            .del(message)
            .execute()
            .await
            .map_err(|err| Error::resource(format!("delete route: {err}")))
    }
}

fn as_default_route(route: &RouteMessage) -> Option<DefaultRoute> {
    if route.header.address_family != AddressFamily::Inet
        || route.header.destination_prefix_length != 0
        || route.header.table != RouteHeader::RT_TABLE_MAIN
    {
        return None;
    }
    let mut gateway = None;
    let mut if_index = None;
    for attribute in &route.attributes {
        match attribute {
            RouteAttribute::Gateway(RouteAddress::Inet(addr)) => gateway = Some(*addr),
            RouteAttribute::Oif(index) => if_index = Some(*index),
            _ => {}
        }
    }
    Some(DefaultRoute {
        gateway: gateway?,
        if_index: if_index?,
    })
}

/// Watch for a default route reappearing on the physical interface while the
/// tunnel owns egress, and remove it. Container runtimes are known to re-add
/// the original default behind our back.
pub async fn spawn_default_route_guard(
    physical_if_index: u32,
    done: CancellationToken,
) -> Result<()> {
    let (mut connection, handle, mut messages) = rtnetlink::new_connection()
        .map_err(|err| Error::resource(format!("open netlink monitor: {err}")))?;
    let group_addr = netlink_sys::SocketAddr::new(0, RTMGRP_IPV4_ROUTE);
    use netlink_sys::AsyncSocket as _;
    connection
        .socket_mut()
        .socket_mut()
        .bind(&group_addr)
        .map_err(|err| Error::resource(format!("bind netlink monitor: {err}")))?;
    tokio::spawn(connection);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                message = messages.next() => {
                    let Some((message, _)) = message else { break };
                    let NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(route)) =
                        message.payload
                    else {
                        continue;
                    };
                    let Some(default) = as_default_route(&route) else {
                        continue;
                    };
                    if default.if_index != physical_if_index {
                        continue;
                    }
                    warn!(
                        gateway = %default.gateway,
                        if_index = default.if_index,
                        "tunnel.route_guard.removing_new_default"
                    );
                    if let Err(err) = handle.route().del(route).execute().await {
                        warn!(?err, "tunnel.route_guard.delete_failed");
                    }
                }
            }
        }
        debug!("tunnel.route_guard.stopped");
    });
    Ok(())
}
