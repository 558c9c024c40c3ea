//! Tunnel configuration: defaults, parsing, and validation.
//!
//! Validation is pure and runs before any side effect; a config that makes
//! it through [`TunnelConfig::try_from`] is safe to hand to the device and
//! routing layers.

use std::{fmt, net::IpAddr, str::FromStr};

use base64::Engine as _;
use clients::warden::v1::TunnelConfigWire;
use derive_more::Debug;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::Error;

pub const DEFAULT_MTU: u32 = 1420;
pub const DEFAULT_LISTEN_PORT: u16 = 51820;
pub const DEFAULT_INTERFACE_NAME: &str = "wg0";
pub const DEFAULT_ALLOWED_IP: &str = "0.0.0.0/0";
pub const DEFAULT_PERSISTENT_KEEPALIVE: u32 = 25;

pub const MTU_MIN: u32 = 68;
pub const MTU_MAX: u32 = 65535;

/// An address with a prefix length, e.g. `10.8.0.2/24`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[debug("{}/{}", addr, prefix)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("{s:?} is not CIDR notation"))?;
        let addr = addr
            .parse::<IpAddr>()
            .map_err(|err| format!("bad address in {s:?}: {err}"))?;
        let prefix = prefix
            .parse::<u8>()
            .map_err(|err| format!("bad prefix in {s:?}: {err}"))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(format!("prefix /{prefix} out of range for {addr}"));
        }
        Ok(Self { addr, prefix })
    }
}

/// A peer endpoint as written in the config: `host:port`, with IPv6
/// addresses in brackets. The host may be a DNS name; resolution happens at
/// bring-up, not validation.
#[derive(Clone, PartialEq, Eq, Debug)]
#[debug("{}", self)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("{s:?} is not host:port"))?;
        let port = port
            .parse::<u16>()
            .map_err(|err| format!("bad port in {s:?}: {err}"))?;
        let host = if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            inner
                .parse::<IpAddr>()
                .map_err(|err| format!("bad IPv6 address in {s:?}: {err}"))?;
            inner.to_string()
        } else {
            if host.is_empty() || host.contains(':') {
                return Err(format!("{s:?} is not host:port"));
            }
            host.to_string()
        };
        Ok(Self { host, port })
    }
}

/// A validated tunnel configuration. Key material never appears in `Debug`
/// output.
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    pub local_ip: Cidr,
    pub peer_endpoint: Endpoint,
    #[debug("[redacted]")]
    pub peer_public_key: [u8; 32],
    #[debug("[redacted]")]
    pub private_key: [u8; 32],
    pub mtu: u32,
    pub listen_port: u16,
    pub interface_name: String,
    pub allowed_ips: Vec<Cidr>,
    pub persistent_keepalive: u32,
    pub route_all: bool,
}

impl TunnelConfig {
    /// The public key corresponding to the configured private key:
    /// X25519 of the private key with the curve base point.
    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&StaticSecret::from(self.private_key)).to_bytes()
    }

    /// Decode and validate a base64-encoded JSON wire config, the shape the
    /// HTTP endpoint and `BL_NETWORKING_CONFIG` both carry.
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let invalid =
            |detail: String| Error::invalid_argument(format!("invalid tunnel config: {detail}"));
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|err| invalid(format!("not valid base64: {err}")))?;
        let wire: TunnelConfigWire = serde_json::from_slice(&bytes)
            .map_err(|err| invalid(format!("not a valid JSON config: {err}")))?;
        Self::try_from(wire)
    }
}

impl TryFrom<TunnelConfigWire> for TunnelConfig {
    type Error = Error;

    fn try_from(wire: TunnelConfigWire) -> Result<Self, Self::Error> {
        let invalid = |detail: String| Error::invalid_argument(format!("invalid tunnel config: {detail}"));

        let local_ip = wire
            .local_ip
            .parse::<Cidr>()
            .map_err(|err| invalid(format!("local_ip: {err}")))?;
        let peer_endpoint = wire
            .peer_endpoint
            .parse::<Endpoint>()
            .map_err(|err| invalid(format!("peer_endpoint: {err}")))?;
        let peer_public_key = decode_key(&wire.peer_public_key)
            .map_err(|err| invalid(format!("peer_public_key: {err}")))?;
        let private_key = decode_key(&wire.private_key)
            .map_err(|err| invalid(format!("private_key: {err}")))?;

        let mtu = wire.mtu.unwrap_or(DEFAULT_MTU);
        if !(MTU_MIN..=MTU_MAX).contains(&mtu) {
            return Err(invalid(format!("mtu {mtu} outside [{MTU_MIN}, {MTU_MAX}]")));
        }

        let allowed_ips = wire
            .allowed_ips
            .unwrap_or_else(|| vec![DEFAULT_ALLOWED_IP.to_string()])
            .iter()
            .map(|cidr| {
                cidr.parse::<Cidr>()
                    .map_err(|err| invalid(format!("allowed_ips: {err}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            local_ip,
            peer_endpoint,
            peer_public_key,
            private_key,
            mtu,
            listen_port: wire.listen_port.unwrap_or(DEFAULT_LISTEN_PORT),
            interface_name: wire
                .interface_name
                .unwrap_or_else(|| DEFAULT_INTERFACE_NAME.to_string()),
            allowed_ips,
            persistent_keepalive: wire
                .persistent_keepalive
                .unwrap_or(DEFAULT_PERSISTENT_KEEPALIVE),
            route_all: wire.route_all,
        })
    }
}

fn decode_key(encoded: &str) -> Result<[u8; 32], String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|err| format!("not valid base64: {err}"))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| format!("decodes to {} bytes, expected 32", bytes.len()))
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    use super::*;

    fn key_b64(byte: u8) -> String {
        base64::engine::general_purpose::STANDARD.encode([byte; 32])
    }

    fn minimal_wire() -> TunnelConfigWire {
        serde_json::from_value(serde_json::json!({
            "local_ip": "10.8.0.2/24",
            "peer_endpoint": "203.0.113.7:51820",
            "peer_public_key": key_b64(1),
            "private_key": key_b64(2),
        }))
        .expect("wire config")
    }

    #[test]
    fn defaults_are_applied() {
        let config = TunnelConfig::try_from(minimal_wire()).expect("valid config");
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(config.interface_name, DEFAULT_INTERFACE_NAME);
        assert_eq!(config.allowed_ips, vec!["0.0.0.0/0".parse().expect("cidr")]);
        assert_eq!(config.persistent_keepalive, DEFAULT_PERSISTENT_KEEPALIVE);
        assert!(!config.route_all);
    }

    #[test]
    fn bad_public_key_is_rejected_with_context() {
        let mut wire = minimal_wire();
        wire.peer_public_key = "not-a-valid-key".into();
        let err = TunnelConfig::try_from(wire).expect_err("invalid key");
        assert!(err.to_string().contains("invalid tunnel config"));
        assert!(err.to_string().contains("peer_public_key"));
    }

    #[test]
    fn short_key_is_rejected() {
        let mut wire = minimal_wire();
        wire.private_key = base64::engine::general_purpose::STANDARD.encode([0u8; 16]);
        let err = TunnelConfig::try_from(wire).expect_err("short key");
        assert!(err.to_string().contains("expected 32"));
    }

    #[test_case(67; "below minimum")]
    #[test_case(70000; "above maximum")]
    #[test]
    fn mtu_out_of_range_is_rejected(mtu: u32) {
        let mut wire = minimal_wire();
        wire.mtu = Some(mtu);
        assert!(TunnelConfig::try_from(wire).is_err());
    }

    #[test]
    fn bad_local_ip_is_rejected() {
        let mut wire = minimal_wire();
        wire.local_ip = "10.8.0.2".into();
        assert!(TunnelConfig::try_from(wire).is_err());
    }

    #[test]
    fn bad_allowed_ip_is_rejected() {
        let mut wire = minimal_wire();
        wire.allowed_ips = Some(vec!["0.0.0.0/0".into(), "bogus".into()]);
        assert!(TunnelConfig::try_from(wire).is_err());
    }

    #[test]
    fn ipv6_endpoint_is_accepted() {
        let mut wire = minimal_wire();
        wire.peer_endpoint = "[2001:db8::1]:51820".into();
        let config = TunnelConfig::try_from(wire).expect("valid config");
        assert_eq!(config.peer_endpoint.host, "2001:db8::1");
        assert_eq!(config.peer_endpoint.port, 51820);
        assert_eq!(config.peer_endpoint.to_string(), "[2001:db8::1]:51820");
    }

    #[test]
    fn bare_ipv6_endpoint_is_rejected() {
        let mut wire = minimal_wire();
        wire.peer_endpoint = "2001:db8::1".into();
        assert!(TunnelConfig::try_from(wire).is_err());
    }

    #[test]
    fn hostname_endpoint_is_accepted() {
        let mut wire = minimal_wire();
        wire.peer_endpoint = "vpn.example.com:51820".into();
        let config = TunnelConfig::try_from(wire).expect("valid config");
        assert_eq!(config.peer_endpoint.host, "vpn.example.com");
    }

    #[test]
    fn cidr_prefix_bounds_are_enforced() {
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("2001:db8::/129".parse::<Cidr>().is_err());
        assert!("2001:db8::/64".parse::<Cidr>().is_ok());
    }

    #[test]
    fn public_key_matches_x25519_of_base_point() {
        let config = TunnelConfig::try_from(minimal_wire()).expect("valid config");
        let expected = x25519_dalek::x25519(config.private_key, x25519_dalek::X25519_BASEPOINT_BYTES);
        assert_eq!(config.public_key(), expected);
    }

    #[test]
    fn debug_never_shows_key_material() {
        let config = TunnelConfig::try_from(minimal_wire()).expect("valid config");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains(&hex::encode(config.private_key)));
        assert!(rendered.contains("[redacted]"));
    }
}
