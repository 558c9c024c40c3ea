//! The userspace WireGuard device's configuration IPC grammar.
//!
//! A `set=1` request is key=value lines terminated by a blank line; keys are
//! transmitted as hex (not base64). The device answers with attribute lines
//! ending in `errno=<n>` and a blank line.

use std::net::SocketAddr;

use crate::tunnel::config::TunnelConfig;

/// Render the `set=1` request that configures a fresh device from `config`.
/// The peer endpoint must already be resolved to a socket address.
pub fn set_request(config: &TunnelConfig, endpoint: SocketAddr) -> String {
    let mut request = String::from("set=1\n");
    request.push_str(&format!("private_key={}\n", hex::encode(config.private_key)));
    request.push_str(&format!("listen_port={}\n", config.listen_port));
    request.push_str(&format!(
        "public_key={}\n",
        hex::encode(config.peer_public_key)
    ));
    request.push_str(&format!("endpoint={endpoint}\n"));
    for allowed_ip in &config.allowed_ips {
        request.push_str(&format!("allowed_ip={allowed_ip}\n"));
    }
    if config.persistent_keepalive > 0 {
        request.push_str(&format!(
            "persistent_keepalive_interval={}\n",
            config.persistent_keepalive
        ));
    }
    request.push('\n');
    request
}

/// Extract the `errno` attribute from a device response.
pub fn response_errno(response: &str) -> Option<i32> {
    response
        .lines()
        .find_map(|line| line.strip_prefix("errno="))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;
    use clients::warden::v1::TunnelConfigWire;
    use pretty_assertions::assert_eq;

    use super::*;

    fn config(keepalive: u32, allowed: &[&str]) -> TunnelConfig {
        let key = |byte: u8| base64::engine::general_purpose::STANDARD.encode([byte; 32]);
        let wire: TunnelConfigWire = serde_json::from_value(serde_json::json!({
            "local_ip": "10.8.0.2/24",
            "peer_endpoint": "203.0.113.7:51820",
            "peer_public_key": key(0xAB),
            "private_key": key(0xCD),
            "listen_port": 51821,
            "allowed_ips": allowed,
            "persistent_keepalive": keepalive,
        }))
        .expect("wire config");
        TunnelConfig::try_from(wire).expect("valid config")
    }

    #[test]
    fn renders_the_full_grammar() {
        let config = config(25, &["0.0.0.0/0", "10.9.0.0/16"]);
        let request = set_request(&config, "203.0.113.7:51820".parse().expect("addr"));
        let expected = format!(
            "set=1\n\
             private_key={}\n\
             listen_port=51821\n\
             public_key={}\n\
             endpoint=203.0.113.7:51820\n\
             allowed_ip=0.0.0.0/0\n\
             allowed_ip=10.9.0.0/16\n\
             persistent_keepalive_interval=25\n\n",
            hex::encode([0xCD; 32]),
            hex::encode([0xAB; 32]),
        );
        assert_eq!(request, expected);
    }

    #[test]
    fn zero_keepalive_omits_the_attribute() {
        let config = config(0, &["0.0.0.0/0"]);
        let request = set_request(&config, "203.0.113.7:51820".parse().expect("addr"));
        assert!(!request.contains("persistent_keepalive_interval"));
    }

    #[test]
    fn errno_is_parsed_from_responses() {
        assert_eq!(response_errno("errno=0\n\n"), Some(0));
        assert_eq!(response_errno("listen_port=51820\nerrno=7\n\n"), Some(7));
        assert_eq!(response_errno("garbage"), None);
    }
}
