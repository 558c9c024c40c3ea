//! Port tracking and tunnel endpoint tests.
//!
//! Tunnel tests stop at validation: actually creating a TUN device needs
//! privileges the test environment doesn't have, and the validation layer is
//! required to fail before any side effect.

use base64::Engine as _;
use color_eyre::Result;
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::helpers::TestFixture;

fn valid_key() -> String {
    base64::engine::general_purpose::STANDARD.encode([7u8; 32])
}

#[test_log::test(tokio::test)]
async fn ports_snapshot_sees_our_listener() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    // The test process is as good a subtree root as any child would be.
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();

    let snapshot = fixture.client.ports(std::process::id()).await?;
    assert!(
        snapshot.ports.contains(&port),
        "expected port {port} in {:?}",
        snapshot.ports
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn monitor_lifecycle() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let pid = std::process::id();

    fixture
        .client
        .monitor_ports(pid, "http://127.0.0.1:1/callback")
        .await?;
    // Replacing the callback is allowed.
    fixture
        .client
        .monitor_ports(pid, "http://127.0.0.1:1/other")
        .await?;
    fixture.client.unmonitor_ports(pid).await?;

    let response = fixture
        .http
        .delete(fixture.url(&format!("network/process/{pid}/monitor")))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn monitor_rejects_dead_pids() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let response = fixture
        .http
        .post(fixture.url("network/process/999999999/monitor"))
        .json(&json!({ "callback": "http://127.0.0.1:1/cb" }))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn invalid_tunnel_config_is_rejected_without_side_effects() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let config = json!({
        "local_ip": "10.8.0.2/24",
        "peer_endpoint": "203.0.113.7:51820",
        "peer_public_key": "not-a-valid-key",
        "private_key": valid_key(),
    });
    let encoded = base64::engine::general_purpose::STANDARD.encode(config.to_string());

    let response = fixture
        .http
        .put(fixture.url("network/tunnel/config"))
        .json(&json!({ "config": encoded }))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);

    let body: serde_json::Value = response.json().await?;
    let error = body["error"].as_str().expect("error body");
    assert!(error.starts_with("invalid tunnel config:"), "got: {error}");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn garbage_base64_tunnel_config_is_rejected() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let response = fixture
        .http
        .put(fixture.url("network/tunnel/config"))
        .json(&json!({ "config": "!!! not base64 !!!" }))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn disconnect_without_tunnel_is_bad_request() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let response = fixture
        .http
        .delete(fixture.url("network/tunnel"))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let body: serde_json::Value = response.json().await?;
    let error = body["error"].as_str().expect("error body");
    assert!(error.contains("no tunnel is running"), "got: {error}");
    Ok(())
}
