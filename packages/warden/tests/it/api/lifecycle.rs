//! Lifecycle state derivation and scheduled-stop tests.

use std::time::Duration;

use clients::warden::v1::{ExecuteProcessRequest, ProcessStatus, SandboxState};
use color_eyre::Result;
use pretty_assertions::assert_eq;

use crate::helpers::{TestFixture, eventually};

#[test_log::test(tokio::test)]
async fn state_is_auto_without_keep_alive() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let status = fixture.client.status().await?;
    assert_eq!(status.state, SandboxState::Auto);
    assert!(status.keep_alive_processes.is_empty());
    assert_eq!(status.scheduled_stop_at, None);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn keep_alive_process_holds_the_sandbox_awake() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let mut request = ExecuteProcessRequest::new("sleep 30");
    request.keep_alive = true;
    request.timeout = Some(0);
    let process = fixture.client.execute(&request).await?;

    let status = fixture.client.status().await?;
    assert_eq!(status.state, SandboxState::Awake);
    assert!(status.keep_alive_processes.contains(&process.id));

    // Stop clears the awake contribution but leaves the process running.
    fixture.client.stop(None).await?;
    let status = fixture.client.status().await?;
    assert_eq!(status.state, SandboxState::Auto);
    let process = fixture.client.process(&process.id).await?;
    assert_eq!(process.status, ProcessStatus::Running);

    fixture.client.kill_process(&process.id).await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn deferred_stop_fires_and_is_reported() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let mut request = ExecuteProcessRequest::new("sleep 30");
    request.keep_alive = true;
    request.timeout = Some(0);
    let process = fixture.client.execute(&request).await?;

    fixture.client.stop(Some(1)).await?;
    let status = fixture.client.status().await?;
    assert_eq!(status.state, SandboxState::Awake);
    assert!(status.scheduled_stop_at.is_some());

    let client = fixture.client.clone();
    let cleared = eventually(Duration::from_secs(5), move || {
        let client = client.clone();
        async move {
            client
                .status()
                .await
                .map(|status| status.state == SandboxState::Auto)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(cleared, "scheduled stop did not fire");

    fixture.client.kill_process(&process.id).await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn fresh_stop_cancels_a_scheduled_one() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let mut request = ExecuteProcessRequest::new("sleep 30");
    request.keep_alive = true;
    request.timeout = Some(0);
    let process = fixture.client.execute(&request).await?;

    fixture.client.stop(Some(600)).await?;
    assert!(fixture.client.status().await?.scheduled_stop_at.is_some());

    // An immediate stop supersedes the scheduled one entirely.
    fixture.client.stop(None).await?;
    let status = fixture.client.status().await?;
    assert_eq!(status.state, SandboxState::Auto);
    assert_eq!(status.scheduled_stop_at, None);

    fixture.client.kill_process(&process.id).await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn keep_alive_timeout_kills_the_process() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let mut request = ExecuteProcessRequest::new("sleep 30");
    request.keep_alive = true;
    request.timeout = Some(1);
    let process = fixture.client.execute(&request).await?;

    assert!(
        fixture
            .wait_for_status(&process.id, ProcessStatus::Killed, Duration::from_secs(10))
            .await,
        "keep-alive process outlived its timeout"
    );
    Ok(())
}
