//! Process lifecycle, logs, and signal tests against a live server.

use std::{collections::HashMap, time::Duration};

use clients::warden::v1::{ExecuteProcessRequest, ProcessStatus};
use color_eyre::Result;
use futures::StreamExt;
use pretty_assertions::assert_eq;

use crate::helpers::{TestFixture, eventually};

#[test_log::test(tokio::test)]
async fn execute_waits_for_completion() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let mut request = ExecuteProcessRequest::new("echo hello");
    request.wait_for_completion = true;
    request.timeout = Some(10);
    let process = fixture.client.execute(&request).await?;

    assert_eq!(process.status, ProcessStatus::Completed);
    assert_eq!(process.exit_code, Some(0));
    assert!(!process.poll_required);
    assert!(process.completed_at.is_some());

    let logs = fixture.client.process_logs(&process.id).await?;
    assert!(logs.stdout.contains("hello"));
    assert_eq!(logs.stderr, "");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn shell_operators_route_through_sh() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let mut request = ExecuteProcessRequest::new("echo first && echo second");
    request.wait_for_completion = true;
    request.timeout = Some(10);
    let process = fixture.client.execute(&request).await?;

    assert_eq!(process.status, ProcessStatus::Completed);
    let logs = fixture.client.process_logs(&process.id).await?;
    assert!(logs.stdout.contains("first"));
    assert!(logs.stdout.contains("second"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn environment_overrides_reach_the_child() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let mut request = ExecuteProcessRequest::new("echo $GREETING");
    request.env = HashMap::from([("GREETING".to_string(), "salutations".to_string())]);
    request.wait_for_completion = true;
    request.timeout = Some(10);
    let process = fixture.client.execute(&request).await?;

    let logs = fixture.client.process_logs(&process.id).await?;
    assert!(logs.stdout.contains("salutations"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn capped_wait_reports_poll_required() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let mut request = ExecuteProcessRequest::new("sleep 3");
    request.wait_for_completion = true;
    request.timeout = Some(1);
    let process = fixture.client.execute(&request).await?;

    // The wait elapsed but the process is untouched.
    assert!(process.poll_required);
    assert_eq!(process.status, ProcessStatus::Running);

    assert!(
        fixture
            .wait_for_status(&process.id, ProcessStatus::Completed, Duration::from_secs(10))
            .await
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn name_resolves_to_most_recent_process() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let mut first = ExecuteProcessRequest::new("sleep 30");
    first.name = Some("svc".into());
    let first = fixture.client.execute(&first).await?;

    let mut second = ExecuteProcessRequest::new("sleep 30");
    second.name = Some("svc".into());
    let second = fixture.client.execute(&second).await?;

    let resolved = fixture.client.process("svc").await?;
    assert_eq!(resolved.id, second.id);

    // Pid resolution still works.
    let by_pid = fixture.client.process(&first.pid.to_string()).await?;
    assert_eq!(by_pid.id, first.id);

    fixture.client.kill_process(&first.id).await?;
    fixture.client.kill_process(&second.id).await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn stop_is_idempotent_and_final() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let process = fixture
        .client
        .execute(&ExecuteProcessRequest::new("sleep 30"))
        .await?;

    fixture.client.stop_process(&process.id).await?;
    assert!(
        fixture
            .wait_for_status(&process.id, ProcessStatus::Stopped, Duration::from_secs(10))
            .await
    );

    // Further stop and kill requests on a terminated process are no-ops.
    fixture.client.stop_process(&process.id).await?;
    fixture.client.kill_process(&process.id).await?;
    let after = fixture.client.process(&process.id).await?;
    assert_eq!(after.status, ProcessStatus::Stopped);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn logs_are_final_once_terminal() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let mut request = ExecuteProcessRequest::new("echo output && echo errors 1>&2");
    request.wait_for_completion = true;
    request.timeout = Some(10);
    let process = fixture.client.execute(&request).await?;
    assert!(process.status.is_terminal());

    let first = fixture.client.process_logs(&process.id).await?;
    let second = fixture.client.process_logs(&process.id).await?;
    assert_eq!(first.logs, second.logs);
    assert!(first.stdout.contains("output"));
    assert!(first.stderr.contains("errors"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn failed_process_restarts_with_the_same_name() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let mut request = ExecuteProcessRequest::new("false");
    request.name = Some("flaky".into());
    request.restart_on_failure = true;
    request.max_restarts = Some(2);
    fixture.client.execute(&request).await?;

    // Initial run plus two restarts, all failed, all named the same.
    let client = fixture.client.clone();
    let settled = eventually(Duration::from_secs(10), move || {
        let client = client.clone();
        async move {
            let Ok(processes) = client.processes().await else {
                return false;
            };
            let flaky = processes
                .iter()
                .filter(|p| p.name.as_deref() == Some("flaky"))
                .collect::<Vec<_>>();
            flaky.len() == 3 && flaky.iter().all(|p| p.status == ProcessStatus::Failed)
        }
    })
    .await;
    assert!(settled, "expected 3 failed runs of the flaky process");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn log_stream_delivers_prefixed_lines() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let mut request = ExecuteProcessRequest::new("echo one; sleep 0.2; echo two; sleep 30");
    request.name = Some("streamer".into());
    let process = fixture.client.execute(&request).await?;

    let stream = fixture.client.stream_process_logs(&process.id).await?;
    let lines = tokio::time::timeout(
        Duration::from_secs(10),
        stream.take(2).collect::<Vec<_>>(),
    )
    .await
    .expect("stream produced two lines");
    let lines = lines.into_iter().collect::<Result<Vec<_>>>()?;
    assert_eq!(lines, vec!["stdout:one", "stdout:two"]);

    fixture.client.kill_process(&process.id).await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn empty_command_is_rejected() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    // Malformed input, detected before anything is spawned.
    let response = fixture
        .http
        .post(fixture.url("process"))
        .json(&ExecuteProcessRequest::new(""))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn unknown_identifier_is_not_found() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let response = fixture
        .http
        .get(fixture.url("process/no-such-process"))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}
