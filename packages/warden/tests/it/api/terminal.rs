//! Terminal session behavior, driven at the manager level.
//!
//! These exercise the real PTY path (shell spawn, reader loop, replay,
//! session-wide teardown) without a WebSocket in the way; the frame schema
//! itself is covered by unit tests in the clients crate.

use std::time::Duration;

use color_eyre::Result;
use warden::terminal::session::SessionOptions;

use crate::helpers::{TestFixture, eventually};

fn options() -> SessionOptions {
    SessionOptions {
        shell: Some("/bin/sh".into()),
        working_dir: None,
        env: Vec::new(),
        cols: 80,
        rows: 24,
    }
}

/// Drain a subscriber channel until the accumulated output contains the
/// needle or the deadline passes.
async fn await_output(
    rx: &flume::Receiver<Vec<u8>>,
    needle: &str,
    deadline: Duration,
) -> Result<String, String> {
    let mut seen = String::new();
    let give_up = tokio::time::Instant::now() + deadline;
    loop {
        let remaining = give_up
            .checked_duration_since(tokio::time::Instant::now())
            .ok_or_else(|| format!("timed out waiting for {needle:?}; saw {seen:?}"))?;
        match tokio::time::timeout(remaining, rx.recv_async()).await {
            Ok(Ok(chunk)) => {
                seen.push_str(&String::from_utf8_lossy(&chunk));
                if seen.contains(needle) {
                    return Ok(seen);
                }
            }
            Ok(Err(_)) => return Err(format!("channel closed; saw {seen:?}")),
            Err(_) => return Err(format!("timed out waiting for {needle:?}; saw {seen:?}")),
        }
    }
}

#[test_log::test(tokio::test)]
async fn echo_round_trip() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let terminals = &fixture.managers.terminals;

    let session = terminals.get_or_create("echo-test", &options())?;
    let (subscriber, _snapshot, output) = session.subscribe();

    session.write(b"echo terminal-works\n")?;
    let seen = await_output(&output, "terminal-works", Duration::from_secs(10))
        .await
        .expect("echoed output");
    assert!(seen.contains("terminal-works"));

    session.unsubscribe(subscriber);
    terminals.close("echo-test")?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn reconnect_replays_reset_prefixed_buffer() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let terminals = &fixture.managers.terminals;

    let session = terminals.get_or_create("replay-test", &options())?;
    let (subscriber, _snapshot, output) = session.subscribe();
    session.write(b"echo before-disconnect\n")?;
    await_output(&output, "before-disconnect", Duration::from_secs(10))
        .await
        .expect("echoed output");
    session.unsubscribe(subscriber);

    // Reconnect: same id hands back the same live session, and the replay
    // snapshot leads with a formatting reset.
    let reattached = terminals.get_or_create("replay-test", &options())?;
    assert_eq!(session.id, reattached.id);
    assert_eq!(session.shell_pid, reattached.shell_pid);

    let (subscriber, snapshot, _output) = reattached.subscribe();
    assert!(snapshot.starts_with(b"\x1b[0m"));
    assert!(
        String::from_utf8_lossy(&snapshot).contains("before-disconnect"),
        "replay missing prior output"
    );
    reattached.unsubscribe(subscriber);
    terminals.close("replay-test")?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn working_dir_is_honored() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let terminals = &fixture.managers.terminals;
    let workdir = tempfile::tempdir()?;

    let mut options = options();
    options.working_dir = Some(workdir.path().display().to_string());
    let session = terminals.get_or_create("cwd-test", &options)?;
    let (_subscriber, _snapshot, output) = session.subscribe();

    session.write(b"pwd\n")?;
    let expected = workdir.path().display().to_string();
    await_output(&output, &expected, Duration::from_secs(10))
        .await
        .expect("shell reports its working directory");

    terminals.close("cwd-test")?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn shell_exit_marks_the_session_dead() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let terminals = &fixture.managers.terminals;

    let session = terminals.get_or_create("exit-test", &options())?;
    session.write(b"exit\n")?;

    let done = session.done();
    tokio::time::timeout(Duration::from_secs(10), done.cancelled())
        .await
        .expect("session died after shell exit");
    assert!(session.is_dead());

    // A dead session refuses writes...
    assert!(session.write(b"echo nope\n").is_err());

    // ...and a reconnect under the same id creates a fresh session.
    let fresh = terminals.get_or_create("exit-test", &options())?;
    assert_ne!(session.shell_pid, fresh.shell_pid);
    terminals.close("exit-test")?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn close_kills_background_jobs_in_the_session() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let terminals = &fixture.managers.terminals;

    let session = terminals.get_or_create("close-test", &options())?;
    let (_subscriber, _snapshot, output) = session.subscribe();
    // A background sleep survives a plain process-group kill; the
    // session-wide close must get it too.
    session.write(b"sleep 300 &\necho started\n")?;
    await_output(&output, "started", Duration::from_secs(10))
        .await
        .expect("background job started");

    let shell_pid = session.shell_pid;
    terminals.close("close-test")?;
    assert!(session.is_dead());

    // Every process in the shell's session is gone (the sleep included).
    let gone = eventually(Duration::from_secs(10), move || async move {
        !std::path::Path::new(&format!("/proc/{shell_pid}")).exists()
    })
    .await;
    assert!(gone, "shell survived close");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn slow_subscribers_lose_data_but_never_block() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let terminals = &fixture.managers.terminals;

    let session = terminals.get_or_create("slow-test", &options())?;
    // Never drained: fills up and starts dropping.
    let (_slow, _snapshot, _slow_rx) = session.subscribe();
    let (fast, _snapshot, output) = session.subscribe();

    session.write(b"seq 1 2000\n")?;
    // The fast subscriber still sees the tail of the output.
    await_output(&output, "2000", Duration::from_secs(15))
        .await
        .expect("fast subscriber starved by slow one");

    session.unsubscribe(fast);
    terminals.close("slow-test")?;
    Ok(())
}
