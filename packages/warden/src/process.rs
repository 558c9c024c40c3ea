//! Background process lifecycle management.
//!
//! The manager spawns children in their own process groups, captures their
//! output through [`logs::LogFanout`], and keeps finished entries around for
//! post-mortem inspection. Status only leaves `running` in one place: the
//! supervisor task, after the child has been reaped and both stream readers
//! have drained. That makes "status is terminal ⇒ buffers are final" a hard
//! guarantee rather than a usually-true one.

pub mod command;
pub mod logs;

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use clients::warden::v1::{ExecuteProcessRequest, ProcessResponse, ProcessStatus};
use dashmap::DashMap;
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use tokio::{io::AsyncReadExt, process::Command, sync::watch, task::JoinHandle};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{Error, Result},
    ports::PortTracker,
    process::logs::{LineAssembler, LogFanout, LogStream},
};

/// Bounded waits that would outlive a fronting proxy are capped here and
/// reported as "still running, poll me".
pub const PROXY_WAIT_CAP: Duration = Duration::from_secs(58);

/// Keep-alive processes are auto-killed after this long unless the request
/// sets its own timeout (0 disables the auto-kill).
pub const DEFAULT_KEEP_ALIVE_TIMEOUT_SECS: u64 = 600;

/// How often wait-for-ports re-samples the port tracker.
const PORT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How a termination request wants the exit recorded.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TerminateReason {
    Stopped,
    Killed,
}

struct ProcessState {
    status: ProcessStatus,
    exit_code: Option<i32>,
    completed_at: Option<jiff::Timestamp>,
    terminate_reason: Option<TerminateReason>,
}

/// A managed process. Entries survive process exit and are only discarded
/// with the manager itself.
pub struct ProcessEntry {
    pub id: String,
    pub name: Option<String>,
    pub command: String,
    pub working_dir: PathBuf,
    pub pid: u32,
    pub started_at: jiff::Timestamp,
    keep_alive: AtomicBool,
    state: Mutex<ProcessState>,
    status_tx: watch::Sender<ProcessStatus>,
    fanout: LogFanout,
}

impl ProcessEntry {
    pub fn status(&self) -> ProcessStatus {
        self.state.lock().expect("process state poisoned").status
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::Relaxed)
    }

    /// Clear or set the keep-alive flag. Clearing never terminates the
    /// process; it only removes its contribution to the awake state.
    pub fn set_keep_alive(&self, keep_alive: bool) {
        self.keep_alive.store(keep_alive, Ordering::Relaxed);
    }

    /// Captured (stdout, stderr, combined) output.
    pub fn logs(&self) -> (String, String, String) {
        self.fanout.contents()
    }

    /// Attach a log sink: the current output snapshot is delivered first,
    /// then live lines. Returns `(detach id, receiver)`; the id is `None`
    /// when the process has already finished.
    pub fn attach_log_sink(&self) -> (Option<u64>, flume::Receiver<String>) {
        self.fanout.attach()
    }

    pub fn detach_log_sink(&self, id: u64) {
        self.fanout.detach(id);
    }

    pub fn to_response(&self, poll_required: bool) -> ProcessResponse {
        let state = self.state.lock().expect("process state poisoned");
        ProcessResponse {
            id: self.id.clone(),
            pid: self.pid,
            name: self.name.clone(),
            command: self.command.clone(),
            working_dir: self.working_dir.display().to_string(),
            status: state.status,
            exit_code: state.exit_code,
            started_at: self.started_at,
            completed_at: state.completed_at,
            keep_alive: self.is_keep_alive(),
            poll_required,
        }
    }
}

/// Everything needed to (re)spawn one process.
#[derive(Clone, Debug)]
pub struct ExecuteSpec {
    pub command: String,
    pub working_dir: Option<PathBuf>,
    pub name: Option<String>,
    pub env: HashMap<String, String>,
    pub restart_on_failure: bool,
    pub max_restarts: u32,
    pub keep_alive: bool,
    pub timeout: Option<u64>,
}

impl From<&ExecuteProcessRequest> for ExecuteSpec {
    fn from(request: &ExecuteProcessRequest) -> Self {
        Self {
            command: request.command.clone(),
            working_dir: request.working_dir.clone().map(PathBuf::from),
            name: request.name.clone(),
            env: request.env.clone(),
            restart_on_failure: request.restart_on_failure,
            max_restarts: request.max_restarts.unwrap_or(0),
            keep_alive: request.keep_alive,
            timeout: request.timeout,
        }
    }
}

struct ProcessManagerInner {
    table: DashMap<String, Arc<ProcessEntry>>,
    ports: PortTracker,
}

/// Spawns, observes, and signals child processes.
///
/// ## Cloning
///
/// Cheaply cloneable; clones share the process table.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<ProcessManagerInner>,
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("processes", &self.inner.table.len())
            .finish()
    }
}

impl ProcessManager {
    pub fn new(ports: PortTracker) -> Self {
        Self {
            inner: Arc::new(ProcessManagerInner {
                table: DashMap::new(),
                ports,
            }),
        }
    }

    /// Start a child process and return its entry. Waiting (for completion
    /// or ports) is the caller's concern: see [`Self::wait_for_exit`] and
    /// [`Self::wait_for_ports`].
    #[instrument(skip(self, spec), fields(command = %spec.command))]
    pub fn execute(&self, spec: ExecuteSpec) -> Result<Arc<ProcessEntry>> {
        let remaining_restarts = if spec.restart_on_failure {
            spec.max_restarts
        } else {
            0
        };
        self.spawn(spec, remaining_restarts)
    }

    fn spawn(&self, spec: ExecuteSpec, remaining_restarts: u32) -> Result<Arc<ProcessEntry>> {
        let argv = command::prepare(&spec.command)?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .envs(&spec.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            // Own process group so stop/kill can signal the whole tree.
            .process_group(0);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| Error::resource(format!("failed to spawn `{}`: {err}", spec.command)))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::resource("spawned process has no pid"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::resource("child stdout pipe missing"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::resource("child stderr pipe missing"))?;

        let (status_tx, _) = watch::channel(ProcessStatus::Running);
        let entry = Arc::new(ProcessEntry {
            id: uuid::Uuid::new_v4().to_string(),
            name: spec.name.clone(),
            command: spec.command.clone(),
            working_dir: spec
                .working_dir
                .clone()
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))),
            pid,
            started_at: jiff::Timestamp::now(),
            keep_alive: AtomicBool::new(spec.keep_alive),
            state: Mutex::new(ProcessState {
                status: ProcessStatus::Running,
                exit_code: None,
                completed_at: None,
                terminate_reason: None,
            }),
            status_tx,
            fanout: LogFanout::default(),
        });
        self.inner.table.insert(entry.id.clone(), Arc::clone(&entry));
        info!(id = %entry.id, pid, command = %spec.command, "process.execute.spawned");

        let readers = [
            spawn_reader(Arc::clone(&entry), LogStream::Stdout, stdout),
            spawn_reader(Arc::clone(&entry), LogStream::Stderr, stderr),
        ];
        tokio::spawn(supervise(
            self.clone(),
            Arc::clone(&entry),
            child,
            readers,
            spec.clone(),
            remaining_restarts,
        ));

        if spec.keep_alive {
            let timeout_secs = spec.timeout.unwrap_or(DEFAULT_KEEP_ALIVE_TIMEOUT_SECS);
            if timeout_secs > 0 {
                tokio::spawn(keep_alive_reaper(
                    Arc::clone(&entry),
                    Duration::from_secs(timeout_secs),
                ));
            }
        }

        Ok(entry)
    }

    /// Snapshot of all known processes, newest first.
    pub fn list(&self) -> Vec<Arc<ProcessEntry>> {
        let mut entries = self
            .inner
            .table
            .iter()
            .map(|kv| Arc::clone(kv.value()))
            .collect::<Vec<_>>();
        entries.sort_by_key(|entry| std::cmp::Reverse(entry.started_at));
        entries
    }

    /// Running processes currently holding the keep-alive flag.
    pub fn keep_alive_processes(&self) -> Vec<Arc<ProcessEntry>> {
        self.list()
            .into_iter()
            .filter(|entry| entry.is_keep_alive() && entry.status() == ProcessStatus::Running)
            .collect()
    }

    /// Resolve an identifier: exact id, then numeric pid, then name (most
    /// recently started wins).
    pub fn get(&self, identifier: &str) -> Result<Arc<ProcessEntry>> {
        if let Some(entry) = self.inner.table.get(identifier) {
            return Ok(Arc::clone(entry.value()));
        }
        if let Ok(pid) = identifier.parse::<u32>() {
            if let Some(entry) = self.list().into_iter().find(|entry| entry.pid == pid) {
                return Ok(entry);
            }
        }
        self.list()
            .into_iter()
            .find(|entry| entry.name.as_deref() == Some(identifier))
            .ok_or_else(|| Error::not_found(format!("no process with identifier {identifier}")))
    }

    /// SIGTERM the process group (falling back to the process). No-op when
    /// the process has already terminated.
    #[instrument(skip(self))]
    pub fn stop(&self, identifier: &str) -> Result<Arc<ProcessEntry>> {
        let entry = self.get(identifier)?;
        signal_entry(&entry, Signal::SIGTERM, TerminateReason::Stopped);
        Ok(entry)
    }

    /// SIGKILL variant of [`Self::stop`].
    #[instrument(skip(self))]
    pub fn kill(&self, identifier: &str) -> Result<Arc<ProcessEntry>> {
        let entry = self.get(identifier)?;
        signal_entry(&entry, Signal::SIGKILL, TerminateReason::Killed);
        Ok(entry)
    }

    /// Wait until the process leaves `running` or the timeout elapses.
    /// Returns true when the process exited within the bound.
    pub async fn wait_for_exit(&self, entry: &ProcessEntry, timeout: Duration) -> bool {
        let mut rx = entry.status_tx.subscribe();
        if rx.borrow().is_terminal() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while rx.changed().await.is_ok() {
                if rx.borrow().is_terminal() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }

    /// Wait until every requested port is open somewhere in the process's
    /// subtree, subject to the timeout.
    pub async fn wait_for_ports(
        &self,
        entry: &ProcessEntry,
        ports: &[u16],
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let open = self.inner.ports.open_ports(entry.pid).await?;
            if ports.iter().all(|port| open.contains(port)) {
                return Ok(());
            }
            if entry.status().is_terminal() {
                return Err(Error::invalid_state(format!(
                    "process {} exited before opening ports {ports:?}",
                    entry.id
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::timeout(format!(
                    "ports {ports:?} not open within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(PORT_WAIT_POLL_INTERVAL).await;
        }
    }

    /// Best-effort snapshot of the process table, for the pre-shutdown dump.
    pub fn snapshot(&self) -> Vec<ProcessResponse> {
        self.list()
            .iter()
            .map(|entry| entry.to_response(false))
            .collect()
    }
}

/// Cap a requested wait to what a fronting proxy will sit through.
pub fn effective_wait(requested_secs: Option<u64>) -> Duration {
    match requested_secs {
        Some(secs) => Duration::from_secs(secs).min(PROXY_WAIT_CAP),
        None => PROXY_WAIT_CAP,
    }
}

fn signal_entry(entry: &ProcessEntry, signal: Signal, reason: TerminateReason) {
    {
        let mut state = entry.state.lock().expect("process state poisoned");
        if state.status.is_terminal() {
            // Already terminated: stop/kill are idempotent.
            return;
        }
        match (state.terminate_reason, reason) {
            (None, _) | (Some(TerminateReason::Stopped), TerminateReason::Killed) => {
                state.terminate_reason = Some(reason);
            }
            _ => {}
        }
    }

    let pid = entry.pid as i32;
    // Group signal first; fall back to the process itself. A process that is
    // already gone is not an error.
    let group = kill(Pid::from_raw(-pid), signal);
    if let Err(err) = group {
        if err != Errno::ESRCH {
            debug!(pid, %signal, ?err, "process.signal.group_failed");
            if let Err(err) = kill(Pid::from_raw(pid), signal) {
                if err != Errno::ESRCH {
                    warn!(pid, %signal, ?err, "process.signal.failed");
                }
            }
        }
    }
}

fn spawn_reader(
    entry: Arc<ProcessEntry>,
    stream: LogStream,
    mut source: impl tokio::io::AsyncRead + Unpin + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut assembler = LineAssembler::default();
        let mut buf = [0u8; 4096];
        loop {
            match source.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => entry.fanout.ingest(stream, &buf[..n], &mut assembler),
            }
        }
        entry.fanout.flush_stream(stream, &mut assembler);
    })
}

/// Reap the child, drain its readers, flip the status exactly once, and run
/// the restart policy.
async fn supervise(
    manager: ProcessManager,
    entry: Arc<ProcessEntry>,
    mut child: tokio::process::Child,
    readers: [JoinHandle<()>; 2],
    spec: ExecuteSpec,
    remaining_restarts: u32,
) {
    let wait = child.wait().await;
    // Reap promptly: dropping the child releases its pidfd and pipes.
    drop(child);
    for reader in readers {
        let _ = reader.await;
    }

    let exit_code = match wait {
        Ok(status) => status.code().unwrap_or(-1),
        Err(err) => {
            warn!(id = %entry.id, ?err, "process.wait.failed");
            -1
        }
    };

    let final_status = {
        let mut state = entry.state.lock().expect("process state poisoned");
        let status = match state.terminate_reason {
            Some(TerminateReason::Stopped) => ProcessStatus::Stopped,
            Some(TerminateReason::Killed) => ProcessStatus::Killed,
            None if exit_code == 0 => ProcessStatus::Completed,
            None => ProcessStatus::Failed,
        };
        state.status = status;
        state.exit_code = Some(exit_code);
        state.completed_at = Some(jiff::Timestamp::now());
        status
    };
    entry.fanout.finalize();
    entry.status_tx.send_replace(final_status);
    info!(id = %entry.id, pid = entry.pid, %final_status, exit_code, "process.exited");

    if final_status == ProcessStatus::Failed && spec.restart_on_failure && remaining_restarts > 0 {
        info!(
            id = %entry.id,
            remaining = remaining_restarts - 1,
            "process.restart_on_failure"
        );
        if let Err(err) = manager.spawn(spec, remaining_restarts - 1) {
            warn!(?err, "process.restart.failed");
        }
    }
}

/// Kill a keep-alive process that outlives its timeout. Clearing the flag
/// before the timer fires cancels the kill.
async fn keep_alive_reaper(entry: Arc<ProcessEntry>, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if entry.status() == ProcessStatus::Running && entry.is_keep_alive() {
        info!(id = %entry.id, "process.keep_alive.timeout");
        signal_entry(&entry, Signal::SIGKILL, TerminateReason::Killed);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn effective_wait_caps_long_requests() {
        assert_eq!(effective_wait(Some(120)), PROXY_WAIT_CAP);
        assert_eq!(effective_wait(None), PROXY_WAIT_CAP);
        assert_eq!(effective_wait(Some(5)), Duration::from_secs(5));
    }
}
