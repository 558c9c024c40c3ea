//! A PTY-backed shell session that survives client disconnects.
//!
//! The session outlives any WebSocket: output accumulates in a bounded ring
//! buffer, subscribers come and go, and the session only dies when the shell
//! itself does (or the reaper collects it). The reader loop and the
//! subscribe path take the buffer lock and then the subscriber lock, in that
//! order; this keeps reconnect replay exactly-once without risking the
//! deadlock that ad-hoc nesting would.

use std::{
    io::{Read, Write},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use atomic_time::AtomicInstant;
use portable_pty::{Child as _, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    terminal::buffer::{BUFFER_CAPACITY, OutputRing},
};

/// Capacity of each subscriber's output channel; chunks for a full channel
/// are dropped rather than buffered.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

/// Replay starts with a formatting reset, since trimming may have pruned the
/// escape sequence that set the current style.
pub const REPLAY_RESET: &[u8] = b"\x1b[0m";

struct SessionState {
    buffer: OutputRing,
    /// Once set the buffer is final; the shell is gone.
    dead: bool,
}

struct Subscriber {
    id: u64,
    tx: flume::Sender<Vec<u8>>,
}

/// Options for creating a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub shell: Option<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

pub struct TerminalSession {
    pub id: String,
    pub shell_pid: u32,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    state: Mutex<SessionState>,
    subscribers: Mutex<Vec<Subscriber>>,
    last_activity: AtomicInstant,
    next_subscriber_id: AtomicU64,
    done: CancellationToken,
}

impl TerminalSession {
    /// Open a PTY, start the shell as a session leader on its slave side,
    /// and spawn the reader and shell-exit watcher.
    pub fn start(id: String, shell: String, options: &SessionOptions) -> Result<Arc<Self>> {
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| Error::resource(format!("open pty: {err}")))?;

        let mut cmd = CommandBuilder::new(&shell);
        if let Some(dir) = &options.working_dir {
            cmd.cwd(dir);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        let has_term = options.env.iter().any(|(key, _)| key == "TERM")
            || std::env::var_os("TERM").is_some();
        if !has_term {
            cmd.env("TERM", "xterm-256color");
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| Error::resource(format!("spawn shell {shell}: {err}")))?;
        // The slave fd stays open in the child; ours would only keep the PTY
        // alive past the shell's exit.
        drop(pair.slave);

        let shell_pid = child
            .process_id()
            .ok_or_else(|| Error::resource("shell has no pid"))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| Error::resource(format!("clone pty reader: {err}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| Error::resource(format!("take pty writer: {err}")))?;
        let killer = child.clone_killer();

        let session = Arc::new(Self {
            id: id.clone(),
            shell_pid,
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            state: Mutex::new(SessionState {
                buffer: OutputRing::new(BUFFER_CAPACITY),
                dead: false,
            }),
            subscribers: Mutex::new(Vec::new()),
            last_activity: AtomicInstant::now(),
            next_subscriber_id: AtomicU64::new(1),
            done: CancellationToken::new(),
        });
        info!(id = %session.id, shell = %shell, pid = shell_pid, "terminal.session.started");

        let read_session = Arc::clone(&session);
        tokio::task::spawn_blocking(move || read_loop(read_session, reader));

        let watch_session = Arc::clone(&session);
        tokio::task::spawn_blocking(move || {
            // The shell exiting kills the session even if descendants still
            // hold the slave fd open.
            match child.wait() {
                Ok(status) => {
                    info!(id = %watch_session.id, ?status, "terminal.shell.exited")
                }
                Err(err) => warn!(id = %watch_session.id, ?err, "terminal.shell.wait_failed"),
            }
            watch_session.mark_dead();
        });

        Ok(session)
    }

    pub fn is_dead(&self) -> bool {
        self.state.lock().expect("terminal state poisoned").dead
    }

    /// Signal fired when the session dies.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.load(Ordering::Relaxed).elapsed()
    }

    fn touch(&self) {
        self.last_activity
            .store(std::time::Instant::now(), Ordering::Relaxed);
    }

    /// Attach an output subscriber. Returns the subscriber id, the replay
    /// snapshot (reset-prefixed buffer contents), and the live channel. The
    /// snapshot and the channel together form a contiguous, duplicate-free
    /// view of the session's output.
    pub fn subscribe(&self) -> (u64, Vec<u8>, flume::Receiver<Vec<u8>>) {
        let state = self.state.lock().expect("terminal state poisoned");
        let mut snapshot = Vec::with_capacity(REPLAY_RESET.len() + state.buffer.len());
        snapshot.extend_from_slice(REPLAY_RESET);
        snapshot.extend_from_slice(state.buffer.contents());

        let (tx, rx) = flume::bounded(SUBSCRIBER_CHANNEL_CAPACITY);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("terminal subscribers poisoned")
            .push(Subscriber { id, tx });
        drop(state);
        (id, snapshot, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("terminal subscribers poisoned")
            .retain(|subscriber| subscriber.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("terminal subscribers poisoned")
            .len()
    }

    /// Forward input bytes to the PTY.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_dead() {
            return Err(Error::invalid_state(format!(
                "terminal session {} is closed",
                self.id
            )));
        }
        let mut writer = self.writer.lock().expect("terminal writer poisoned");
        writer
            .write_all(data)
            .and_then(|()| writer.flush())
            .map_err(|err| Error::resource(format!("write to pty: {err}")))?;
        drop(writer);
        self.touch();
        Ok(())
    }

    /// Propagate a resize to the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self.master.lock().expect("terminal master poisoned");
        let Some(master) = master.as_ref() else {
            return Err(Error::invalid_state(format!(
                "terminal session {} is closed",
                self.id
            )));
        };
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| Error::resource(format!("resize pty: {err}")))?;
        self.touch();
        Ok(())
    }

    /// Forcibly terminate the session. The PTY master is closed first (which
    /// also unblocks the reader), then every process in the shell's Unix
    /// session is killed; a plain process-group kill would miss background
    /// jobs started with `&`.
    pub fn close(&self) {
        self.master
            .lock()
            .expect("terminal master poisoned")
            .take();
        kill_shell_session(self.shell_pid, &self.killer);
        self.mark_dead();
    }

    fn mark_dead(&self) {
        {
            let mut state = self.state.lock().expect("terminal state poisoned");
            if state.dead {
                return;
            }
            state.dead = true;
        }
        self.subscribers
            .lock()
            .expect("terminal subscribers poisoned")
            .clear();
        self.done.cancel();
        debug!(id = %self.id, "terminal.session.dead");
    }
}

/// Blocking PTY reader: chunks go to the ring buffer, then to every live
/// subscriber. Deliveries never block; a full subscriber loses the chunk.
fn read_loop(session: Arc<TerminalSession>, mut reader: Box<dyn Read + Send>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let state = &mut *session.state.lock().expect("terminal state poisoned");
                if state.dead {
                    break;
                }
                state.buffer.push(&buf[..n]);
                let subscribers = session
                    .subscribers
                    .lock()
                    .expect("terminal subscribers poisoned");
                for subscriber in subscribers.iter() {
                    // Drop-on-full; disconnected subscribers are removed by
                    // unsubscribe or session death.
                    let _ = subscriber.tx.try_send(buf[..n].to_vec());
                }
                drop(subscribers);
                session.touch();
            }
        }
    }
    session.mark_dead();
}

/// Kill every process belonging to the shell's Unix session.
///
/// On Linux this walks `/proc/*/stat` and SIGKILLs entries whose session id
/// matches the shell (which is the session leader). Elsewhere it falls back
/// to the PTY child killer, which signals the process group.
fn kill_shell_session(shell_pid: u32, killer: &Mutex<Box<dyn ChildKiller + Send + Sync>>) {
    #[cfg(target_os = "linux")]
    {
        match session_members(shell_pid) {
            Ok(members) if !members.is_empty() => {
                for pid in members {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::Signal::SIGKILL,
                    );
                }
                return;
            }
            Ok(_) => {}
            Err(err) => warn!(shell_pid, ?err, "terminal.close.proc_walk_failed"),
        }
    }
    if let Err(err) = killer.lock().expect("terminal killer poisoned").kill() {
        debug!(shell_pid, ?err, "terminal.close.kill_failed");
    }
}

/// Pids whose `/proc/<pid>/stat` session field matches `session_id`.
#[cfg(target_os = "linux")]
fn session_members(session_id: u32) -> std::io::Result<Vec<u32>> {
    let mut members = Vec::new();
    for dir_entry in std::fs::read_dir("/proc")? {
        let Ok(dir_entry) = dir_entry else { continue };
        let Some(pid) = dir_entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if parse_stat_session(&stat) == Some(session_id) {
            members.push(pid);
        }
    }
    Ok(members)
}

/// Extract the session id (field 6) from a `/proc/<pid>/stat` line. The comm
/// field may itself contain spaces and parentheses, so parsing starts after
/// the last `)`.
#[cfg(target_os = "linux")]
fn parse_stat_session(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    // Fields after comm: state ppid pgrp session ...
    after_comm.split_whitespace().nth(3)?.parse().ok()
}
