//! Terminal session management.
//!
//! Sessions are keyed by client-chosen id and survive WebSocket disconnects;
//! a periodic reaper collects the ones nobody will come back for.

pub mod buffer;
pub mod session;

use std::{path::Path, sync::Arc, time::Duration};

use dashmap::DashMap;
use tracing::{debug, info, instrument};

use crate::{
    error::{Error, Result},
    terminal::session::{SessionOptions, TerminalSession},
};

/// Sweep interval for the session reaper.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Sessions alive but unwatched for this long are torn down.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Shells tried, in order, when neither the request nor `$SHELL` names one.
const SHELL_CANDIDATES: &[&str] = &["/bin/zsh", "/bin/bash", "/bin/sh", "/bin/ash"];

struct TerminalSessionManagerInner {
    sessions: DashMap<String, Arc<TerminalSession>>,
}

/// Keeps interactive PTY sessions alive across reconnects.
///
/// ## Cloning
///
/// Cheaply cloneable; clones share the session table.
#[derive(Clone)]
pub struct TerminalSessionManager {
    inner: Arc<TerminalSessionManagerInner>,
}

impl std::fmt::Debug for TerminalSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSessionManager")
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

impl TerminalSessionManager {
    pub fn new() -> Self {
        let manager = Self {
            inner: Arc::new(TerminalSessionManagerInner {
                sessions: DashMap::new(),
            }),
        };
        tokio::spawn(reap_loop(manager.clone()));
        manager
    }

    /// Return the live session under `id`, or create one. A dead session
    /// under the same id is replaced.
    #[instrument(skip(self, options))]
    pub fn get_or_create(&self, id: &str, options: &SessionOptions) -> Result<Arc<TerminalSession>> {
        if let Some(existing) = self.inner.sessions.get(id) {
            if !existing.is_dead() {
                debug!(id, "terminal.session.reattach");
                return Ok(Arc::clone(existing.value()));
            }
        }

        let shell = pick_shell(options.shell.as_deref())?;
        let session = TerminalSession::start(id.to_string(), shell, options)?;
        self.inner
            .sessions
            .insert(id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Result<Arc<TerminalSession>> {
        self.inner
            .sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::not_found(format!("no terminal session {id}")))
    }

    /// Forcibly terminate a session and forget it.
    #[instrument(skip(self))]
    pub fn close(&self, id: &str) -> Result<()> {
        let (_, session) = self
            .inner
            .sessions
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("no terminal session {id}")))?;
        session.close();
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }
}

impl Default for TerminalSessionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Shell selection: explicit request, then `$SHELL` if it exists on disk,
/// then the first existing well-known shell.
fn pick_shell(explicit: Option<&str>) -> Result<String> {
    if let Some(shell) = explicit {
        if !shell.is_empty() {
            return Ok(shell.to_string());
        }
    }
    if let Ok(shell) = std::env::var("SHELL") {
        if Path::new(&shell).exists() {
            return Ok(shell);
        }
    }
    SHELL_CANDIDATES
        .iter()
        .find(|candidate| Path::new(candidate).exists())
        .map(|candidate| candidate.to_string())
        .ok_or_else(|| Error::resource("no usable shell found"))
}

/// Periodically remove sessions that are dead with no subscribers, or alive
/// but unwatched past the idle timeout.
async fn reap_loop(manager: TerminalSessionManager) {
    let mut ticker = tokio::time::interval(REAP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let mut idle = Vec::new();
        let mut dead = Vec::new();
        for entry in manager.inner.sessions.iter() {
            let session = entry.value();
            if session.subscriber_count() > 0 {
                continue;
            }
            if session.is_dead() {
                dead.push(entry.key().clone());
            } else if session.idle_for() > IDLE_TIMEOUT {
                idle.push(entry.key().clone());
            }
        }
        for id in dead {
            info!(id, "terminal.reaper.removed_dead");
            manager.inner.sessions.remove(&id);
        }
        for id in idle {
            info!(id, "terminal.reaper.removed_idle");
            if let Some((_, session)) = manager.inner.sessions.remove(&id) {
                session.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_shell_prefers_explicit() {
        assert_eq!(
            pick_shell(Some("/bin/custom")).expect("explicit shell"),
            "/bin/custom"
        );
    }

    #[test]
    fn pick_shell_finds_a_fallback() {
        // Every Linux box has at least /bin/sh.
        let shell = pick_shell(None).expect("fallback shell");
        assert!(Path::new(&shell).exists());
    }
}
