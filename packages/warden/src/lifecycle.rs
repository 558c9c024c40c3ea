//! Sandbox lifecycle: awake-state derivation and scheduled stops.
//!
//! The sandbox is awake exactly while at least one running process holds the
//! keep-alive flag. A stop clears those flags (processes keep running); a
//! deferred stop does the same after a delay, and a fresh stop request
//! always supersedes a pending one.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use clients::warden::v1::{LifecycleStatusResponse, SandboxState};
use tracing::{info, instrument};

use crate::process::ProcessManager;

struct Schedule {
    scheduled_at: Option<jiff::Timestamp>,
    /// Bumped on every stop request; a timer only fires if its generation is
    /// still current.
    generation: u64,
}

struct LifecycleControllerInner {
    processes: ProcessManager,
    schedule: Mutex<Schedule>,
}

/// Decides when the sandbox may hibernate.
///
/// ## Cloning
///
/// Cheaply cloneable; clones share the schedule.
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<LifecycleControllerInner>,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController").finish_non_exhaustive()
    }
}

impl LifecycleController {
    /// The controller reads process state; it is handed the manager at
    /// construction rather than looked up through any registry.
    pub fn new(processes: ProcessManager) -> Self {
        Self {
            inner: Arc::new(LifecycleControllerInner {
                processes,
                schedule: Mutex::new(Schedule {
                    scheduled_at: None,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn status(&self) -> LifecycleStatusResponse {
        let keep_alive = self.inner.processes.keep_alive_processes();
        let schedule = self.inner.schedule.lock().expect("lifecycle schedule poisoned");
        LifecycleStatusResponse {
            state: if keep_alive.is_empty() {
                SandboxState::Auto
            } else {
                SandboxState::Awake
            },
            scheduled_stop_at: schedule.scheduled_at,
            keep_alive_processes: keep_alive.iter().map(|entry| entry.id.clone()).collect(),
        }
    }

    /// Clear every keep-alive flag, now or after `timeout` seconds. Any
    /// previously scheduled stop is cancelled either way.
    #[instrument(skip(self))]
    pub fn stop(&self, timeout: Option<i64>) {
        let mut schedule = self.inner.schedule.lock().expect("lifecycle schedule poisoned");
        schedule.generation += 1;

        let timeout = timeout.unwrap_or(0);
        if timeout <= 0 {
            schedule.scheduled_at = None;
            drop(schedule);
            self.clear_keep_alive();
            return;
        }

        let generation = schedule.generation;
        let fire_at = jiff::Timestamp::now() + jiff::SignedDuration::from_secs(timeout);
        schedule.scheduled_at = Some(fire_at);
        drop(schedule);
        info!(%fire_at, "lifecycle.stop.scheduled");

        let controller = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout as u64)).await;
            let mut schedule = controller
                .inner
                .schedule
                .lock()
                .expect("lifecycle schedule poisoned");
            if schedule.generation != generation {
                // A newer stop superseded this one.
                return;
            }
            schedule.scheduled_at = None;
            drop(schedule);
            controller.clear_keep_alive();
        });
    }

    fn clear_keep_alive(&self) {
        let cleared = self.inner.processes.keep_alive_processes();
        for entry in &cleared {
            entry.set_keep_alive(false);
        }
        info!(count = cleared.len(), "lifecycle.stop.cleared_keep_alive");
    }
}
