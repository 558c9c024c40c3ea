//! TCP port tracking for process subtrees.
//!
//! A single polling task samples the kernel socket table (via `netstat2`)
//! and process ancestry (via `sysinfo`) once per tick, diffs against the
//! previous tick, and hands open events to a dedicated dispatch task that
//! POSTs them to registered callbacks. A slow callback can therefore never
//! stall polling, and a port that opens and closes between two ticks is
//! simply not observed.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use clients::warden::v1::PortNotification;
use color_eyre::eyre::Context as _;
use dashmap::DashMap;
use netstat2::{AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, TcpState};
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};

/// Default socket-table sampling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the event queue between the poller and the dispatcher.
const EVENT_QUEUE_CAPACITY: usize = 256;

struct Watcher {
    callback: String,
}

struct PortTrackerInner {
    watchers: DashMap<u32, Watcher>,
}

/// Detects newly opened TCP listening ports for registered pids (including
/// their descendants) and delivers at-most-once-per-opening notifications.
///
/// ## Cloning
///
/// Cheaply cloneable; clones share the watcher table and polling task.
#[derive(Clone)]
pub struct PortTracker {
    inner: Arc<PortTrackerInner>,
}

impl std::fmt::Debug for PortTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortTracker")
            .field("watchers", &self.inner.watchers.len())
            .finish()
    }
}

impl PortTracker {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        let tracker = Self {
            inner: Arc::new(PortTrackerInner {
                watchers: DashMap::new(),
            }),
        };

        let (events_tx, events_rx) = flume::bounded::<PortNotification>(EVENT_QUEUE_CAPACITY);
        tokio::spawn(poll_loop(tracker.clone(), interval, events_tx));
        tokio::spawn(dispatch_loop(tracker.clone(), events_rx));
        tracker
    }

    /// Register (or replace) the callback for a pid. At most one watcher per
    /// pid exists at a time.
    #[instrument(skip(self))]
    pub fn register(&self, pid: u32, callback: String) -> Result<()> {
        if !process_exists(pid) {
            return Err(Error::invalid_state(format!("no such pid: {pid}")));
        }
        self.inner.watchers.insert(pid, Watcher { callback });
        Ok(())
    }

    /// Remove a pid's watcher.
    #[instrument(skip(self))]
    pub fn unregister(&self, pid: u32) -> Result<()> {
        self.inner
            .watchers
            .remove(&pid)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("no port monitor registered for pid {pid}")))
    }

    /// Current TCP listening ports open in the pid's subtree.
    pub async fn open_ports(&self, pid: u32) -> Result<BTreeSet<u16>> {
        let (listeners, parents) = tokio::task::spawn_blocking(sample_system)
            .await
            .map_err(|err| Error::resource(format!("port sample task failed: {err}")))?
            .map_err(|err| Error::resource(format!("sample socket table: {err}")))?;
        Ok(subtree_ports(&listeners, &parents, pid))
    }
}

impl Default for PortTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The transitive closure of child pids reachable from `root` through
/// parent-pid pointers, including `root` itself.
fn subtree(parents: &HashMap<u32, u32>, root: u32) -> HashSet<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (&pid, &ppid) in parents {
        children.entry(ppid).or_default().push(pid);
    }

    let mut members = HashSet::from([root]);
    let mut frontier = vec![root];
    while let Some(pid) = frontier.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if members.insert(kid) {
                    frontier.push(kid);
                }
            }
        }
    }
    members
}

/// Ports present now that were not present in the previous tick.
fn diff_new_ports(previous: &BTreeSet<u16>, current: &BTreeSet<u16>) -> Vec<u16> {
    current.difference(previous).copied().collect()
}

/// Union of listening ports over a pid subtree.
fn subtree_ports(
    listeners: &HashMap<u32, BTreeSet<u16>>,
    parents: &HashMap<u32, u32>,
    root: u32,
) -> BTreeSet<u16> {
    let members = subtree(parents, root);
    members
        .iter()
        .filter_map(|pid| listeners.get(pid))
        .flatten()
        .copied()
        .collect()
}

/// One blocking sample: listening sockets by pid, and the parent-pid map.
#[allow(clippy::type_complexity)]
fn sample_system() -> color_eyre::Result<(HashMap<u32, BTreeSet<u16>>, HashMap<u32, u32>)> {
    let listeners = sample_listeners().context("read socket table")?;

    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    let parents = sys
        .processes()
        .iter()
        .filter_map(|(pid, process)| {
            process
                .parent()
                .map(|parent| (pid.as_u32(), parent.as_u32()))
        })
        .collect();

    Ok((listeners, parents))
}

fn sample_listeners() -> color_eyre::Result<HashMap<u32, BTreeSet<u16>>> {
    let af = AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6;
    let sockets =
        netstat2::get_sockets_info(af, ProtocolFlags::TCP).context("enumerate sockets")?;

    let mut listeners: HashMap<u32, BTreeSet<u16>> = HashMap::new();
    for socket in sockets {
        let ProtocolSocketInfo::Tcp(tcp) = &socket.protocol_socket_info else {
            continue;
        };
        if tcp.state != TcpState::Listen {
            continue;
        }
        for pid in &socket.associated_pids {
            listeners.entry(*pid).or_default().insert(tcp.local_port);
        }
    }
    Ok(listeners)
}

fn process_exists(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

async fn poll_loop(
    tracker: PortTracker,
    interval: Duration,
    events_tx: flume::Sender<PortNotification>,
) {
    let mut previous: HashMap<u32, BTreeSet<u16>> = HashMap::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if tracker.inner.watchers.is_empty() {
            previous.clear();
            continue;
        }

        let (listeners, parents) = match tokio::task::spawn_blocking(sample_system).await {
            Ok(Ok(sample)) => sample,
            Ok(Err(err)) => {
                warn!(?err, "ports.poll.sample_failed");
                continue;
            }
            Err(err) => {
                warn!(?err, "ports.poll.task_failed");
                continue;
            }
        };

        let watched = tracker
            .inner
            .watchers
            .iter()
            .map(|kv| *kv.key())
            .collect::<Vec<_>>();
        for pid in watched {
            // Watchers die with their pid.
            if !parents.contains_key(&pid) && !listeners.contains_key(&pid) {
                debug!(pid, "ports.watcher.pid_gone");
                tracker.inner.watchers.remove(&pid);
                previous.remove(&pid);
                continue;
            }

            let current = subtree_ports(&listeners, &parents, pid);
            let opened = match previous.get(&pid) {
                Some(prev) => diff_new_ports(prev, &current),
                // First tick for this watcher: everything open counts as new.
                None => current.iter().copied().collect(),
            };
            previous.insert(pid, current);

            for port in opened {
                let event = PortNotification { pid, port };
                if events_tx.try_send(event).is_err() {
                    warn!(pid, port, "ports.event.dropped");
                }
            }
        }
        previous.retain(|pid, _| tracker.inner.watchers.contains_key(pid));
    }
}

async fn dispatch_loop(tracker: PortTracker, events_rx: flume::Receiver<PortNotification>) {
    let http = reqwest::Client::new();
    while let Ok(event) = events_rx.recv_async().await {
        let Some(watcher) = tracker
            .inner
            .watchers
            .get(&event.pid)
            .map(|watcher| watcher.callback.clone())
        else {
            continue;
        };
        debug!(pid = event.pid, port = event.port, "ports.event.dispatch");
        match http.post(&watcher).json(&event).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(
                    pid = event.pid,
                    port = event.port,
                    status = %response.status(),
                    "ports.callback.rejected"
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(pid = event.pid, port = event.port, ?err, "ports.callback.failed");
            }
        }
    }
}
