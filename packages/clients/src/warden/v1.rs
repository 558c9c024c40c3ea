//! Warden v1 API types and client.

use std::collections::HashMap;

use derive_more::{Debug, Display};
use serde::{Deserialize, Serialize};

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::Client;

/// Lifecycle status of a managed process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// The process is alive.
    #[display("running")]
    Running,
    /// The process exited with code zero.
    #[display("completed")]
    Completed,
    /// The process exited with a nonzero code without being signalled by us.
    #[display("failed")]
    Failed,
    /// The process was terminated by a stop request (SIGTERM).
    #[display("stopped")]
    Stopped,
    /// The process was terminated by a kill request (SIGKILL).
    #[display("killed")]
    Killed,
}

impl ProcessStatus {
    /// Whether the process has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }
}

/// Request body for `POST /process`.
///
/// Unknown fields are ignored so forward-compatible clients can send fields
/// this server version does not know about.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteProcessRequest {
    /// Command line to run. Shell-wrapped when it contains shell operators,
    /// tokenised with quote handling otherwise.
    pub command: String,

    /// Working directory for the child. Defaults to the server's cwd.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Optional friendly name; `GET /process/{name}` resolves to the most
    /// recently started process bearing it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Environment overrides, merged over the parent environment.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Block the request until the process exits (or the timeout elapses).
    #[serde(default)]
    pub wait_for_completion: bool,

    /// Bound, in seconds, for `wait_for_completion` / `wait_for_ports`, and
    /// the auto-kill timeout for keep-alive processes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Block the request until every listed TCP port is open in the child's
    /// process subtree.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wait_for_ports: Vec<u16>,

    /// Restart the process when it exits with a nonzero status.
    #[serde(default)]
    pub restart_on_failure: bool,

    /// Maximum number of restarts when `restart_on_failure` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,

    /// Mark the process as keeping the sandbox awake.
    #[serde(default)]
    pub keep_alive: bool,
}

impl ExecuteProcessRequest {
    /// Convenience constructor for the common "just run this" case.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            name: None,
            env: HashMap::new(),
            wait_for_completion: false,
            timeout: None,
            wait_for_ports: Vec::new(),
            restart_on_failure: false,
            max_restarts: None,
            keep_alive: false,
        }
    }
}

/// A managed process, as returned by the process endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    pub id: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub command: String,
    pub working_dir: String,
    pub status: ProcessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub started_at: jiff::Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<jiff::Timestamp>,
    pub keep_alive: bool,
    /// Set when a bounded wait was capped before the process finished: the
    /// process is still running and the caller should poll `GET /process/{id}`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub poll_required: bool,
}

/// Response body for `GET /process/{id}/logs`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessLogsResponse {
    pub stdout: String,
    pub stderr: String,
    /// stdout and stderr interleaved in arrival order.
    pub logs: String,
}

/// Response body for `GET /network/process/{pid}/ports`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortsResponse {
    pub pid: u32,
    /// TCP ports currently open in the pid's process subtree.
    pub ports: Vec<u16>,
}

/// Request body for `POST /network/process/{pid}/monitor`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorPortsRequest {
    /// URL that receives an HTTP POST of [`PortNotification`] for every
    /// newly opened port.
    pub callback: String,
}

/// Payload POSTed to a port-monitor callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortNotification {
    pub pid: u32,
    pub port: u16,
}

/// Tunnel configuration wire format: the base64-decoded JSON object carried
/// by `PUT /network/tunnel/config`.
///
/// Field names are snake_case and unknown fields are ignored. Key material is
/// redacted from the `Debug` representation; there is deliberately no
/// endpoint that reads this back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelConfigWire {
    /// Local interface address in CIDR notation, e.g. `10.8.0.2/24`.
    pub local_ip: String,
    /// Peer endpoint as `host:port` (IPv6 as `[addr]:port`).
    pub peer_endpoint: String,
    /// Peer public key, base64 of exactly 32 bytes.
    #[debug("[redacted]")]
    pub peer_public_key: String,
    /// Local private key, base64 of exactly 32 bytes.
    #[debug("[redacted]")]
    pub private_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_ips: Option<Vec<String>>,
    /// Keepalive interval in seconds; 0 disables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u32>,
    /// Take over the default route so all egress flows through the tunnel.
    #[serde(default)]
    pub route_all: bool,
}

/// Request body for `PUT /network/tunnel/config`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyTunnelRequest {
    /// Base64-encoded JSON [`TunnelConfigWire`].
    pub config: String,
}

/// Languages with a managed language server.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LspLanguage {
    #[display("python")]
    Python,
    #[display("typescript")]
    Typescript,
    #[display("javascript")]
    Javascript,
}

impl std::str::FromStr for LspLanguage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Self::Python),
            "typescript" => Ok(Self::Typescript),
            "javascript" => Ok(Self::Javascript),
            other => Err(format!("unsupported languageId: {other:?}")),
        }
    }
}

/// Lifecycle status of a managed language server.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LspStatus {
    #[display("initializing")]
    Initializing,
    #[display("ready")]
    Ready,
    #[display("error")]
    Error,
    #[display("shutdown")]
    Shutdown,
}

/// Request body for `POST /lsp`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLspRequest {
    /// Requested language. Carried as a string so an unsupported value is
    /// rejected by the server with the uniform error body rather than at
    /// deserialization time; see [`LspLanguage`] for the accepted set.
    pub language_id: String,
    /// Absolute path of the project the server should analyze.
    pub project_path: String,
}

/// A managed language server, as returned by the LSP endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LspServerResponse {
    pub id: String,
    pub language_id: LspLanguage,
    pub project_path: String,
    pub pid: u32,
    pub status: LspStatus,
}

/// Request body for `POST /lsp/{id}/completions`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionsRequest {
    /// Path of the file, relative to the server's project path.
    pub file_path: String,
    /// Zero-based line of the cursor.
    pub line: u32,
    /// Zero-based UTF-16 column of the cursor.
    pub character: u32,
}

/// Normalized completion results: servers may answer with a `CompletionList`
/// or a bare item array, and both collapse into this shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionsResponse {
    pub is_incomplete: bool,
    pub items: Vec<serde_json::Value>,
}

/// Messages exchanged over the terminal WebSocket.
///
/// The wire schema is `{type, data?, cols?, rows?}`; `input` and `resize`
/// flow client-to-server, `output` and `error` server-to-client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TerminalMessage {
    Input { data: String },
    Output { data: String },
    Resize { cols: u16, rows: u16 },
    Error { data: String },
}

/// Whether the sandbox is being held awake.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// At least one running keep-alive process is pinning the sandbox.
    #[display("awake")]
    Awake,
    /// No keep-alive processes; the sandbox may hibernate.
    #[display("auto")]
    Auto,
}

/// Response body for `GET /status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleStatusResponse {
    pub state: SandboxState,
    /// When a deferred stop is scheduled to fire, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_stop_at: Option<jiff::Timestamp>,
    /// Ids of the running keep-alive processes.
    pub keep_alive_processes: Vec<String>,
}

/// Request body for `POST /stop`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    /// Seconds to defer the stop by; absent or ≤ 0 stops immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
}

/// Generic success body: `{"message": "..."}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Generic error body: `{"error": "..."}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
