//! Language-server pool management.
//!
//! One child process per created server, driven over Content-Length-framed
//! JSON-RPC on its stdio. Requests are serialised per server (the I/O halves
//! live under one async mutex), so response matching reduces to "skip
//! everything that isn't our id".

pub mod framing;

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use clients::warden::v1::{CompletionsResponse, LspLanguage, LspServerResponse, LspStatus};
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::Mutex as AsyncMutex,
};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};

/// Bound on every request/response exchange with a server.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the best-effort shutdown exchange.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait before checking that a freshly spawned server didn't
/// exit immediately (bad install, missing runtime).
const SPAWN_GRACE: Duration = Duration::from_millis(100);

/// Bytes of stderr kept for error reporting.
const STDERR_PREVIEW_LIMIT: usize = 4 * 1024;

struct ServerIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    /// Files already announced with `textDocument/didOpen`.
    opened: HashSet<PathBuf>,
}

/// A managed language-server child process.
pub struct LspServer {
    pub id: String,
    pub language: LspLanguage,
    pub project_path: PathBuf,
    pub pid: u32,
    status: Mutex<LspStatus>,
    io: AsyncMutex<ServerIo>,
    next_request_id: AtomicI64,
    stderr_preview: Arc<Mutex<Vec<u8>>>,
}

impl LspServer {
    pub fn status(&self) -> LspStatus {
        *self.status.lock().expect("lsp status poisoned")
    }

    fn set_status(&self, status: LspStatus) {
        *self.status.lock().expect("lsp status poisoned") = status;
    }

    fn stderr_preview(&self) -> String {
        let preview = self.stderr_preview.lock().expect("lsp stderr poisoned");
        String::from_utf8_lossy(&preview).into_owned()
    }

    pub fn to_response(&self) -> LspServerResponse {
        LspServerResponse {
            id: self.id.clone(),
            language_id: self.language,
            project_path: self.project_path.display().to_string(),
            pid: self.pid,
            status: self.status(),
        }
    }

    fn next_request_id(&self) -> i64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Issue a request and wait for its response, skipping any
    /// server-initiated traffic that arrives first.
    async fn request(&self, io: &mut ServerIo, method: &str, params: Value) -> Result<Value> {
        let id = self.next_request_id();
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let exchange = async {
            framing::write_message(&mut io.stdin, &request)
                .await
                .map_err(|err| Error::resource(format!("write {method} request: {err}")))?;
            loop {
                let message = framing::read_message(&mut io.stdout)
                    .await
                    .map_err(|err| Error::peer_protocol(0, format!("read response: {err}")))?;
                if message.get("id").and_then(Value::as_i64) != Some(id) {
                    debug!(id = %self.id, "lsp.skipping_server_message");
                    continue;
                }
                if let Some(error) = message.get("error") {
                    let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
                    let text = error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error");
                    return Err(Error::peer_protocol(code, text));
                }
                return Ok(message.get("result").cloned().unwrap_or(Value::Null));
            }
        };

        tokio::time::timeout(REQUEST_TIMEOUT, exchange)
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "language server did not answer {method} within {}s",
                    REQUEST_TIMEOUT.as_secs()
                ))
            })?
    }

    async fn notify(&self, io: &mut ServerIo, method: &str, params: Value) -> Result<()> {
        let notification = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        framing::write_message(&mut io.stdin, &notification)
            .await
            .map_err(|err| Error::resource(format!("write {method} notification: {err}")))
    }
}

struct LspManagerInner {
    servers: DashMap<String, Arc<LspServer>>,
}

/// Pool of language-server child processes.
///
/// ## Cloning
///
/// Cheaply cloneable; clones share the server pool.
#[derive(Clone)]
pub struct LspManager {
    inner: Arc<LspManagerInner>,
}

impl std::fmt::Debug for LspManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspManager")
            .field("servers", &self.inner.servers.len())
            .finish()
    }
}

impl LspManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LspManagerInner {
                servers: DashMap::new(),
            }),
        }
    }

    /// Spawn a language server for a project and run the LSP handshake. The
    /// returned server is ready for requests.
    #[instrument(skip(self))]
    pub async fn create(&self, language_id: &str, project_path: &str) -> Result<Arc<LspServer>> {
        let language = language_id
            .parse::<LspLanguage>()
            .map_err(Error::invalid_argument)?;
        let project_path = PathBuf::from(project_path);
        if !project_path.is_dir() {
            return Err(Error::invalid_state(format!(
                "project path does not exist: {}",
                project_path.display()
            )));
        }

        let argv = server_command(language);
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&project_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                Error::resource(format!("spawn language server {}: {err}", argv.join(" ")))
            })?;
        let pid = child
            .id()
            .ok_or_else(|| Error::resource("language server has no pid"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::resource("language server stdin missing"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::resource("language server stdout missing"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::resource("language server stderr missing"))?;

        let stderr_preview = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(drain_stderr(stderr, Arc::clone(&stderr_preview)));

        let server = Arc::new(LspServer {
            id: uuid::Uuid::new_v4().to_string(),
            language,
            project_path: project_path.clone(),
            pid,
            status: Mutex::new(LspStatus::Initializing),
            io: AsyncMutex::new(ServerIo {
                stdin,
                stdout: BufReader::new(stdout),
                opened: HashSet::new(),
            }),
            next_request_id: AtomicI64::new(1),
            stderr_preview,
        });

        // Catch servers that die on startup before spending the handshake
        // timeout on them.
        tokio::time::sleep(SPAWN_GRACE).await;
        if let Ok(Some(status)) = child.try_wait() {
            server.set_status(LspStatus::Error);
            return Err(Error::invalid_state(format!(
                "language server exited during startup ({status}): {}",
                server.stderr_preview()
            )));
        }

        let handshake = {
            let mut io = server.io.lock().await;
            let result = server
                .request(
                    &mut io,
                    "initialize",
                    json!({
                        "processId": std::process::id(),
                        "rootUri": file_uri(&project_path),
                        "capabilities": {
                            "textDocument": {
                                "completion": {
                                    "completionItem": { "snippetSupport": false },
                                },
                            },
                        },
                    }),
                )
                .await;
            match result {
                Ok(_) => server.notify(&mut io, "initialized", json!({})).await,
                Err(err) => Err(err),
            }
        };
        if let Err(err) = handshake {
            server.set_status(LspStatus::Error);
            warn!(id = %server.id, ?err, "lsp.handshake.failed");
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            );
            return Err(err);
        }
        server.set_status(LspStatus::Ready);
        info!(id = %server.id, %language, pid, "lsp.server.ready");

        self.inner
            .servers
            .insert(server.id.clone(), Arc::clone(&server));
        tokio::spawn(watch_exit(self.clone(), Arc::clone(&server), child));
        Ok(server)
    }

    pub fn list(&self) -> Vec<Arc<LspServer>> {
        self.inner
            .servers
            .iter()
            .map(|kv| Arc::clone(kv.value()))
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<Arc<LspServer>> {
        self.inner
            .servers
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::not_found(format!("no language server {id}")))
    }

    /// Best-effort shutdown/exit exchange, then kill and forget the server.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        let (_, server) = self
            .inner
            .servers
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("no language server {id}")))?;
        server.set_status(LspStatus::Shutdown);

        let farewell = async {
            let mut io = server.io.lock().await;
            let _ = server.request(&mut io, "shutdown", Value::Null).await;
            let _ = server.notify(&mut io, "exit", Value::Null).await;
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, farewell).await.is_err() {
            debug!(id = %server.id, "lsp.shutdown.unresponsive");
        }

        // Closing the pipes happens when the exit watcher drops the child;
        // the kill guarantees it gets there.
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(server.pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        );
        Ok(())
    }

    /// Request completions at a file position. Refused unless the server is
    /// ready.
    #[instrument(skip(self))]
    pub async fn completions(
        &self,
        id: &str,
        file_path: &str,
        line: u32,
        character: u32,
    ) -> Result<CompletionsResponse> {
        let server = self.get(id)?;
        if server.status() != LspStatus::Ready {
            return Err(Error::invalid_state(format!(
                "language server {id} is {}, not ready",
                server.status()
            )));
        }

        let absolute = if Path::new(file_path).is_absolute() {
            PathBuf::from(file_path)
        } else {
            server.project_path.join(file_path)
        };
        let uri = file_uri(&absolute);

        let mut io = server.io.lock().await;
        if !io.opened.contains(&absolute) {
            let content = tokio::fs::read_to_string(&absolute).await.map_err(|err| {
                Error::invalid_state(format!("read {}: {err}", absolute.display()))
            })?;
            let language_id = match server.language {
                LspLanguage::Python => "python",
                LspLanguage::Typescript => "typescript",
                LspLanguage::Javascript => "javascript",
            };
            server
                .notify(
                    &mut io,
                    "textDocument/didOpen",
                    json!({
                        "textDocument": {
                            "uri": uri,
                            "languageId": language_id,
                            "version": 1,
                            "text": content,
                        },
                    }),
                )
                .await?;
            io.opened.insert(absolute.clone());
        }

        let result = server
            .request(
                &mut io,
                "textDocument/completion",
                json!({
                    "textDocument": { "uri": uri },
                    "position": { "line": line, "character": character },
                }),
            )
            .await?;
        drop(io);

        normalize_completions(result)
    }
}

impl Default for LspManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The command line for a language's server: the installed binary when it is
/// on PATH, otherwise the npm on-demand runner.
fn server_command(language: LspLanguage) -> Vec<String> {
    let found = |binary: &str| {
        std::env::var_os("PATH").is_some_and(|path| {
            std::env::split_paths(&path).any(|dir| dir.join(binary).is_file())
        })
    };
    match language {
        LspLanguage::Python => {
            if found("pyright-langserver") {
                vec!["pyright-langserver".into(), "--stdio".into()]
            } else {
                vec![
                    "npx".into(),
                    "-y".into(),
                    "-p".into(),
                    "pyright".into(),
                    "pyright-langserver".into(),
                    "--stdio".into(),
                ]
            }
        }
        LspLanguage::Typescript | LspLanguage::Javascript => {
            if found("typescript-language-server") {
                vec!["typescript-language-server".into(), "--stdio".into()]
            } else {
                vec![
                    "npx".into(),
                    "-y".into(),
                    "typescript-language-server".into(),
                    "--stdio".into(),
                ]
            }
        }
    }
}

fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Collapse the two shapes a completion response may take (a
/// `CompletionList` or a bare item array) into one.
fn normalize_completions(result: Value) -> Result<CompletionsResponse> {
    match result {
        Value::Null => Ok(CompletionsResponse {
            is_incomplete: false,
            items: Vec::new(),
        }),
        Value::Array(items) => Ok(CompletionsResponse {
            is_incomplete: false,
            items,
        }),
        Value::Object(mut list) => {
            let is_incomplete = list
                .get("isIncomplete")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let items = match list.remove("items") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            Ok(CompletionsResponse {
                is_incomplete,
                items,
            })
        }
        other => Err(Error::peer_protocol(
            0,
            format!("unexpected completion result shape: {other}"),
        )),
    }
}

/// Accumulate stderr into a bounded preview buffer.
async fn drain_stderr(stderr: tokio::process::ChildStderr, preview: Arc<Mutex<Vec<u8>>>) {
    let mut stderr = stderr;
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut preview = preview.lock().expect("lsp stderr poisoned");
                preview.extend_from_slice(&buf[..n]);
                if preview.len() > STDERR_PREVIEW_LIMIT {
                    let excess = preview.len() - STDERR_PREVIEW_LIMIT;
                    preview.drain(..excess);
                }
            }
        }
    }
}

/// Reap the child; a server that dies outside of shutdown is marked errored
/// and dropped from the pool.
async fn watch_exit(manager: LspManager, server: Arc<LspServer>, mut child: Child) {
    let status = child.wait().await;
    if server.status() != LspStatus::Shutdown {
        warn!(id = %server.id, ?status, "lsp.server.died");
        server.set_status(LspStatus::Error);
    }
    manager.inner.servers.remove(&server.id);
}
