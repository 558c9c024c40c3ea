//! Process endpoints: execute, inspect, signal, and log streaming.

use std::{convert::Infallible, sync::Arc};

use aerosol::axum::Dep;
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{
        Path, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::{IntoResponse, Response},
};
use clients::warden::v1::{
    ExecuteProcessRequest, ProcessLogsResponse, ProcessResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info};

use crate::{
    api::ApiError,
    error::Error,
    process::{ExecuteSpec, ProcessEntry, ProcessManager, effective_wait},
};

/// List all known processes, including finished ones.
#[tracing::instrument(skip(processes))]
pub async fn list(Dep(processes): Dep<ProcessManager>) -> Json<Vec<ProcessResponse>> {
    Json(
        processes
            .list()
            .iter()
            .map(|entry| entry.to_response(false))
            .collect(),
    )
}

/// Start a process, optionally waiting for completion or for ports to open.
///
/// Waits are bounded: a process that outlives the (proxy-capped) timeout is
/// reported with `pollRequired: true` and left running.
#[tracing::instrument(skip(processes, request), fields(command = %request.command))]
pub async fn execute(
    Dep(processes): Dep<ProcessManager>,
    Json(request): Json<ExecuteProcessRequest>,
) -> ExecuteResponse {
    let entry = match processes.execute(ExecuteSpec::from(&request)) {
        Ok(entry) => entry,
        Err(err) => {
            error!(%err, "process.execute.error");
            return ExecuteResponse::Error(err.into());
        }
    };

    let mut poll_required = false;
    if !request.wait_for_ports.is_empty() {
        let wait = effective_wait(request.timeout);
        match processes
            .wait_for_ports(&entry, &request.wait_for_ports, wait)
            .await
        {
            Ok(()) => {}
            Err(Error::Timeout { .. }) => poll_required = true,
            Err(err) => {
                error!(%err, "process.execute.wait_for_ports_error");
                return ExecuteResponse::Error(err.into());
            }
        }
    }
    if request.wait_for_completion {
        let wait = effective_wait(request.timeout);
        let exited = processes.wait_for_exit(&entry, wait).await;
        if !exited {
            info!(id = %entry.id, "process.execute.wait_capped");
            poll_required = true;
        }
    }

    ExecuteResponse::Started(entry.to_response(poll_required))
}

#[derive(Debug)]
pub enum ExecuteResponse {
    Started(ProcessResponse),
    Error(ApiError),
}

impl IntoResponse for ExecuteResponse {
    fn into_response(self) -> Response {
        match self {
            ExecuteResponse::Started(process) => Json(process).into_response(),
            ExecuteResponse::Error(error) => error.into_response(),
        }
    }
}

/// Fetch a process by id, pid, or name.
#[tracing::instrument(skip(processes))]
pub async fn detail(
    Dep(processes): Dep<ProcessManager>,
    Path(identifier): Path<String>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let entry = processes.get(&identifier)?;
    Ok(Json(entry.to_response(false)))
}

/// SIGTERM the process group.
#[tracing::instrument(skip(processes))]
pub async fn stop(
    Dep(processes): Dep<ProcessManager>,
    Path(identifier): Path<String>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let entry = processes.stop(&identifier)?;
    Ok(Json(entry.to_response(false)))
}

/// SIGKILL the process group.
#[tracing::instrument(skip(processes))]
pub async fn kill(
    Dep(processes): Dep<ProcessManager>,
    Path(identifier): Path<String>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let entry = processes.kill(&identifier)?;
    Ok(Json(entry.to_response(false)))
}

/// Snapshot of a process's captured output.
#[tracing::instrument(skip(processes))]
pub async fn logs(
    Dep(processes): Dep<ProcessManager>,
    Path(identifier): Path<String>,
) -> Result<Json<ProcessLogsResponse>, ApiError> {
    let entry = processes.get(&identifier)?;
    let (stdout, stderr, combined) = entry.logs();
    Ok(Json(ProcessLogsResponse {
        stdout,
        stderr,
        logs: combined,
    }))
}

/// Detaches the log sink when the client goes away.
struct SinkGuard {
    entry: Arc<ProcessEntry>,
    id: u64,
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        self.entry.detach_log_sink(self.id);
    }
}

/// Chunked stream of prefixed log lines: the snapshot so far, then live
/// output until the process exits or the client disconnects.
#[tracing::instrument(skip(processes))]
pub async fn stream_logs(
    Dep(processes): Dep<ProcessManager>,
    Path(identifier): Path<String>,
) -> Result<Response, ApiError> {
    let entry = processes.get(&identifier)?;
    let (sink_id, lines) = entry.attach_log_sink();
    let guard = sink_id.map(|id| SinkGuard {
        entry: Arc::clone(&entry),
        id,
    });

    let stream = lines.into_stream().map(move |line| {
        // Owning the guard ties sink detachment to the response body.
        let _guard = &guard;
        Ok::<_, Infallible>(Bytes::from(format!("{line}\n")))
    });
    Ok(Body::from_stream(stream).into_response())
}

/// WebSocket variant of the log stream; one text message per log line.
#[tracing::instrument(skip(processes, upgrade))]
pub async fn ws_logs(
    Dep(processes): Dep<ProcessManager>,
    Path(identifier): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let entry = processes.get(&identifier)?;
    Ok(upgrade.on_upgrade(move |socket| pump_ws_logs(socket, entry)))
}

async fn pump_ws_logs(socket: WebSocket, entry: Arc<ProcessEntry>) {
    let (mut sender, mut receiver) = socket.split();
    let (sink_id, lines) = entry.attach_log_sink();
    let _guard = sink_id.map(|id| SinkGuard {
        entry: Arc::clone(&entry),
        id,
    });

    loop {
        tokio::select! {
            line = lines.recv_async() => {
                let Ok(line) = line else { break };
                if sender.send(Message::Text(line.into())).await.is_err() {
                    break;
                }
            }
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!(id = %entry.id, "process.ws_logs.closed");
}
