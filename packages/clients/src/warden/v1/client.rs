//! HTTP client for the warden v1 API.

use std::sync::Arc;

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use futures::Stream;
use reqwest::{Response, StatusCode};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;
use tracing::instrument;
use url::Url;

use crate::warden::v1::{
    ApplyTunnelRequest, CompletionsRequest, CompletionsResponse, CreateLspRequest,
    ExecuteProcessRequest, LifecycleStatusResponse, LspServerResponse, MessageResponse,
    MonitorPortsRequest, PortsResponse, ProcessLogsResponse, ProcessResponse, StopRequest,
    TunnelConfigWire,
};

/// Client for the warden API.
///
/// ## Cloning
///
/// This type is cheaply cloneable, and clones share the underlying HTTP
/// connection pool.
#[derive(Clone, Debug)]
pub struct Client {
    base: Arc<Url>,
    http: reqwest::Client,
}

impl Client {
    /// Create a new client with the given base URL.
    pub fn new(base: Url) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("build http client")?;
        Ok(Self {
            base: Arc::new(base),
            http,
        })
    }

    /// Check that the service is reachable.
    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<()> {
        let url = self.base.join("health")?;
        let response = self.http.get(url).send().await.context("request")?;
        expect_status(response, StatusCode::OK).await?;
        Ok(())
    }

    /// Start a process.
    #[instrument(skip(self))]
    pub async fn execute(&self, request: &ExecuteProcessRequest) -> Result<ProcessResponse> {
        let url = self.base.join("process")?;
        let response = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// List all known processes.
    #[instrument(skip(self))]
    pub async fn processes(&self) -> Result<Vec<ProcessResponse>> {
        let url = self.base.join("process")?;
        let response = self.http.get(url).send().await.context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// Fetch a process by id or name.
    #[instrument(skip(self))]
    pub async fn process(&self, identifier: &str) -> Result<ProcessResponse> {
        let url = self.base.join(&format!("process/{identifier}"))?;
        let response = self.http.get(url).send().await.context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// SIGTERM a process (and its process group).
    #[instrument(skip(self))]
    pub async fn stop_process(&self, identifier: &str) -> Result<ProcessResponse> {
        let url = self.base.join(&format!("process/{identifier}"))?;
        let response = self.http.delete(url).send().await.context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// SIGKILL a process (and its process group).
    #[instrument(skip(self))]
    pub async fn kill_process(&self, identifier: &str) -> Result<ProcessResponse> {
        let url = self.base.join(&format!("process/{identifier}/kill"))?;
        let response = self.http.delete(url).send().await.context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// Snapshot of a process's captured output.
    #[instrument(skip(self))]
    pub async fn process_logs(&self, identifier: &str) -> Result<ProcessLogsResponse> {
        let url = self.base.join(&format!("process/{identifier}/logs"))?;
        let response = self.http.get(url).send().await.context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// Stream a process's log lines (`stdout:`/`stderr:`-prefixed) as they
    /// are produced. The stream ends when the process exits.
    #[instrument(skip(self))]
    pub async fn stream_process_logs(
        &self,
        identifier: &str,
    ) -> Result<impl Stream<Item = Result<String>> + use<>> {
        let url = self.base.join(&format!("process/{identifier}/logs/stream"))?;
        let response = self.http.get(url).send().await.context("request")?;
        let response = expect_status(response, StatusCode::OK).await?;

        let bytes = futures::TryStreamExt::map_err(response.bytes_stream(), std::io::Error::other);
        let reader = BufReader::new(StreamReader::new(bytes));
        Ok(futures::stream::try_unfold(reader, |mut reader| async {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.context("read line")?;
            if n == 0 {
                return Ok(None);
            }
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            Ok(Some((line, reader)))
        }))
    }

    /// Snapshot of the TCP ports open in a pid's process subtree.
    #[instrument(skip(self))]
    pub async fn ports(&self, pid: u32) -> Result<PortsResponse> {
        let url = self.base.join(&format!("network/process/{pid}/ports"))?;
        let response = self.http.get(url).send().await.context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// Register a callback for newly opened ports in a pid's subtree.
    #[instrument(skip(self))]
    pub async fn monitor_ports(&self, pid: u32, callback: &str) -> Result<MessageResponse> {
        let url = self.base.join(&format!("network/process/{pid}/monitor"))?;
        let response = self
            .http
            .post(url)
            .json(&MonitorPortsRequest {
                callback: callback.into(),
            })
            .send()
            .await
            .context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// Remove a pid's port-monitor callback.
    #[instrument(skip(self))]
    pub async fn unmonitor_ports(&self, pid: u32) -> Result<MessageResponse> {
        let url = self.base.join(&format!("network/process/{pid}/monitor"))?;
        let response = self.http.delete(url).send().await.context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// Apply a tunnel configuration, replacing any active tunnel.
    #[instrument(skip(self, config))]
    pub async fn apply_tunnel(&self, config: &TunnelConfigWire) -> Result<MessageResponse> {
        use base64::Engine as _;

        let url = self.base.join("network/tunnel/config")?;
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(config).context("encode tunnel config")?);
        let response = self
            .http
            .put(url)
            .json(&ApplyTunnelRequest { config: encoded })
            .send()
            .await
            .context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// Tear down the active tunnel.
    #[instrument(skip(self))]
    pub async fn disconnect_tunnel(&self) -> Result<MessageResponse> {
        let url = self.base.join("network/tunnel")?;
        let response = self.http.delete(url).send().await.context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// Create a language server for a project.
    #[instrument(skip(self))]
    pub async fn create_lsp(&self, request: &CreateLspRequest) -> Result<LspServerResponse> {
        let url = self.base.join("lsp")?;
        let response = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// List all language servers.
    #[instrument(skip(self))]
    pub async fn lsps(&self) -> Result<Vec<LspServerResponse>> {
        let url = self.base.join("lsp")?;
        let response = self.http.get(url).send().await.context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// Fetch a language server by id.
    #[instrument(skip(self))]
    pub async fn lsp(&self, id: &str) -> Result<LspServerResponse> {
        let url = self.base.join(&format!("lsp/{id}"))?;
        let response = self.http.get(url).send().await.context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// Shut down and remove a language server.
    #[instrument(skip(self))]
    pub async fn delete_lsp(&self, id: &str) -> Result<MessageResponse> {
        let url = self.base.join(&format!("lsp/{id}"))?;
        let response = self.http.delete(url).send().await.context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// Request completions at a position from a language server.
    #[instrument(skip(self))]
    pub async fn completions(
        &self,
        id: &str,
        request: &CompletionsRequest,
    ) -> Result<CompletionsResponse> {
        let url = self.base.join(&format!("lsp/{id}/completions"))?;
        let response = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// Fetch the sandbox lifecycle status.
    #[instrument(skip(self))]
    pub async fn status(&self) -> Result<LifecycleStatusResponse> {
        let url = self.base.join("status")?;
        let response = self.http.get(url).send().await.context("request")?;
        json_body(response, StatusCode::OK).await
    }

    /// Clear keep-alive flags now, or after `timeout` seconds when positive.
    #[instrument(skip(self))]
    pub async fn stop(&self, timeout: Option<i64>) -> Result<MessageResponse> {
        let url = self.base.join("stop")?;
        let response = self
            .http
            .post(url)
            .json(&StopRequest { timeout })
            .send()
            .await
            .context("request")?;
        json_body(response, StatusCode::OK).await
    }
}

/// Fail with the response body attached unless the status matches.
async fn expect_status(response: Response, expected: StatusCode) -> Result<Response> {
    let status = response.status();
    if status == expected {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(eyre!("unexpected status code {status} from {url}: {body}"))
}

async fn json_body<T: serde::de::DeserializeOwned>(
    response: Response,
    expected: StatusCode,
) -> Result<T> {
    expect_status(response, expected)
        .await?
        .json()
        .await
        .context("decode response body")
}
