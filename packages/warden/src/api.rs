//! API endpoint handlers for the control plane.
//!
//! ## Dependency injection
//!
//! We use [`aerosol`][^1] to manage the manager singletons and inject them
//! into handlers. Reference [`State`] for the list of dependencies; note
//! that when providing dependencies that are in this required list you need
//! to provide them in reverse order of the list.
//!
//! Items in the list can be extracted in handlers using the
//! [`Dep`](aerosol::axum::Dep) extractor.
//!
//! [^1]: https://docs.rs/aerosol
//!
//! ## Response types
//!
//! Handlers either return a per-endpoint response enum implementing
//! [`IntoResponse`](axum::response::IntoResponse) (where the endpoint has
//! interesting outcomes, like the tunnel's 400-when-not-running), or
//! `Result<Json<T>, ApiError>` where the error mapping is uniform.

use aerosol::Aero;
use axum::{
    Json, Router,
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use clients::warden::v1::ErrorResponse;
use std::time::{Duration, Instant};
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    error::Error, lifecycle::LifecycleController, lsp::LspManager, ports::PortTracker,
    process::ProcessManager, terminal::TerminalSessionManager, tunnel::TunnelController,
};

pub mod health;
pub mod lifecycle;
pub mod lsp;
pub mod network;
pub mod process;
pub mod terminal;

pub type State = Aero![
    ProcessManager,
    TerminalSessionManager,
    PortTracker,
    LspManager,
    TunnelController,
    LifecycleController,
];

/// Requests are cut off after this long. Generous because log streams and
/// bounded process waits legitimately hold a response open; WebSocket
/// sessions are not affected once upgraded.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1800);

/// Request bodies are JSON control messages; nothing legitimate is big.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

pub fn router(state: State) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    Router::new()
        .route("/health", get(health::handle))
        .route("/process", get(process::list).post(process::execute))
        .route(
            "/process/{identifier}",
            get(process::detail).delete(process::stop),
        )
        .route("/process/{identifier}/kill", delete(process::kill))
        .route("/process/{identifier}/logs", get(process::logs))
        .route("/process/{identifier}/logs/stream", get(process::stream_logs))
        .route("/ws/process/{identifier}/logs/stream", get(process::ws_logs))
        .route("/network/process/{pid}/ports", get(network::ports))
        .route(
            "/network/process/{pid}/monitor",
            post(network::monitor).delete(network::unmonitor),
        )
        .route("/network/tunnel/config", put(network::apply_tunnel))
        .route("/network/tunnel", delete(network::disconnect_tunnel))
        .route("/lsp", post(lsp::create).get(lsp::list))
        .route("/lsp/{id}", get(lsp::detail).delete(lsp::remove))
        .route("/lsp/{id}/completions", post(lsp::completions))
        .route("/terminal/ws", get(terminal::ws))
        .route("/stop", get(lifecycle::stop_now).post(lifecycle::stop))
        .route("/status", get(lifecycle::status))
        .layer(middleware)
        .layer(axum::middleware::from_fn(trace_request))
        .with_state(state)
}

/// Uniform mapping from the core error taxonomy to HTTP.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            // Malformed input, caught before touching any state.
            Error::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            // Well-formed but semantically unusable input.
            Error::InvalidState { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::ResourceFailure { .. } | Error::Timeout { .. } | Error::PeerProtocol { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

async fn trace_request(request: Request, next: Next) -> Response {
    const REQUEST_ID_HEADER: &str = "x-request-id";
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|id| id.to_str().map(|id| id.to_string()).ok())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let start = Instant::now();
    let url = request.uri().to_string();
    let method = request.method().to_string();

    let span = tracing::info_span!("http.request", %id, %url, %method);
    async move {
        let mut response = next.run(request).await;
        let status = response.status();
        let duration = start.elapsed();
        tracing::info!(%id, %url, %method, %status, ?duration, "http.request.response");

        if let Ok(id) = HeaderValue::from_str(&id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, id);
        }
        response
    }
    .instrument(span)
    .await
}

/// The manager singletons, constructed in dependency order: the lifecycle
/// controller reads from the process manager, which consumes the port
/// tracker. All handles are cheap clones.
#[derive(Clone, Debug)]
pub struct Managers {
    pub processes: ProcessManager,
    pub terminals: TerminalSessionManager,
    pub ports: PortTracker,
    pub lsp: LspManager,
    pub tunnel: TunnelController,
    pub lifecycle: LifecycleController,
}

impl Managers {
    pub fn new() -> Self {
        let ports = PortTracker::new();
        let processes = ProcessManager::new(ports.clone());
        let lifecycle = LifecycleController::new(processes.clone());
        Self {
            processes,
            terminals: TerminalSessionManager::new(),
            ports,
            lsp: LspManager::new(),
            tunnel: TunnelController::new(),
            lifecycle,
        }
    }

    pub fn state(&self) -> State {
        // Provided in reverse order of the State list, per aerosol's rules.
        Aero::new()
            .with(self.lifecycle.clone())
            .with(self.tunnel.clone())
            .with(self.lsp.clone())
            .with(self.ports.clone())
            .with(self.terminals.clone())
            .with(self.processes.clone())
    }
}

impl Default for Managers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) fn test_server() -> axum_test::TestServer {
    axum_test::TestServer::new(router(Managers::new().state())).expect("start test server")
}
