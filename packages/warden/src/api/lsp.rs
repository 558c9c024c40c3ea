//! Language-server endpoints.

use aerosol::axum::Dep;
use axum::{Json, extract::Path};
use clients::warden::v1::{
    CompletionsRequest, CompletionsResponse, CreateLspRequest, LspServerResponse, MessageResponse,
};

use crate::{api::ApiError, lsp::LspManager};

/// Create a language server for a project and run the LSP handshake. The
/// response reports the server ready.
#[tracing::instrument(skip(lsp))]
pub async fn create(
    Dep(lsp): Dep<LspManager>,
    Json(request): Json<CreateLspRequest>,
) -> Result<Json<LspServerResponse>, ApiError> {
    let server = lsp
        .create(&request.language_id, &request.project_path)
        .await?;
    Ok(Json(server.to_response()))
}

/// List all language servers.
#[tracing::instrument(skip(lsp))]
pub async fn list(Dep(lsp): Dep<LspManager>) -> Json<Vec<LspServerResponse>> {
    Json(lsp.list().iter().map(|server| server.to_response()).collect())
}

/// Fetch a language server by id.
#[tracing::instrument(skip(lsp))]
pub async fn detail(
    Dep(lsp): Dep<LspManager>,
    Path(id): Path<String>,
) -> Result<Json<LspServerResponse>, ApiError> {
    let server = lsp.get(&id)?;
    Ok(Json(server.to_response()))
}

/// Shut down and remove a language server.
#[tracing::instrument(skip(lsp))]
pub async fn remove(
    Dep(lsp): Dep<LspManager>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    lsp.delete(&id).await?;
    Ok(Json(MessageResponse {
        message: format!("language server {id} deleted"),
    }))
}

/// Request completions at a position.
#[tracing::instrument(skip(lsp, request))]
pub async fn completions(
    Dep(lsp): Dep<LspManager>,
    Path(id): Path<String>,
    Json(request): Json<CompletionsRequest>,
) -> Result<Json<CompletionsResponse>, ApiError> {
    let completions = lsp
        .completions(&id, &request.file_path, request.line, request.character)
        .await?;
    Ok(Json(completions))
}
