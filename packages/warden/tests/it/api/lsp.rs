//! Language-server endpoint error paths.
//!
//! Happy-path completion tests need a real language server installed, which
//! the test environment doesn't guarantee; the framing and response
//! normalisation those paths depend on are unit-tested in the lsp module.

use color_eyre::Result;
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::helpers::TestFixture;

#[test_log::test(tokio::test)]
async fn unsupported_language_is_rejected() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let response = fixture
        .http
        .post(fixture.url("lsp"))
        .json(&json!({ "languageId": "cobol", "projectPath": "/tmp" }))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    // The rejection uses the same error body as every other domain error.
    let body: serde_json::Value = response.json().await?;
    let error = body["error"].as_str().expect("error body");
    assert!(error.contains("unsupported languageId"), "got: {error}");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn missing_project_path_is_rejected() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let response = fixture
        .http
        .post(fixture.url("lsp"))
        .json(&json!({
            "languageId": "python",
            "projectPath": "/no/such/project/anywhere",
        }))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);

    let body: serde_json::Value = response.json().await?;
    let error = body["error"].as_str().expect("error body");
    assert!(error.contains("project path"), "got: {error}");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn unknown_server_ids_are_not_found() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let response = fixture.http.get(fixture.url("lsp/ghost")).send().await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let response = fixture
        .http
        .post(fixture.url("lsp/ghost/completions"))
        .json(&json!({ "filePath": "test.py", "line": 0, "character": 0 }))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let response = fixture.http.delete(fixture.url("lsp/ghost")).send().await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn list_starts_empty() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let servers = fixture.client.lsps().await?;
    assert!(servers.is_empty());
    Ok(())
}
