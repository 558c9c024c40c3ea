//! Global test helpers: spawning a real server and polling for conditions.

use std::{future::Future, time::Duration};

use clients::warden::v1::{Client, ProcessStatus};
use color_eyre::{Result, eyre::Context};
use url::Url;
use warden::api::{self, Managers};

/// Test fixture containing a spawned server, a typed client, and direct
/// handles to the managers for the tests that reach below the HTTP surface.
pub struct TestFixture {
    pub base_url: Url,
    pub client: Client,
    pub http: reqwest::Client,
    pub managers: Managers,
}

impl TestFixture {
    /// Spawn a test server on an ephemeral port.
    pub async fn spawn() -> Result<Self> {
        let managers = Managers::new();
        let router = api::router(managers.state());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind test server")?;
        let local_addr = listener.local_addr().context("get local addr")?;
        let base_url = Url::parse(&format!("http://{local_addr}")).context("parse base URL")?;

        // The server task dies with the test process; nothing to join.
        tokio::task::spawn(async move {
            axum::serve(listener, router).await.expect("test server failed");
        });

        let client = Client::new(base_url.clone())?;
        Ok(Self {
            base_url,
            client,
            http: reqwest::Client::new(),
            managers,
        })
    }

    /// Absolute URL for a path on the test server.
    pub fn url(&self, path: &str) -> Url {
        self.base_url.join(path).expect("join test url")
    }

    /// Poll until the process reaches the status, or give up.
    pub async fn wait_for_status(
        &self,
        identifier: &str,
        status: ProcessStatus,
        deadline: Duration,
    ) -> bool {
        let client = self.client.clone();
        let identifier = identifier.to_string();
        eventually(deadline, move || {
            let client = client.clone();
            let identifier = identifier.clone();
            async move {
                client
                    .process(&identifier)
                    .await
                    .map(|process| process.status == status)
                    .unwrap_or(false)
            }
        })
        .await
    }
}

/// Poll a condition every 100ms until it holds or the deadline passes.
pub async fn eventually<F, Fut>(deadline: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let give_up = tokio::time::Instant::now() + deadline;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= give_up {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
