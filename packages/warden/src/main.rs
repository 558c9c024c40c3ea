use std::path::PathBuf;

use clap::Parser;
use color_eyre::{Result, eyre::Context};
use derive_more::Debug;
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warden::{api, tunnel::config::TunnelConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the warden control-plane server
    Serve(ServeConfig),
}

#[derive(Parser, Debug)]
struct ServeConfig {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Where to write the best-effort process-table snapshot on shutdown
    /// (optional)
    #[arg(long, env = "SNAPSHOT_PATH")]
    snapshot_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .pretty(),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    match cli.command {
        Command::Serve(config) => serve(config).await,
    }
}

async fn serve(config: ServeConfig) -> Result<()> {
    tracing::info!("constructing application router...");
    let managers = api::Managers::new();

    // An orchestrator-provided tunnel config takes effect before we serve
    // traffic. A bad config is logged, not fatal: the sandbox is still
    // useful without egress.
    if let Ok(encoded) = std::env::var("BL_NETWORKING_CONFIG") {
        match TunnelConfig::from_base64(&encoded) {
            Ok(tunnel_config) => {
                if let Err(err) = managers.tunnel.apply(tunnel_config).await {
                    tracing::error!(%err, "startup tunnel config failed to apply");
                } else {
                    tracing::info!("startup tunnel config applied");
                }
            }
            Err(err) => tracing::error!(%err, "startup tunnel config is invalid"),
        }
    }

    let processes = managers.processes.clone();
    let router = api::router(managers.state());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    // Graceful shutdown: wait for SIGTERM or SIGINT, then allow in-flight
    // requests to complete.
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(path) = &config.snapshot_path {
        match serde_json::to_vec_pretty(&processes.snapshot()) {
            Ok(snapshot) => {
                if let Err(err) = tokio::fs::write(path, snapshot).await {
                    tracing::warn!(?err, path = %path.display(), "failed to write process snapshot");
                }
            }
            Err(err) => tracing::warn!(?err, "failed to encode process snapshot"),
        }
    }

    tracing::info!("server shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        },
    }
}
