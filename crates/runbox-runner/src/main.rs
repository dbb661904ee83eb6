//! Polling job runner.
//!
//! Claims jobs from the server over HTTP, executes them in local sandbox
//! workspaces and reports events back, with a WebSocket client per running
//! job for inbound input events. The same worker loop drives this process
//! and the server's embedded mode; only the claim and report transports
//! differ.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use runbox::{SandboxConfig, WorkerConfig, run_worker};

mod api;
mod config;
mod stream;

use api::{ApiClient, HttpEventSink};
use config::RunnerConfig;
use stream::StreamInputSource;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RunnerConfig::parse();
    let base_url = config.base_url().to_string();

    let client = ApiClient::new(base_url.clone(), config.access_token.clone());
    let sandbox = match &config.python_bin {
        Some(python_bin) => SandboxConfig {
            python_bin: python_bin.clone(),
        },
        None => SandboxConfig::default(),
    };
    let worker_config = WorkerConfig {
        max_concurrency: config.max_concurrency.max(1),
        poll_interval: config.poll_interval(),
        sandbox,
    };

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, draining runs");
            signal_shutdown.cancel();
        }
    });

    tracing::info!(
        server = %base_url,
        max_concurrency = worker_config.max_concurrency,
        "runner started"
    );
    run_worker(
        Arc::new(client.clone()),
        Arc::new(HttpEventSink::new(client)),
        Some(Arc::new(StreamInputSource::new(base_url))),
        shutdown,
        worker_config,
    )
    .await;

    tracing::info!("runner stopped");
    Ok(())
}
