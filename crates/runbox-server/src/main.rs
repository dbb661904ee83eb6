//! Code-run API server.
//!
//! Serves the submission, polling, claim/event and stream endpoints, and
//! unless configured for an external runner also embeds the worker loop
//! that executes queued jobs in this process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use runbox::{
    BusInputSource, JobEventBus, JobQueue, JobStore, QueueClaimSource, SandboxConfig,
    StoreEventSink, WorkerConfig, run_worker,
};

mod auth;
mod config;
mod routes;
mod stream;

use config::ServerConfig;
use routes::{AppState, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::parse();

    let bus = Arc::new(JobEventBus::new());
    let bus_for_evictions = Arc::clone(&bus);
    let store = Arc::new(
        JobStore::new(Duration::from_secs(config.job_ttl_secs))
            .with_eviction_hook(move |job_id| bus_for_evictions.prune(job_id)),
    );
    let queue = Arc::new(JobQueue::new());

    let state = AppState {
        config: Arc::new(config.clone()),
        store: Arc::clone(&store),
        queue: Arc::clone(&queue),
        bus: Arc::clone(&bus),
    };

    let shutdown = CancellationToken::new();
    let worker = if config.external_runner {
        tracing::info!("execution delegated to an external runner process");
        None
    } else {
        let sandbox = match &config.python_bin {
            Some(python_bin) => SandboxConfig {
                python_bin: python_bin.clone(),
            },
            None => SandboxConfig::default(),
        };
        let worker_config = WorkerConfig {
            max_concurrency: config.max_concurrency,
            sandbox,
            ..WorkerConfig::default()
        };
        tracing::info!(
            max_concurrency = worker_config.max_concurrency,
            "starting embedded worker"
        );
        Some(tokio::spawn(run_worker(
            Arc::new(QueueClaimSource::new(queue, Arc::clone(&store))),
            Arc::new(StoreEventSink::new(store, Arc::clone(&bus))),
            Some(Arc::new(BusInputSource::new(bus))),
            shutdown.clone(),
            worker_config,
        )))
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            serve_shutdown.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    if let Some(worker) = worker {
        worker.await.context("worker task panicked")?;
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}
