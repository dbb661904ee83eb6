//! Server configuration, sourced from flags or the environment.

use std::net::SocketAddr;

use clap::Parser;

/// Options recognized by the server binary. Every flag also reads an
/// environment variable, so deployments can configure either way.
#[derive(Debug, Clone, Parser)]
#[command(name = "runbox-server", about = "Code-run API server")]
pub struct ServerConfig {
    /// Address to bind the HTTP listener on.
    #[arg(long, env = "RUNBOX_BIND_ADDR", default_value = "127.0.0.1:8000")]
    pub bind_addr: SocketAddr,

    /// Bearer token required of runner endpoints. Unset disables the check.
    #[arg(long, env = "RUNBOX_RUNNER_TOKEN")]
    pub runner_token: Option<String>,

    /// Ceiling on the per-job execution budget in milliseconds.
    #[arg(long, env = "RUNBOX_JOB_TIMEOUT_MS", default_value_t = 60_000)]
    pub job_timeout_ms: u64,

    /// Seconds a job record lives before unconditional eviction.
    #[arg(long, env = "RUNBOX_JOB_TTL_SECS", default_value_t = 3_600)]
    pub job_ttl_secs: u64,

    /// Leave execution to an external runner process instead of the
    /// embedded worker.
    #[arg(long, env = "RUNBOX_EXTERNAL_RUNNER", default_value_t = false)]
    pub external_runner: bool,

    /// Maximum concurrently executing jobs of the embedded worker.
    #[arg(long, env = "RUNBOX_MAX_CONCURRENCY", default_value_t = 1)]
    pub max_concurrency: usize,

    /// Interpreter binary used by the embedded worker.
    #[arg(long, env = "RUNBOX_PYTHON_BIN")]
    pub python_bin: Option<String>,
}

/// Clamp a requested execution budget into `[1s, ceiling]`; absent
/// requests get the ceiling.
#[must_use]
pub fn clamp_timeout(requested: Option<u64>, ceiling_ms: u64) -> u64 {
    match requested {
        None => ceiling_ms,
        Some(ms) => ms.max(1_000).min(ceiling_ms),
    }
}
