//! Runner configuration, sourced from flags or the environment.

use clap::Parser;

/// Options recognized by the runner binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "runbox-runner", about = "Polling job runner")]
pub struct RunnerConfig {
    /// Base URL of the code-run server.
    #[arg(long, env = "RUNBOX_SERVER_URL", default_value = "http://127.0.0.1:8000")]
    pub server_url: String,

    /// Bearer token presented to the runner endpoints.
    #[arg(long, env = "RUNBOX_ACCESS_TOKEN")]
    pub access_token: Option<String>,

    /// Milliseconds between claim attempts while the queue is empty.
    #[arg(long, env = "RUNBOX_POLL_INTERVAL_MS", default_value_t = 5_000)]
    pub poll_interval_ms: u64,

    /// Maximum concurrently executing jobs.
    #[arg(long, env = "RUNBOX_MAX_CONCURRENCY", default_value_t = 1)]
    pub max_concurrency: usize,

    /// Interpreter binary to spawn.
    #[arg(long, env = "RUNBOX_PYTHON_BIN")]
    pub python_bin: Option<String>,
}

impl RunnerConfig {
    /// Poll interval with a floor against tight-looping misconfiguration.
    #[must_use]
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms.max(200))
    }

    /// Base URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }
}
