//! Disposable-workspace execution of a claimed job.
//!
//! [`execute_job`] owns the full lifecycle: materialize the sanitized
//! files into a fresh temp directory, start the side-channel bridges, run
//! the interpreter to completion or timeout while streaming output, then
//! tear everything down. Exactly one terminal event (`completed` or
//! `failed`) is reported per run, whatever the crash path, and the
//! workspace never survives the call.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::bridge::{
    AUDIO_DIR_ENV, BridgePayload, InputBridge, OutboundBridge, VIZ_DIR_ENV, install_helpers,
};
use crate::error::{SandboxError, ValidationError};
use crate::job::{ClaimedJob, InputEvent, JobId, OutputStream, RunFile, RunnerEvent, now_millis};
use crate::validate::{decode_content, sanitize_relative_path};

/// Buffer size for one OS-level read of child stdout/stderr.
const READ_BUF_BYTES: usize = 8 * 1024;

/// Receiver of runner events produced during execution.
///
/// Implementations deliver best-effort: a sink that cannot forward an
/// event logs the failure itself rather than surfacing it, so one lost
/// event never aborts a run.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event for the given job.
    async fn event(&self, job_id: &str, event: RunnerEvent);
}

/// Execution settings shared by every run of a worker.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Interpreter binary to spawn.
    pub python_bin: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python_bin: if cfg!(windows) { "python" } else { "python3" }.to_string(),
        }
    }
}

/// Stream of input events destined for one job's input bridge. Dropping
/// the feed stops its producer.
#[derive(Debug)]
pub struct InputFeed {
    events: mpsc::Receiver<InputEvent>,
    _stop: DropGuard,
}

impl InputFeed {
    /// Wrap a receiver together with the token that cancels its producer.
    #[must_use]
    pub fn new(events: mpsc::Receiver<InputEvent>, stop: CancellationToken) -> Self {
        Self {
            events,
            _stop: stop.drop_guard(),
        }
    }

    /// Next input event, or `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<InputEvent> {
        self.events.recv().await
    }
}

/// Run one claimed job to completion or timeout.
///
/// Reports `started`, zero or more `chunk`/`visualization`/`audio` events
/// and exactly one of `completed`/`failed` on `sink`. Side-channel
/// bridges and the workspace are disposed on every path, including setup
/// failures.
///
/// # Errors
///
/// Returns the underlying failure when the run could not reach a process
/// exit (unsafe path, workspace I/O, spawn failure). A `failed` event has
/// already been reported by the time an error is returned.
pub async fn execute_job(
    job: &ClaimedJob,
    sink: Arc<dyn EventSink>,
    input: Option<InputFeed>,
    config: &SandboxConfig,
) -> Result<(), SandboxError> {
    let result = run_job(job, Arc::clone(&sink), input, config).await;
    if let Err(error) = &result {
        tracing::warn!(job_id = %job.job_id, %error, "run aborted before the interpreter finished");
        sink.event(
            &job.job_id,
            RunnerEvent::Failed {
                error: error.to_string(),
                stderr: None,
                finished_at: Some(now_millis()),
            },
        )
        .await;
    }
    result
}

async fn run_job(
    job: &ClaimedJob,
    sink: Arc<dyn EventSink>,
    input: Option<InputFeed>,
    config: &SandboxConfig,
) -> Result<(), SandboxError> {
    // The validator already proved these paths safe, but they became a
    // claim payload in between; re-check before any filesystem write.
    let entry = sanitize_relative_path(&job.entry_path)?;
    let mut paths = HashSet::new();
    for file in &job.files {
        paths.insert(sanitize_relative_path(&file.path)?);
    }
    if !paths.contains(&entry) {
        return Err(ValidationError::EntryNotFound.into());
    }

    let workspace = tempfile::Builder::new()
        .prefix("runbox-")
        .tempdir()
        .map_err(SandboxError::Workspace)?;

    materialize_files(workspace.path(), &job.files).await?;
    install_helpers(workspace.path())
        .await
        .map_err(SandboxError::Workspace)?;

    let (payload_tx, payload_rx) = mpsc::channel(64);
    let channels = SideChannels::start(workspace.path(), payload_tx)
        .await
        .map_err(SandboxError::Workspace)?;

    let forwarder = tokio::spawn(forward_payloads(
        job.job_id.clone(),
        payload_rx,
        Arc::clone(&sink),
    ));
    let input_pump = input.map(|feed| tokio::spawn(pump_input(feed, channels.input.clone())));

    let run_result = run_process(job, &entry, workspace.path(), channels.env(), &sink, config).await;

    if let Some(pump) = input_pump {
        pump.abort();
        let _ = pump.await;
    }
    channels.dispose().await;
    // all payload senders are gone once the sweepers stopped
    let _ = forwarder.await;
    if let Err(error) = workspace.close() {
        tracing::warn!(job_id = %job.job_id, %error, "failed to remove workspace");
    }

    run_result
}

/// Write every sanitized file below the workspace root.
async fn materialize_files(workspace: &Path, files: &[RunFile]) -> Result<(), SandboxError> {
    for file in files {
        let safe_path = sanitize_relative_path(&file.path)?;
        let target = workspace.join(&safe_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(SandboxError::Workspace)?;
        }
        let bytes = decode_content(file)?;
        fs::write(&target, bytes)
            .await
            .map_err(SandboxError::Workspace)?;
    }
    Ok(())
}

/// The three side channels of one workspace, torn down together.
struct SideChannels {
    viz: OutboundBridge,
    audio: OutboundBridge,
    input: InputBridge,
}

impl SideChannels {
    async fn start(workspace: &Path, payloads: mpsc::Sender<BridgePayload>) -> io::Result<Self> {
        let viz = OutboundBridge::start(workspace, "viz", VIZ_DIR_ENV, payloads.clone()).await?;
        let audio = match OutboundBridge::start(workspace, "audio", AUDIO_DIR_ENV, payloads).await {
            Ok(audio) => audio,
            Err(error) => {
                viz.dispose().await;
                return Err(error);
            }
        };
        let input = match InputBridge::start(workspace).await {
            Ok(input) => input,
            Err(error) => {
                viz.dispose().await;
                audio.dispose().await;
                return Err(error);
            }
        };
        Ok(Self { viz, audio, input })
    }

    fn env(&self) -> Vec<(String, String)> {
        vec![self.viz.env(), self.audio.env(), self.input.env()]
    }

    async fn dispose(self) {
        self.viz.dispose().await;
        self.audio.dispose().await;
        self.input.dispose().await;
    }
}

async fn forward_payloads(
    job_id: JobId,
    mut payloads: mpsc::Receiver<BridgePayload>,
    sink: Arc<dyn EventSink>,
) {
    while let Some(payload) = payloads.recv().await {
        match payload {
            BridgePayload::Frame(frame) => {
                sink.event(&job_id, RunnerEvent::Visualization { frame }).await;
            }
            BridgePayload::Audio(chunk) => {
                sink.event(&job_id, RunnerEvent::Audio { chunk }).await;
            }
            // outbound directories never carry input payloads
            BridgePayload::Input { .. } => {}
        }
    }
}

async fn pump_input(mut feed: InputFeed, bridge: InputBridge) {
    while let Some(event) = feed.recv().await {
        if let Err(error) = bridge.write_event(&event).await {
            tracing::warn!(%error, "failed to hand input event to the sandbox");
        }
    }
}

enum ProcessExit {
    Status(std::process::ExitStatus),
    TimedOut,
}

async fn run_process(
    job: &ClaimedJob,
    entry: &str,
    workspace: &Path,
    env: Vec<(String, String)>,
    sink: &Arc<dyn EventSink>,
    config: &SandboxConfig,
) -> Result<(), SandboxError> {
    sink.event(
        &job.job_id,
        RunnerEvent::Started {
            started_at: Some(now_millis()),
        },
    )
    .await;

    let mut command = tokio::process::Command::new(&config.python_bin);
    command
        .arg("-u")
        .arg(entry)
        .current_dir(workspace)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
        binary: config.python_bin.clone(),
        source,
    })?;

    // no interactive stdin; dropping the handle closes the pipe
    drop(child.stdin.take());

    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump_stream(
            job.job_id.clone(),
            OutputStream::Stdout,
            stdout,
            Arc::clone(sink),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump_stream(
            job.job_id.clone(),
            OutputStream::Stderr,
            stderr,
            Arc::clone(sink),
        )));
    }

    let budget = Duration::from_millis(job.timeout_ms);
    let exit = tokio::select! {
        status = child.wait() => ProcessExit::Status(status.map_err(SandboxError::Wait)?),
        () = tokio::time::sleep(budget) => {
            tracing::warn!(
                job_id = %job.job_id,
                timeout_ms = job.timeout_ms,
                "run exceeded its time budget, killing interpreter"
            );
            if let Err(error) = child.kill().await {
                tracing::warn!(job_id = %job.job_id, %error, "failed to kill timed-out interpreter");
            }
            ProcessExit::TimedOut
        }
    };

    // readers drain to EOF once the process is gone
    for pump in pumps {
        let _ = pump.await;
    }

    let event = match exit {
        ProcessExit::TimedOut => RunnerEvent::Failed {
            error: format!(
                "run timed out after {}ms and the process was killed",
                job.timeout_ms
            ),
            stderr: None,
            finished_at: Some(now_millis()),
        },
        ProcessExit::Status(status) if status.success() => RunnerEvent::Completed {
            stdout: None,
            stderr: None,
            finished_at: Some(now_millis()),
        },
        ProcessExit::Status(status) => {
            let error = match status.code() {
                Some(code) => format!("Python exited with code {code}"),
                None => format!("Python was terminated abnormally ({status})"),
            };
            RunnerEvent::Failed {
                error,
                stderr: None,
                finished_at: Some(now_millis()),
            }
        }
    };
    sink.event(&job.job_id, event).await;
    Ok(())
}

/// Forward one stream of the child, one `chunk` event per OS-level read.
/// Chunk order is preserved within the stream; no ordering holds across
/// streams.
async fn pump_stream(
    job_id: JobId,
    stream: OutputStream,
    mut reader: impl tokio::io::AsyncRead + Unpin,
    sink: Arc<dyn EventSink>,
) {
    let mut buf = vec![0u8; READ_BUF_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                sink.event(&job_id, RunnerEvent::Chunk { stream, chunk }).await;
            }
            Err(error) => {
                tracing::debug!(job_id = %job_id, ?stream, %error, "output stream closed with error");
                break;
            }
        }
    }
}
