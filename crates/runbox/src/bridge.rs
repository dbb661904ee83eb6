//! File-based side channels layered on a job workspace.
//!
//! Both directions share one wire contract: a payload is a single JSON
//! file, written as `<name>.json.tmp` and renamed to `<name>.json`, so a
//! reader can never observe a partial payload. Delivery is at-most-once and
//! eventual, not immediate.
//!
//! Outbound channels (visualization, audio) are consumed by a short
//! interval sweep of the directory: rename atomicity guarantees every swept
//! `.json` file is complete, each file is forwarded once and deleted, and a
//! final sweep at disposal catches payloads written after the last tick.
//! The inbound channel (input events) inverts the direction: the host
//! writes event files for the sandboxed program to poll.
//!
//! Malformed payloads are logged and dropped; a corrupt frame is not a
//! program-correctness issue and never fails the job.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job::{AudioChunk, InputEvent, VisualizationFrame, now_millis};

/// Environment variable naming the visualization drop directory.
pub const VIZ_DIR_ENV: &str = "RUNBOX_VIZ_DIR";
/// Environment variable naming the audio drop directory.
pub const AUDIO_DIR_ENV: &str = "RUNBOX_AUDIO_DIR";
/// Environment variable naming the input poll directory.
pub const INPUT_DIR_ENV: &str = "RUNBOX_INPUT_DIR";

const PAYLOAD_SUFFIX: &str = ".json";
const SWEEP_INTERVAL: Duration = Duration::from_millis(25);
/// Grace period at disposal for writes that raced the final sweep.
const DISPOSE_FLUSH: Duration = Duration::from_millis(50);

/// Helper sources written into every workspace root, giving sandboxed code
/// a stable API without knowledge of the wire format.
const HELPER_SOURCES: [(&str, &str); 3] = [
    ("runbox_capture.py", include_str!("../assets/runbox_capture.py")),
    ("runbox_audio.py", include_str!("../assets/runbox_audio.py")),
    ("runbox_input.py", include_str!("../assets/runbox_input.py")),
];

/// One side-channel payload as found in a bridge file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BridgePayload {
    /// Visualization frame snapshot.
    Frame(VisualizationFrame),
    /// PCM audio chunk.
    Audio(AudioChunk),
    /// Input event headed into the sandbox.
    Input {
        /// The event payload.
        input: InputEvent,
    },
}

/// Write the helper sources into the workspace root.
///
/// # Errors
///
/// Returns the underlying I/O error if a helper cannot be written.
pub async fn install_helpers(workspace: &Path) -> io::Result<()> {
    for (name, source) in HELPER_SOURCES {
        fs::write(workspace.join(name), source).await?;
    }
    Ok(())
}

/// Sandbox-to-host channel: watches a workspace subdirectory for payload
/// files and forwards each parsed payload exactly once.
#[derive(Debug)]
pub struct OutboundBridge {
    dir: PathBuf,
    env_key: &'static str,
    cancel: CancellationToken,
    sweeper: JoinHandle<()>,
}

impl OutboundBridge {
    /// Create the drop directory under `workspace` and start sweeping it.
    /// Parsed payloads are sent on `payloads` in filename order per sweep.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the directory cannot be created.
    pub async fn start(
        workspace: &Path,
        subdir: &str,
        env_key: &'static str,
        payloads: mpsc::Sender<BridgePayload>,
    ) -> io::Result<Self> {
        let dir = workspace.join(subdir);
        fs::create_dir_all(&dir).await?;

        let cancel = CancellationToken::new();
        let sweeper = tokio::spawn(sweep_loop(dir.clone(), payloads, cancel.clone()));

        Ok(Self {
            dir,
            env_key,
            cancel,
            sweeper,
        })
    }

    /// Environment variable exposing the drop directory to the child.
    #[must_use]
    pub fn env(&self) -> (String, String) {
        (
            self.env_key.to_string(),
            self.dir.to_string_lossy().into_owned(),
        )
    }

    /// Stop sweeping, flush in-flight payloads and remove the directory.
    pub async fn dispose(self) {
        self.cancel.cancel();
        if self.sweeper.await.is_err() {
            tracing::warn!(dir = %self.dir.display(), "bridge sweeper aborted");
        }
        tokio::time::sleep(DISPOSE_FLUSH).await;
        sweep_once(&self.dir, None).await;
        if let Err(error) = fs::remove_dir_all(&self.dir).await {
            tracing::warn!(dir = %self.dir.display(), %error, "failed to remove bridge dir");
        }
    }
}

async fn sweep_loop(dir: PathBuf, payloads: mpsc::Sender<BridgePayload>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => sweep_once(&dir, Some(&payloads)).await,
        }
    }
    // payloads renamed in after the last tick still get delivered
    sweep_once(&dir, Some(&payloads)).await;
}

/// Collect, forward and delete completed payload files. With no sender the
/// sweep only clears leftovers.
async fn sweep_once(dir: &Path, payloads: Option<&mpsc::Sender<BridgePayload>>) {
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return;
    };
    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(name) = entry.file_name().to_str()
            && name.ends_with(PAYLOAD_SUFFIX)
        {
            names.push(name.to_string());
        }
    }
    // sequence-named payloads (audio) drain oldest first
    names.sort();

    for name in names {
        let path = dir.join(&name);
        match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<BridgePayload>(&bytes) {
                Ok(payload) => {
                    if let Some(sender) = payloads {
                        let _ = sender.send(payload).await;
                    }
                }
                Err(error) => {
                    tracing::warn!(file = %name, %error, "dropping malformed side-channel payload");
                }
            },
            Err(error) => {
                tracing::warn!(file = %name, %error, "failed to read side-channel payload");
            }
        }
        if let Err(error) = fs::remove_file(&path).await {
            tracing::debug!(file = %name, %error, "failed to delete consumed payload");
        }
    }
}

/// Host-to-sandbox channel: writes one atomically renamed JSON file per
/// input event into a directory the sandboxed program polls.
#[derive(Debug, Clone)]
pub struct InputBridge {
    dir: PathBuf,
}

impl InputBridge {
    /// Create the input directory under `workspace`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the directory cannot be created.
    pub async fn start(workspace: &Path) -> io::Result<Self> {
        let dir = workspace.join("input");
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Environment variable exposing the poll directory to the child.
    #[must_use]
    pub fn env(&self) -> (String, String) {
        (
            INPUT_DIR_ENV.to_string(),
            self.dir.to_string_lossy().into_owned(),
        )
    }

    /// Publish one event file. Timestamp-prefixed names keep the poll order
    /// close to arrival order.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the write or rename fails.
    pub async fn write_event(&self, event: &InputEvent) -> io::Result<()> {
        let payload = serde_json::to_vec(&BridgePayload::Input {
            input: event.clone(),
        })?;
        let name = format!("{:020}-{}", now_millis(), Uuid::new_v4().simple());
        let tmp_path = self.dir.join(format!("{name}{PAYLOAD_SUFFIX}.tmp"));
        let final_path = self.dir.join(format!("{name}{PAYLOAD_SUFFIX}"));
        fs::write(&tmp_path, &payload).await?;
        fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    /// Purge unread events and remove the directory.
    pub async fn dispose(&self) {
        sweep_once(&self.dir, None).await;
        if let Err(error) = fs::remove_dir_all(&self.dir).await {
            tracing::warn!(dir = %self.dir.display(), %error, "failed to remove input dir");
        }
    }
}
