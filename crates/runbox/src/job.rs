//! Wire and record types for run jobs.
//!
//! Everything that crosses a process boundary lives here: the untrusted
//! submission, the sanitized request, the authoritative job record, the
//! runner event protocol and the side-channel payloads. Wire field names are
//! camelCase to match the browser-facing JSON contract.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque job identifier (a v4 UUID in string form).
pub type JobId = String;

/// Wire protocol version accepted by the submission endpoint.
pub const PROTOCOL_VERSION: u32 = 2;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Lifecycle state of a job. Transitions are monotonic:
/// queued → running → one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted and waiting for a worker to claim it.
    Queued,
    /// Claimed by a worker; the interpreter may be running.
    Running,
    /// Interpreter exited with code 0.
    Succeeded,
    /// Non-zero exit, spawn failure or timeout kill.
    Failed,
    /// Reserved terminal state; nothing produces it today.
    Cancelled,
}

impl JobStatus {
    /// Whether this status admits no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Content encoding of a submitted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEncoding {
    /// Plain text, byte length measured on the UTF-8 form.
    Utf8,
    /// Standard base64; must decode cleanly.
    Base64,
}

/// One file of a run bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFile {
    /// Workspace-relative, forward-slash path.
    pub path: String,
    /// File content in the declared encoding.
    pub content: String,
    /// How `content` is encoded.
    pub encoding: FileEncoding,
}

/// Untrusted job submission as posted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmission {
    /// Must equal [`PROTOCOL_VERSION`].
    pub protocol_version: u32,
    /// Must be `"python"`.
    pub language: String,
    /// Files to materialize into the workspace.
    pub files: Vec<RunFile>,
    /// Path of the file handed to the interpreter.
    pub entry_path: String,
}

/// A submission that passed validation. Paths are normalized and unique,
/// the entry path is a member of `files`, and content sizes are bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizedJob {
    /// Always [`PROTOCOL_VERSION`].
    pub protocol_version: u32,
    /// Always `"python"`.
    pub language: String,
    /// Sanitized files.
    pub files: Vec<RunFile>,
    /// Normalized entry path, present in `files`.
    pub entry_path: String,
}

/// Sanitized job plus the server-assigned identity and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    /// Caller-unguessable job id.
    pub id: JobId,
    /// Wall-clock budget for the interpreter process.
    pub timeout_ms: u64,
    /// Submission time, ms since epoch.
    pub created_at: u64,
    /// The validated submission.
    #[serde(flatten)]
    pub job: SanitizedJob,
}

/// Latest visualization state for a job. Frames are not retained
/// historically; only the most recent one survives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationSnapshot {
    /// Most recently received frame, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_frame: Option<VisualizationFrame>,
}

/// One whole-state snapshot of a visualization surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationFrame {
    /// Pixel width.
    pub width: u32,
    /// Pixel height.
    pub height: u32,
    /// Pixel format tag, `"RGB"` today.
    pub format: String,
    /// Base64-encoded pixel buffer.
    pub data: String,
    /// Producer-side timestamp, seconds or ms depending on the helper.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

/// One PCM audio chunk emitted by the sandboxed program.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunk {
    /// Producer-assigned ordering hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Producer-side timestamp in ms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    /// Samples per second.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u32,
    /// Sample format tag, e.g. `"pcm_s16le"`.
    pub format: String,
    /// Chunk duration if the producer computed it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    /// Base64-encoded PCM bytes.
    pub data: String,
}

/// Keyboard, mouse or wheel descriptor forwarded into the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputEvent {
    /// Event kind, e.g. `"keydown"`, `"mousemove"`, `"wheel"`.
    pub kind: String,
    /// Key name for keyboard events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Pointer x coordinate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    /// Pointer y coordinate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    /// Mouse button index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button: Option<u32>,
    /// Horizontal wheel delta.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_x: Option<f64>,
    /// Vertical wheel delta.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_y: Option<f64>,
    /// Optional sequence number for ordering.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// Which standard stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    /// Child process stdout.
    Stdout,
    /// Child process stderr.
    Stderr,
}

/// Event protocol between an executing worker and the job store.
///
/// `started`, `chunk`, `completed` and `failed` drive the record state
/// machine; `visualization` replaces the snapshot; `audio` bypasses the
/// store entirely and rides the side-channel bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RunnerEvent {
    /// The interpreter process was spawned.
    #[serde(rename_all = "camelCase")]
    Started {
        /// Worker-side start time, ms since epoch.
        #[serde(skip_serializing_if = "Option::is_none")]
        started_at: Option<u64>,
    },
    /// One OS-level read from stdout or stderr.
    Chunk {
        /// Source stream.
        stream: OutputStream,
        /// Decoded text of the read.
        chunk: String,
    },
    /// The process exited with code 0.
    #[serde(rename_all = "camelCase")]
    Completed {
        /// Full stdout override, if the worker buffered it.
        #[serde(skip_serializing_if = "Option::is_none")]
        stdout: Option<String>,
        /// Full stderr override, if the worker buffered it.
        #[serde(skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
        /// Worker-side finish time, ms since epoch.
        #[serde(skip_serializing_if = "Option::is_none")]
        finished_at: Option<u64>,
    },
    /// The run ended without a zero exit: non-zero code, spawn failure
    /// or timeout kill.
    #[serde(rename_all = "camelCase")]
    Failed {
        /// Human-readable failure description.
        error: String,
        /// Full stderr override, if the worker buffered it.
        #[serde(skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
        /// Worker-side finish time, ms since epoch.
        #[serde(skip_serializing_if = "Option::is_none")]
        finished_at: Option<u64>,
    },
    /// A visualization frame arrived on the bridge.
    Visualization {
        /// The frame; replaces any previous snapshot.
        frame: VisualizationFrame,
    },
    /// An audio chunk arrived on the bridge.
    Audio {
        /// The chunk payload.
        #[serde(flatten)]
        chunk: AudioChunk,
    },
}

/// Side-channel event fanned out per job, bypassing the record state
/// machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobEvent {
    /// Latest visualization frame, republished verbatim.
    Visualization {
        /// Frame payload.
        frame: VisualizationFrame,
    },
    /// Audio chunk from the sandboxed program.
    Audio {
        /// Chunk payload.
        chunk: AudioChunk,
    },
    /// Input event headed for the sandboxed program.
    Input {
        /// Event payload.
        input: InputEvent,
    },
}

/// Authoritative job record held by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Identity, limits and sanitized files.
    #[serde(flatten)]
    pub request: JobRequest,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Accumulated stdout text.
    pub stdout: String,
    /// Accumulated stderr text.
    pub stderr: String,
    /// Failure description once terminal-failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the interpreter started, ms since epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    /// When the run reached a terminal state, ms since epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    /// Latest visualization frame, if any arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualization: Option<VisualizationSnapshot>,
}

impl JobRecord {
    /// Fresh queued record for an accepted request.
    #[must_use]
    pub fn new(request: JobRequest) -> Self {
        Self {
            request,
            status: JobStatus::Queued,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            started_at: None,
            finished_at: None,
            visualization: None,
        }
    }

    /// The job id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.request.id
    }

    /// Client-facing status projection (no file contents).
    #[must_use]
    pub fn status_response(&self) -> StatusResponse {
        StatusResponse {
            job_id: self.request.id.clone(),
            status: self.status,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            error: self.error.clone(),
            created_at: self.request.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            visualization: self.visualization.clone(),
        }
    }

    /// Worker-facing claim projection (files, entry, limits).
    #[must_use]
    pub fn claimed(&self) -> ClaimedJob {
        ClaimedJob {
            job_id: self.request.id.clone(),
            protocol_version: self.request.job.protocol_version,
            language: self.request.job.language.clone(),
            files: self.request.job.files.clone(),
            entry_path: self.request.job.entry_path.clone(),
            timeout_ms: self.request.timeout_ms,
            created_at: self.request.created_at,
        }
    }
}

/// Poll-endpoint projection of a job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Job id.
    pub job_id: JobId,
    /// Current status.
    pub status: JobStatus,
    /// Accumulated stdout.
    pub stdout: String,
    /// Accumulated stderr.
    pub stderr: String,
    /// Failure description, if failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Submission time.
    pub created_at: u64,
    /// Interpreter start time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    /// Terminal time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    /// Latest visualization snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualization: Option<VisualizationSnapshot>,
}

/// Payload handed to a worker when it claims a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedJob {
    /// Job id.
    pub job_id: JobId,
    /// Wire protocol version the files were submitted under.
    pub protocol_version: u32,
    /// Language tag, `"python"`.
    pub language: String,
    /// Files to materialize.
    pub files: Vec<RunFile>,
    /// Entry file path.
    pub entry_path: String,
    /// Wall-clock budget in ms.
    pub timeout_ms: u64,
    /// Submission time.
    pub created_at: u64,
}

/// Terminal outcome applied through [`crate::store::JobStore::set_result`].
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// `Succeeded` or `Failed`.
    pub status: JobStatus,
    /// Full stdout override.
    pub stdout: Option<String>,
    /// Full stderr override.
    pub stderr: Option<String>,
    /// Failure description.
    pub error: Option<String>,
    /// Worker-reported finish time; defaults to now.
    pub finished_at: Option<u64>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn runner_event_wire_shape() {
        let event = RunnerEvent::Chunk {
            stream: OutputStream::Stdout,
            chunk: "hi\n".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "chunk");
        assert_eq!(json["stream"], "stdout");
        assert_eq!(json["chunk"], "hi\n");
    }

    #[test]
    fn audio_event_flattens_chunk_fields() {
        let event = RunnerEvent::Audio {
            chunk: AudioChunk {
                seq: Some(3),
                timestamp: None,
                sample_rate: 44_100,
                channels: 2,
                format: "pcm_s16le".to_string(),
                duration_ms: None,
                data: "AAAA".to_string(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "audio");
        assert_eq!(json["sampleRate"], 44_100);
        assert_eq!(json["seq"], 3);
    }

    #[test]
    fn record_flattens_request_on_the_wire() {
        let record = JobRecord::new(JobRequest {
            id: "abc".to_string(),
            timeout_ms: 60_000,
            created_at: 1,
            job: SanitizedJob {
                protocol_version: PROTOCOL_VERSION,
                language: "python".to_string(),
                files: vec![RunFile {
                    path: "main.py".to_string(),
                    content: "print('hi')".to_string(),
                    encoding: FileEncoding::Utf8,
                }],
                entry_path: "main.py".to_string(),
            },
        });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["entryPath"], "main.py");
        assert_eq!(json["status"], "queued");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
