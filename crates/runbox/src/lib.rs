//! # runbox
//!
//! Core library of the code-run subsystem: accept a bundle of untrusted
//! Python files, execute it in an isolated, time-bounded workspace and
//! stream stdout/stderr plus side-channel visualization, audio and input
//! events back to subscribers in near-real-time.
//!
//! The pieces, leaves first:
//!
//! - [`validate`] sanitizes an untrusted submission into a safe internal
//!   form; file paths become real filesystem writes, so path normalization
//!   here is the load-bearing invariant of the whole crate.
//! - [`queue`] is the FIFO of pending job ids with blocking consumers.
//! - [`store`] is the authoritative job registry with per-job
//!   publish/subscribe and TTL eviction.
//! - [`events`] fans side-channel frames, audio and input out per job,
//!   bypassing the record state machine.
//! - [`sandbox`] materializes a workspace, runs the interpreter under a
//!   timeout and streams its output.
//! - [`bridge`] carries visualization, audio and input payloads between
//!   host and sandboxed process over atomically renamed files.
//! - [`worker`] is the bounded-concurrency claim loop, pluggable over
//!   claim sources so the same logic drives an in-process worker or an
//!   external runner process.
//! - [`template`] builds a submission from a packaged directory through
//!   the same validator as the public boundary.
//!
//! Flow: a client submits, the validator sanitizes, the store creates a
//! queued record, the queue hands the id to a worker, the sandbox runs the
//! program while bridges and output pumps emit events, the store and bus
//! fan those out to subscribers, and the record reaches a terminal status
//! when the process exits or is killed at its deadline.

#![forbid(unsafe_code)]

pub mod bridge;
mod error;
pub mod events;
pub mod job;
pub mod queue;
pub mod sandbox;
pub mod store;
pub mod template;
pub mod validate;
pub mod worker;

pub use error::{ClaimError, SandboxError, ValidationError};
pub use events::JobEventBus;
pub use job::{
    AudioChunk, ClaimedJob, FileEncoding, InputEvent, JobEvent, JobId, JobOutcome, JobRecord,
    JobRequest, JobStatus, JobSubmission, OutputStream, RunFile, RunnerEvent, SanitizedJob,
    StatusResponse, VisualizationFrame, VisualizationSnapshot,
};
pub use queue::JobQueue;
pub use sandbox::{EventSink, InputFeed, SandboxConfig, execute_job};
pub use store::{DEFAULT_JOB_TTL, JobStore};
pub use template::{TemplateError, submission_from_dir};
pub use validate::sanitize_submission;
pub use worker::{
    BusInputSource, ClaimSource, InputSource, QueueClaimSource, StoreEventSink, WorkerConfig,
    apply_runner_event, run_worker,
};
