//! Bounded-concurrency worker loop and its pluggable seams.
//!
//! The loop is transport-agnostic: it claims work through a
//! [`ClaimSource`] and reports through an [`EventSink`], so the same
//! scheduling logic serves an in-process worker (queue + store) and an
//! external runner process claiming over HTTP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::ClaimError;
use crate::events::JobEventBus;
use crate::job::{ClaimedJob, JobEvent, JobOutcome, JobStatus, RunnerEvent};
use crate::queue::JobQueue;
use crate::sandbox::{EventSink, InputFeed, SandboxConfig, execute_job};
use crate::store::JobStore;

/// Source of claimable jobs.
#[async_trait]
pub trait ClaimSource: Send + Sync {
    /// Claim the next job. `Ok(None)` means the queue is currently empty;
    /// the worker re-polls after its poll interval. Implementations may
    /// block cooperatively instead of returning `None`.
    async fn claim(&self) -> Result<Option<ClaimedJob>, ClaimError>;
}

/// Source of per-job input-event feeds, if the deployment carries any.
#[async_trait]
pub trait InputSource: Send + Sync {
    /// Open the input feed for a job about to run.
    async fn open(&self, job_id: &str) -> Option<InputFeed>;
}

/// Worker loop settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound on concurrently executing jobs.
    pub max_concurrency: usize,
    /// Sleep between claims while the queue is empty.
    pub poll_interval: Duration,
    /// Execution settings handed to every run.
    pub sandbox: SandboxConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            poll_interval: Duration::from_millis(500),
            sandbox: SandboxConfig::default(),
        }
    }
}

/// Run the claim-execute loop until `shutdown` fires, then drain.
///
/// The loop launches each run as an independent task and only blocks when
/// the in-flight set is at capacity, racing "any one run finishes" against
/// shutdown. A failed or panicked run is logged and never stops the loop;
/// sibling jobs are unaffected.
pub async fn run_worker(
    claims: Arc<dyn ClaimSource>,
    sink: Arc<dyn EventSink>,
    inputs: Option<Arc<dyn InputSource>>,
    shutdown: CancellationToken,
    config: WorkerConfig,
) {
    let max_concurrency = config.max_concurrency.max(1);
    let mut in_flight = FuturesUnordered::new();

    loop {
        if in_flight.len() >= max_concurrency {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = in_flight.next() => {}
            }
            continue;
        }

        let claimed = tokio::select! {
            () = shutdown.cancelled() => break,
            claimed = claims.claim() => claimed,
        };

        match claimed {
            Ok(Some(job)) => {
                tracing::info!(job_id = %job.job_id, "claimed job");
                let input = match &inputs {
                    Some(source) => source.open(&job.job_id).await,
                    None => None,
                };
                let sink = Arc::clone(&sink);
                let sandbox = config.sandbox.clone();
                in_flight.push(tokio::spawn(async move {
                    if let Err(error) = execute_job(&job, sink, input, &sandbox).await {
                        tracing::error!(job_id = %job.job_id, %error, "job run failed");
                    }
                }));
            }
            Ok(None) => {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(config.poll_interval) => {}
                    _ = in_flight.next(), if !in_flight.is_empty() => {}
                }
            }
            Err(error) => {
                tracing::warn!(%error, "claim attempt failed");
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        }
    }

    if !in_flight.is_empty() {
        tracing::info!(pending = in_flight.len(), "worker shutting down, draining runs");
    }
    while in_flight.next().await.is_some() {}
}

/// In-process claim source backed by the shared queue and store.
///
/// Blocks cooperatively on the queue instead of returning `None`; ids
/// whose record was evicted between enqueue and claim are skipped.
pub struct QueueClaimSource {
    queue: Arc<JobQueue>,
    store: Arc<JobStore>,
}

impl QueueClaimSource {
    /// Claim source over the given queue and store.
    #[must_use]
    pub fn new(queue: Arc<JobQueue>, store: Arc<JobStore>) -> Self {
        Self { queue, store }
    }
}

impl std::fmt::Debug for QueueClaimSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClaimSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl ClaimSource for QueueClaimSource {
    async fn claim(&self) -> Result<Option<ClaimedJob>, ClaimError> {
        loop {
            let id = self.queue.wait_for_next().await;
            if let Some(record) = self.store.get(&id) {
                self.store.mark_running(&id, None);
                return Ok(Some(record.claimed()));
            }
            tracing::debug!(job_id = %id, "queued id no longer resolves to a record, skipping");
        }
    }
}

/// In-process event sink: applies runner events to the store and fans
/// side-channel events out on the bus.
pub struct StoreEventSink {
    store: Arc<JobStore>,
    bus: Arc<JobEventBus>,
}

impl StoreEventSink {
    /// Sink writing into the given store and bus.
    #[must_use]
    pub fn new(store: Arc<JobStore>, bus: Arc<JobEventBus>) -> Self {
        Self { store, bus }
    }
}

impl std::fmt::Debug for StoreEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreEventSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl EventSink for StoreEventSink {
    async fn event(&self, job_id: &str, event: RunnerEvent) {
        apply_runner_event(&self.store, &self.bus, job_id, event);
    }
}

/// Apply one runner event to the authoritative state.
///
/// Status events drive the record state machine, visualization updates the
/// snapshot and is republished raw, audio bypasses the store entirely.
/// Shared by the in-process sink and the runner-events HTTP endpoint.
pub fn apply_runner_event(store: &JobStore, bus: &JobEventBus, job_id: &str, event: RunnerEvent) {
    match event {
        RunnerEvent::Started { started_at } => store.mark_running(job_id, started_at),
        RunnerEvent::Chunk { stream, chunk } => store.append_output(job_id, stream, &chunk),
        RunnerEvent::Completed {
            stdout,
            stderr,
            finished_at,
        } => store.set_result(
            job_id,
            JobOutcome {
                status: JobStatus::Succeeded,
                stdout,
                stderr,
                error: None,
                finished_at,
            },
        ),
        RunnerEvent::Failed {
            error,
            stderr,
            finished_at,
        } => store.set_result(
            job_id,
            JobOutcome {
                status: JobStatus::Failed,
                stdout: None,
                stderr,
                error: Some(error),
                finished_at,
            },
        ),
        RunnerEvent::Visualization { frame } => {
            store.set_visualization_frame(job_id, frame.clone());
            bus.publish(job_id, JobEvent::Visualization { frame });
        }
        RunnerEvent::Audio { chunk } => bus.publish(job_id, JobEvent::Audio { chunk }),
    }
}

/// In-process input source: adapts the side-channel bus topic of a job
/// into an [`InputFeed`] for its sandbox.
pub struct BusInputSource {
    bus: Arc<JobEventBus>,
}

impl BusInputSource {
    /// Input source over the given bus.
    #[must_use]
    pub fn new(bus: Arc<JobEventBus>) -> Self {
        Self { bus }
    }
}

impl std::fmt::Debug for BusInputSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusInputSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl InputSource for BusInputSource {
    async fn open(&self, job_id: &str) -> Option<InputFeed> {
        let mut topic = self.bus.subscribe(job_id);
        let (tx, rx) = mpsc::channel(64);
        let stop = CancellationToken::new();
        let token = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    event = topic.recv() => match event {
                        Ok(JobEvent::Input { input }) => {
                            if tx.send(input).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "input subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
        Some(InputFeed::new(rx, stop))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::job::{
        FileEncoding, InputEvent, JobRequest, PROTOCOL_VERSION, RunFile, SanitizedJob,
    };
    use crate::store::JobStore;
    use std::time::Duration;

    fn request(id: &str) -> JobRequest {
        JobRequest {
            id: id.to_string(),
            timeout_ms: 60_000,
            created_at: 0,
            job: SanitizedJob {
                protocol_version: PROTOCOL_VERSION,
                language: "python".to_string(),
                files: vec![RunFile {
                    path: "main.py".to_string(),
                    content: String::new(),
                    encoding: FileEncoding::Utf8,
                }],
                entry_path: "main.py".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn queue_claim_source_skips_evicted_ids() {
        let queue = Arc::new(JobQueue::new());
        let store = Arc::new(JobStore::new(Duration::from_secs(3600)));
        store.create(request("live"));
        queue.enqueue("ghost".to_string());
        queue.enqueue("live".to_string());

        let source = QueueClaimSource::new(queue, Arc::clone(&store));
        let claimed = source.claim().await.unwrap().unwrap();
        assert_eq!(claimed.job_id, "live");
        assert_eq!(store.get("live").unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn apply_runner_event_routes_audio_past_the_store() {
        let store = Arc::new(JobStore::new(Duration::from_secs(3600)));
        let bus = Arc::new(JobEventBus::new());
        store.create(request("j1"));
        let mut topic = bus.subscribe("j1");

        apply_runner_event(
            &store,
            &bus,
            "j1",
            RunnerEvent::Audio {
                chunk: crate::job::AudioChunk {
                    seq: Some(1),
                    timestamp: None,
                    sample_rate: 44_100,
                    channels: 2,
                    format: "pcm_s16le".to_string(),
                    duration_ms: None,
                    data: "AA==".to_string(),
                },
            },
        );

        assert!(matches!(topic.recv().await.unwrap(), JobEvent::Audio { .. }));
        // the record itself is untouched by audio
        assert_eq!(store.get("j1").unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn bus_input_source_feeds_only_input_events() {
        let bus = Arc::new(JobEventBus::new());
        let source = BusInputSource::new(Arc::clone(&bus));
        let mut feed = source.open("j1").await.unwrap();

        bus.publish(
            "j1",
            JobEvent::Input {
                input: InputEvent {
                    kind: "keydown".to_string(),
                    key: Some("a".to_string()),
                    x: None,
                    y: None,
                    button: None,
                    delta_x: None,
                    delta_y: None,
                    seq: None,
                },
            },
        );

        let event = tokio::time::timeout(Duration::from_secs(1), feed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.key.as_deref(), Some("a"));
    }
}
