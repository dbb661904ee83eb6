//! Authoritative job registry.
//!
//! The store owns every [`JobRecord`] and is the only writer: callers go
//! through the narrow mutation operations below, never through the record
//! itself. Each entry owns a broadcast channel; every mutation re-emits the
//! full record to subscribers, so a subscriber never observes state older
//! than the mutation that woke it. Dropping a receiver unsubscribes it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::job::{
    JobId, JobOutcome, JobRecord, JobRequest, JobStatus, OutputStream, VisualizationFrame,
    VisualizationSnapshot, now_millis,
};

/// Capacity of each per-job broadcast channel. Slow subscribers that fall
/// further behind observe a lag error and pick up the latest record on the
/// next receive.
const CHANNEL_CAPACITY: usize = 64;

/// Default record lifetime from creation to eviction.
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(60 * 60);

type EvictionHook = Arc<dyn Fn(&str) + Send + Sync>;

struct JobEntry {
    record: JobRecord,
    updates: broadcast::Sender<JobRecord>,
}

/// Registry of job records with per-job publish/subscribe and TTL eviction.
///
/// The record map is shared with the eviction timers, so a store handle
/// can be dropped without orphaning scheduled evictions.
pub struct JobStore {
    jobs: Arc<DashMap<JobId, JobEntry>>,
    ttl: Duration,
    on_evict: Option<EvictionHook>,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("jobs", &self.jobs.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl JobStore {
    /// Store with the given record TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            ttl,
            on_evict: None,
        }
    }

    /// Register a hook invoked with the job id after each eviction. Used to
    /// release per-job resources held elsewhere, such as the side-channel
    /// bus topic.
    #[must_use]
    pub fn with_eviction_hook(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_evict = Some(Arc::new(hook));
        self
    }

    /// Create a queued record for an accepted request and arm its eviction
    /// timer.
    ///
    /// The timer fires a fixed TTL after creation and deletes the record
    /// unconditionally, running jobs included; bounding memory wins over
    /// keeping long-running records alive. The record's channel closes on
    /// eviction, which ends any stream subscribed to it.
    pub fn create(&self, request: JobRequest) -> JobRecord {
        let record = JobRecord::new(request);
        let (updates, _) = broadcast::channel(CHANNEL_CAPACITY);
        let id = record.id().to_string();
        self.jobs.insert(
            id.clone(),
            JobEntry {
                record: record.clone(),
                updates: updates.clone(),
            },
        );
        let _ = updates.send(record.clone());

        let jobs = Arc::clone(&self.jobs);
        let hook = self.on_evict.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if jobs.remove(&id).is_some() {
                tracing::debug!(job_id = %id, "job record evicted");
                if let Some(hook) = &hook {
                    hook(&id);
                }
            }
        });

        tracing::debug!(job_id = %record.id(), "job record created");
        record
    }

    /// Snapshot of a record, if it exists and has not been evicted.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<JobRecord> {
        self.jobs.get(id).map(|entry| entry.record.clone())
    }

    /// Current snapshot plus a live update subscription.
    ///
    /// Returns `None` for unknown or evicted ids. The receiver yields the
    /// full record after every subsequent mutation and closes when the job
    /// is evicted.
    #[must_use]
    pub fn subscribe(&self, id: &str) -> Option<(JobRecord, broadcast::Receiver<JobRecord>)> {
        self.jobs
            .get(id)
            .map(|entry| (entry.record.clone(), entry.updates.subscribe()))
    }

    /// Transition a queued record to running.
    ///
    /// Sets `startedAt` (worker-reported time wins over the local clock) on
    /// the first call; later calls are idempotent. Ignored once terminal.
    pub fn mark_running(&self, id: &str, started_at: Option<u64>) {
        self.mutate(id, |record| {
            if record.status.is_terminal() {
                return false;
            }
            if record.status == JobStatus::Queued {
                record.status = JobStatus::Running;
            }
            if record.started_at.is_none() {
                record.started_at = Some(started_at.unwrap_or_else(now_millis));
            }
            true
        });
    }

    /// Append an output chunk to the record's stdout or stderr text.
    /// Ignored once terminal.
    pub fn append_output(&self, id: &str, stream: OutputStream, chunk: &str) {
        self.mutate(id, |record| {
            if record.status.is_terminal() {
                return false;
            }
            match stream {
                OutputStream::Stdout => record.stdout.push_str(chunk),
                OutputStream::Stderr => record.stderr.push_str(chunk),
            }
            true
        });
    }

    /// Apply a terminal outcome. The first terminal transition wins; later
    /// calls are ignored.
    pub fn set_result(&self, id: &str, outcome: JobOutcome) {
        self.mutate(id, |record| {
            if record.status.is_terminal() {
                return false;
            }
            record.status = outcome.status;
            if let Some(stdout) = outcome.stdout {
                record.stdout = stdout;
            }
            if let Some(stderr) = outcome.stderr {
                record.stderr = stderr;
            }
            if outcome.error.is_some() {
                record.error = outcome.error;
            }
            if record.finished_at.is_none() {
                record.finished_at = Some(outcome.finished_at.unwrap_or_else(now_millis));
            }
            true
        });
    }

    /// Replace the visualization snapshot with the latest frame. Frames are
    /// never accumulated.
    pub fn set_visualization_frame(&self, id: &str, frame: VisualizationFrame) {
        self.mutate(id, |record| {
            record.visualization = Some(VisualizationSnapshot {
                latest_frame: Some(frame),
            });
            true
        });
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn mutate(&self, id: &str, apply: impl FnOnce(&mut JobRecord) -> bool) {
        let Some(mut entry) = self.jobs.get_mut(id) else {
            tracing::debug!(job_id = %id, "mutation on unknown job ignored");
            return;
        };
        if apply(&mut entry.record) {
            let _ = entry.updates.send(entry.record.clone());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::job::{FileEncoding, PROTOCOL_VERSION, RunFile, SanitizedJob};

    fn request(id: &str) -> JobRequest {
        JobRequest {
            id: id.to_string(),
            timeout_ms: 60_000,
            created_at: now_millis(),
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

    fn store() -> Arc<JobStore> {
        Arc::new(JobStore::new(Duration::from_secs(3600)))
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = store();
        let record = store.create(request("j1"));
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(store.get("j1").unwrap().id(), "j1");
        assert!(store.get("missing").is_none());
    }

    #[tokio::test]
    async fn status_transitions_are_monotonic() {
        let store = store();
        store.create(request("j1"));

        store.mark_running("j1", Some(100));
        let record = store.get("j1").unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.started_at, Some(100));

        store.set_result(
            "j1",
            JobOutcome {
                status: JobStatus::Succeeded,
                stdout: None,
                stderr: None,
                error: None,
                finished_at: Some(200),
            },
        );
        let record = store.get("j1").unwrap();
        assert_eq!(record.status, JobStatus::Succeeded);
        assert_eq!(record.finished_at, Some(200));

        // terminal records ignore every further transition
        store.mark_running("j1", Some(999));
        store.set_result(
            "j1",
            JobOutcome {
                status: JobStatus::Failed,
                stdout: None,
                stderr: None,
                error: Some("late".to_string()),
                finished_at: Some(999),
            },
        );
        store.append_output("j1", OutputStream::Stdout, "late");
        let record = store.get("j1").unwrap();
        assert_eq!(record.status, JobStatus::Succeeded);
        assert_eq!(record.finished_at, Some(200));
        assert_eq!(record.error, None);
        assert_eq!(record.stdout, "");
    }

    #[tokio::test]
    async fn appends_accumulate_per_stream() {
        let store = store();
        store.create(request("j1"));
        store.append_output("j1", OutputStream::Stdout, "a");
        store.append_output("j1", OutputStream::Stderr, "e");
        store.append_output("j1", OutputStream::Stdout, "b");
        let record = store.get("j1").unwrap();
        assert_eq!(record.stdout, "ab");
        assert_eq!(record.stderr, "e");
    }

    #[tokio::test]
    async fn result_overrides_buffers() {
        let store = store();
        store.create(request("j1"));
        store.append_output("j1", OutputStream::Stdout, "partial");
        store.set_result(
            "j1",
            JobOutcome {
                status: JobStatus::Failed,
                stdout: Some("full".to_string()),
                stderr: None,
                error: Some("boom".to_string()),
                finished_at: None,
            },
        );
        let record = store.get("j1").unwrap();
        assert_eq!(record.stdout, "full");
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn visualization_snapshot_is_replaced_not_accumulated() {
        let store = store();
        store.create(request("j1"));
        for stamp in [1.0, 2.0] {
            store.set_visualization_frame(
                "j1",
                VisualizationFrame {
                    width: 2,
                    height: 2,
                    format: "RGB".to_string(),
                    data: "AAAA".to_string(),
                    timestamp: Some(stamp),
                },
            );
        }
        let record = store.get("j1").unwrap();
        let frame = record.visualization.unwrap().latest_frame.unwrap();
        assert_eq!(frame.timestamp, Some(2.0));
    }

    #[tokio::test]
    async fn subscribers_see_every_mutation() {
        let store = store();
        store.create(request("j1"));
        let (snapshot, mut updates) = store.subscribe("j1").unwrap();
        assert_eq!(snapshot.status, JobStatus::Queued);

        store.mark_running("j1", None);
        store.append_output("j1", OutputStream::Stdout, "hi");

        let first = updates.recv().await.unwrap();
        assert_eq!(first.status, JobStatus::Running);
        let second = updates.recv().await.unwrap();
        assert_eq!(second.stdout, "hi");
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_evicts_even_running_jobs() {
        let evicted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&evicted);
        let store = Arc::new(
            JobStore::new(Duration::from_millis(50)).with_eviction_hook(move |id| {
                seen.lock().unwrap().push(id.to_string());
            }),
        );
        store.create(request("j1"));
        store.mark_running("j1", None);
        let (_, mut updates) = store.subscribe("j1").unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(store.get("j1").is_none());
        assert_eq!(evicted.lock().unwrap().as_slice(), ["j1".to_string()]);
        // the channel closes with the entry
        loop {
            match updates.recv().await {
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
