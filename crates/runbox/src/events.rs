//! Per-job side-channel event bus.
//!
//! Visualization frames, audio chunks and input events are fanned out here,
//! keyed by job id, separate from the record state machine: a frame or an
//! input event never mutates job state on its own. Topics are created
//! lazily and pruned when the owning job record is evicted.

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::job::{JobEvent, JobId};

/// Capacity of each per-job broadcast topic.
const TOPIC_CAPACITY: usize = 256;

/// Fan-out bus for side-channel events, one topic per job.
#[derive(Debug, Default)]
pub struct JobEventBus {
    topics: DashMap<JobId, broadcast::Sender<JobEvent>>,
}

impl JobEventBus {
    /// Empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event on the job's topic.
    ///
    /// Events published while nobody subscribes are dropped; side-channel
    /// delivery is best-effort by contract.
    pub fn publish(&self, job_id: &str, event: JobEvent) {
        let sender = self
            .topics
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        if sender.send(event).is_err() {
            tracing::trace!(job_id = %job_id, "side-channel event dropped, no subscribers");
        }
    }

    /// Subscribe to the job's topic, creating it if needed. Dropping the
    /// receiver unsubscribes.
    #[must_use]
    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<JobEvent> {
        self.topics
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Drop the job's topic, closing all of its receivers. Called from the
    /// store's eviction hook so topics cannot outlive their job.
    pub fn prune(&self, job_id: &str) {
        if self.topics.remove(job_id).is_some() {
            tracing::debug!(job_id = %job_id, "side-channel topic pruned");
        }
    }

    /// Number of live topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Whether the bus has no topics.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
