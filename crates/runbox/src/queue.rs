//! Pending-job FIFO.
//!
//! The queue holds job ids only and knows nothing about records or
//! execution, so an in-process worker and an HTTP claim endpoint can share
//! it without coupling.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::job::JobId;

/// FIFO of pending job ids with cooperative blocking consumers.
#[derive(Debug, Default)]
pub struct JobQueue {
    pending: Mutex<VecDeque<JobId>>,
    notify: Notify,
}

impl JobQueue {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job id and wake one waiting consumer.
    pub fn enqueue(&self, id: JobId) {
        self.lock().push_back(id);
        self.notify.notify_one();
    }

    /// Non-blocking best-effort pop of the oldest pending id.
    #[must_use]
    pub fn claim_next(&self) -> Option<JobId> {
        self.lock().pop_front()
    }

    /// Wait until an id can be claimed, without spinning.
    ///
    /// Claims immediately when the queue is non-empty; otherwise parks on
    /// the queue's notifier and re-checks on every wake. Multiple waiters
    /// race fairly: each enqueue wakes one of them.
    pub async fn wait_for_next(&self) -> JobId {
        loop {
            if let Some(id) = self.claim_next() {
                return id;
            }
            self.notify.notified().await;
        }
    }

    /// Number of pending ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no ids are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<JobId>> {
        // a queue of ids stays consistent even if a holder panicked
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
