//! Job lifecycle operations on one feed: put, get, finish, cancel, stall,
//! retry, retract.
//!
//! Each operation is a single store procedure followed by an event. The
//! event is published only after the store reports success and its
//! delivery never affects the outcome of the operation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::{ClaimedJob, FeedStats, JobId, JobState, NewJob, now_ms};
use crate::notify::Notifier;
use crate::store::Store;
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

/// Fresh ids tried by `put` before giving up on collisions.
const PUT_ATTEMPTS: usize = 3;

/// Handle for one feed. Cheap to clone and safe to share across tasks.
pub struct JobQueue<S: Store + ?Sized> {
    pub(super) store: Arc<S>,
    pub(super) notifier: Notifier,
    pub(super) feed: String,
    pub(super) result_ttl: Duration,
    pub(super) maintenance_lock: Arc<tokio::sync::Mutex<()>>,
}

impl<S: Store + ?Sized> Clone for JobQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            notifier: self.notifier.clone(),
            feed: self.feed.clone(),
            result_ttl: self.result_ttl,
            maintenance_lock: Arc::clone(&self.maintenance_lock),
        }
    }
}

impl<S: Store + ?Sized> JobQueue<S> {
    pub(super) fn new(
        store: Arc<S>,
        notifier: Notifier,
        feed: String,
        result_ttl: Duration,
        maintenance_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        Self {
            store,
            notifier,
            feed,
            result_ttl,
            maintenance_lock,
        }
    }

    pub fn feed(&self) -> &str {
        &self.feed
    }

    /// Add a job. With `priority` it becomes the new head of the queue,
    /// otherwise it joins the tail.
    pub async fn put(&self, content: impl Into<Vec<u8>>, priority: bool) -> Result<JobId> {
        let mut job = NewJob {
            id: JobId::new(),
            content: content.into(),
            submitted_at: now_ms(),
            priority,
        };

        let mut attempt = 1;
        loop {
            match self.store.publish(&self.feed, &job).await {
                Ok(()) => break,
                Err(Error::JobExists(id)) if attempt < PUT_ATTEMPTS => {
                    warn!(feed = %self.feed, job.id = %id, "job id collision, allocating a new id");
                    job.id = JobId::new();
                    attempt += 1;
                }
                Err(e) => {
                    self.count_operation("put_error");
                    return Err(e);
                }
            }
        }

        metrics::jobs_published().add(
            1,
            &[
                KeyValue::new("feed", self.feed.clone()),
                KeyValue::new("priority", priority),
            ],
        );
        self.count_operation("put");
        debug!(feed = %self.feed, job.id = %job.id, priority, "job published");

        let id = job.id;
        self.notifier.publish(
            &self.feed,
            EventKind::Published {
                id,
                content: job.content,
                priority,
            },
        );
        Ok(id)
    }

    /// Claim the next job, waiting up to `timeout` for one to arrive.
    ///
    /// `Some(Duration::ZERO)` polls once without waiting; `None` waits
    /// indefinitely. Fails with [`Error::Empty`] on timeout.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<ClaimedJob> {
        let started = Instant::now();
        let claimed = self.store.claim(&self.feed, timeout).await?;

        metrics::claim_wait_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("feed", self.feed.clone())],
        );

        let Some(job) = claimed else {
            self.count_operation("get_empty");
            return Err(Error::Empty);
        };

        self.count_operation("get");
        self.transitioned(job.id, JobState::Queued, JobState::Claimed);
        self.notifier
            .publish(&self.feed, EventKind::Claimed { id: job.id });
        Ok(job)
    }

    /// Mark a claimed job as done. `result` is recorded and published when
    /// supplied; `None` and an empty result are kept distinct.
    pub async fn finish(&self, id: JobId, result: Option<Vec<u8>>) -> Result<()> {
        self.store
            .finish(&self.feed, id, result.as_deref())
            .await?;

        self.transitioned(id, JobState::Claimed, JobState::Finished);
        self.notifier
            .publish(&self.feed, EventKind::Finished { id, result });
        Ok(())
    }

    /// Put a claimed job back on the queue tail and count the failure.
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        let failure_count = self.store.cancel(&self.feed, id).await?;

        self.transitioned(id, JobState::Claimed, JobState::Queued);
        self.notifier.publish(
            &self.feed,
            EventKind::Cancelled { id, failure_count },
        );
        Ok(())
    }

    /// Withhold a claimed job from dispatch until [`retry`](Self::retry).
    pub async fn stall(&self, id: JobId) -> Result<()> {
        self.store.stall(&self.feed, id).await?;

        self.transitioned(id, JobState::Claimed, JobState::Stalled);
        self.notifier.publish(&self.feed, EventKind::Stalled { id });
        Ok(())
    }

    /// Return a stalled job to the queue tail.
    pub async fn retry(&self, id: JobId) -> Result<()> {
        self.store.retry(&self.feed, id).await?;

        self.transitioned(id, JobState::Stalled, JobState::Queued);
        self.notifier.publish(&self.feed, EventKind::Retried { id });
        Ok(())
    }

    /// Remove a queued or stalled job entirely.
    pub async fn retract(&self, id: JobId) -> Result<()> {
        self.store.retract(&self.feed, id).await?;

        self.count_operation("retract");
        debug!(feed = %self.feed, job.id = %id, "job retracted");
        self.notifier.publish(&self.feed, EventKind::Retracted { id });
        Ok(())
    }

    /// Ids of every job not yet finished or retracted. Queued ids come
    /// first, in dispatch order. Not synchronized with concurrent writers.
    pub async fn get_ids(&self) -> Result<Vec<JobId>> {
        self.store.item_ids(&self.feed).await
    }

    /// Number of times the job has been cancelled back to the queue.
    pub async fn get_failure_count(&self, id: JobId) -> Result<u64> {
        self.store.failure_count(&self.feed, id).await
    }

    /// Result recorded when the job finished, if the worker supplied one
    /// and it has not yet aged out.
    pub async fn get_result(&self, id: JobId) -> Result<Option<Vec<u8>>> {
        self.store.result(&self.feed, id).await
    }

    pub async fn state(&self, id: JobId) -> Result<Option<JobState>> {
        self.store.state(&self.feed, id).await
    }

    pub async fn stats(&self) -> Result<FeedStats> {
        self.store.stats(&self.feed).await
    }

    fn transitioned(&self, id: JobId, from: JobState, to: JobState) {
        let span = start_job_span(&self.feed, &id);
        record_state_transition(&span, &from.to_string(), &to.to_string());
        metrics::job_state_transitions().add(
            1,
            &[
                KeyValue::new("feed", self.feed.clone()),
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
    }

    pub(super) fn count_operation(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("feed", self.feed.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}
