//! Persistence boundary for job feeds.
//!
//! Every method is one indivisible procedure against the shared store: the
//! engine never composes two calls and assumes nothing happened in between.
//! Failed preconditions come back as the matching domain error
//! (`JobNotClaimed`, `JobNotStalled`, ...); anything else is an
//! infrastructure failure and is propagated as is.
//!
//! Every procedure other than `create_feed` and `feed_exists` fails with
//! `FeedDoesNotExist` when the feed has not been created.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ClaimedJob, FeedSnapshot, FeedStats, JobId, JobState, NewJob};

pub use memory::MemoryStore;

#[async_trait]
pub trait Store: Send + Sync {
    /// Create a feed. Returns true if it did not exist before.
    async fn create_feed(&self, feed: &str) -> Result<bool>;

    async fn feed_exists(&self, feed: &str) -> Result<bool>;

    /// Write the item and queue its id (head when `job.priority`).
    /// Fails with `JobExists` if the id is already in use.
    async fn publish(&self, feed: &str, job: &NewJob) -> Result<()>;

    /// Pop the head of the queue and mark it claimed in one step, waiting up
    /// to `timeout` for an id to arrive. `Some(Duration::ZERO)` polls once;
    /// `None` waits indefinitely. Returns `None` on timeout.
    async fn claim(&self, feed: &str, timeout: Option<Duration>) -> Result<Option<ClaimedJob>>;

    /// Claimed -> gone. Records `result` when supplied.
    async fn finish(&self, feed: &str, id: JobId, result: Option<&[u8]>) -> Result<()>;

    /// Claimed -> queued tail. Returns the new failure count.
    async fn cancel(&self, feed: &str, id: JobId) -> Result<u64>;

    /// Claimed -> stalled.
    async fn stall(&self, feed: &str, id: JobId) -> Result<()>;

    /// Stalled -> queued tail.
    async fn retry(&self, feed: &str, id: JobId) -> Result<()>;

    /// Any live state -> gone. A worker still holding the job will find
    /// it no longer claimed.
    async fn retract(&self, feed: &str, id: JobId) -> Result<()>;

    /// Every live id: queued ids in dispatch order, then the rest by
    /// submission time.
    async fn item_ids(&self, feed: &str) -> Result<Vec<JobId>>;

    async fn failure_count(&self, feed: &str, id: JobId) -> Result<u64>;

    /// Result recorded by `finish`, if one was supplied.
    async fn result(&self, feed: &str, id: JobId) -> Result<Option<Vec<u8>>>;

    /// Drop results recorded before `finished_before` (epoch millis).
    /// Returns how many were dropped.
    async fn prune_results(&self, feed: &str, finished_before: i64) -> Result<u64>;

    /// Derived state of a live job. `None` for unknown, finished, retracted,
    /// or orphaned ids.
    async fn state(&self, feed: &str, id: JobId) -> Result<Option<JobState>>;

    async fn snapshot(&self, feed: &str) -> Result<FeedSnapshot>;

    /// Push ids back onto the head of the queue. Ids that are no longer
    /// live, or that are already queued, claimed or stalled, are skipped.
    /// Returns the ids actually restored.
    async fn restore(&self, feed: &str, ids: &[JobId]) -> Result<Vec<JobId>>;

    async fn stats(&self, feed: &str) -> Result<FeedStats>;
}
