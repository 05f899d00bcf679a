//! In-process store.
//!
//! Each procedure runs under a single mutex, which makes it atomic with
//! respect to every other caller sharing this `MemoryStore`. Blocked claims
//! park on a `Notify` that is signalled whenever an id is queued.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use super::Store;
use crate::error::{Error, Result};
use crate::model::{ClaimedJob, FeedSnapshot, FeedStats, JobId, JobState, NewJob, now_ms};

#[derive(Debug, Clone)]
struct Item {
    content: Vec<u8>,
    submitted_at: i64,
}

#[derive(Debug, Default)]
struct Feed {
    items: HashMap<JobId, Item>,
    queued: VecDeque<JobId>,
    claimed: HashMap<JobId, i64>,
    stalled: HashSet<JobId>,
    cancelled: HashMap<JobId, u64>,
    /// Finish results with the time they were recorded.
    results: HashMap<JobId, (Vec<u8>, i64)>,
    published: u64,
    finished: u64,
}

impl Feed {
    fn state_of(&self, id: JobId) -> Option<JobState> {
        if !self.items.contains_key(&id) {
            None
        } else if self.claimed.contains_key(&id) {
            Some(JobState::Claimed)
        } else if self.stalled.contains(&id) {
            Some(JobState::Stalled)
        } else if self.queued.contains(&id) {
            Some(JobState::Queued)
        } else {
            None
        }
    }

    /// True if `id` is currently in `from` and the move to `to` is legal.
    fn can_move(&self, id: JobId, from: JobState, to: JobState) -> bool {
        self.state_of(id) == Some(from) && from.can_transition_to(to)
    }

    fn remove_queued(&mut self, id: JobId) {
        self.queued.retain(|q| *q != id);
    }

    fn pop_claimable(&mut self) -> Option<ClaimedJob> {
        while let Some(id) = self.queued.pop_front() {
            let Some(item) = self.items.get(&id) else {
                warn!(job.id = %id, "dropping queued id with no item");
                continue;
            };
            let content = item.content.clone();
            self.claimed.insert(id, now_ms());
            return Some(ClaimedJob {
                id,
                content,
                failure_count: self.cancelled.get(&id).copied().unwrap_or(0),
            });
        }
        None
    }
}

/// Store that keeps every feed in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    feeds: Mutex<HashMap<String, Feed>>,
    ready: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Feed>> {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against one feed under the store lock.
    fn with_feed<T>(&self, feed: &str, f: impl FnOnce(&mut Feed) -> Result<T>) -> Result<T> {
        let mut feeds = self.lock();
        let state = feeds
            .get_mut(feed)
            .ok_or_else(|| Error::FeedDoesNotExist(feed.to_string()))?;
        f(state)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_feed(&self, feed: &str) -> Result<bool> {
        let mut feeds = self.lock();
        if feeds.contains_key(feed) {
            return Ok(false);
        }
        feeds.insert(feed.to_string(), Feed::default());
        Ok(true)
    }

    async fn feed_exists(&self, feed: &str) -> Result<bool> {
        Ok(self.lock().contains_key(feed))
    }

    async fn publish(&self, feed: &str, job: &NewJob) -> Result<()> {
        self.with_feed(feed, |f| {
            if f.items.contains_key(&job.id) {
                return Err(Error::JobExists(job.id));
            }
            f.items.insert(
                job.id,
                Item {
                    content: job.content.clone(),
                    submitted_at: job.submitted_at,
                },
            );
            if job.priority {
                f.queued.push_front(job.id);
            } else {
                f.queued.push_back(job.id);
            }
            f.published += 1;
            Ok(())
        })?;
        self.ready.notify_waiters();
        Ok(())
    }

    async fn claim(&self, feed: &str, timeout: Option<Duration>) -> Result<Option<ClaimedJob>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // Register interest before checking so a publish between the
            // check and the wait is not missed.
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.with_feed(feed, |f| Ok(f.pop_claimable()))? {
                return Ok(Some(job));
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || tokio::time::timeout_at(deadline, notified).await.is_err()
                    {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn finish(&self, feed: &str, id: JobId, result: Option<&[u8]>) -> Result<()> {
        self.with_feed(feed, |f| {
            if !f.can_move(id, JobState::Claimed, JobState::Finished) {
                return Err(Error::JobNotClaimed(id));
            }
            f.claimed.remove(&id);
            f.items.remove(&id);
            f.cancelled.remove(&id);
            if let Some(result) = result {
                f.results.insert(id, (result.to_vec(), now_ms()));
            }
            f.finished += 1;
            Ok(())
        })
    }

    async fn cancel(&self, feed: &str, id: JobId) -> Result<u64> {
        let count = self.with_feed(feed, |f| {
            if !f.can_move(id, JobState::Claimed, JobState::Queued) {
                return Err(Error::JobNotClaimed(id));
            }
            f.claimed.remove(&id);
            let count = f.cancelled.entry(id).or_insert(0);
            *count += 1;
            let count = *count;
            f.queued.push_back(id);
            Ok(count)
        })?;
        self.ready.notify_waiters();
        Ok(count)
    }

    async fn stall(&self, feed: &str, id: JobId) -> Result<()> {
        self.with_feed(feed, |f| {
            if !f.can_move(id, JobState::Claimed, JobState::Stalled) {
                return Err(Error::JobNotClaimed(id));
            }
            f.claimed.remove(&id);
            f.stalled.insert(id);
            Ok(())
        })
    }

    async fn retry(&self, feed: &str, id: JobId) -> Result<()> {
        self.with_feed(feed, |f| {
            if !f.can_move(id, JobState::Stalled, JobState::Queued) {
                return Err(Error::JobNotStalled(id));
            }
            f.stalled.remove(&id);
            f.queued.push_back(id);
            Ok(())
        })?;
        self.ready.notify_waiters();
        Ok(())
    }

    async fn retract(&self, feed: &str, id: JobId) -> Result<()> {
        self.with_feed(feed, |f| {
            if !f.items.contains_key(&id) {
                return Err(Error::ItemDoesNotExist(id));
            }
            // Any live job may be retracted, including one a worker holds
            // and orphans with no state at all.
            f.items.remove(&id);
            f.remove_queued(id);
            f.claimed.remove(&id);
            f.stalled.remove(&id);
            f.cancelled.remove(&id);
            Ok(())
        })
    }

    async fn item_ids(&self, feed: &str) -> Result<Vec<JobId>> {
        self.with_feed(feed, |f| {
            let mut ids: Vec<JobId> = f
                .queued
                .iter()
                .filter(|id| f.items.contains_key(id))
                .copied()
                .collect();
            let queued: HashSet<JobId> = ids.iter().copied().collect();

            let mut rest: Vec<(i64, JobId)> = f
                .items
                .iter()
                .filter(|(id, _)| !queued.contains(id))
                .map(|(id, item)| (item.submitted_at, *id))
                .collect();
            rest.sort();
            ids.extend(rest.into_iter().map(|(_, id)| id));
            Ok(ids)
        })
    }

    async fn failure_count(&self, feed: &str, id: JobId) -> Result<u64> {
        self.with_feed(feed, |f| Ok(f.cancelled.get(&id).copied().unwrap_or(0)))
    }

    async fn result(&self, feed: &str, id: JobId) -> Result<Option<Vec<u8>>> {
        self.with_feed(feed, |f| Ok(f.results.get(&id).map(|(r, _)| r.clone())))
    }

    async fn prune_results(&self, feed: &str, finished_before: i64) -> Result<u64> {
        self.with_feed(feed, |f| {
            let before = f.results.len();
            f.results
                .retain(|_, (_, finished_at)| *finished_at >= finished_before);
            Ok((before - f.results.len()) as u64)
        })
    }

    async fn state(&self, feed: &str, id: JobId) -> Result<Option<JobState>> {
        self.with_feed(feed, |f| Ok(f.state_of(id)))
    }

    async fn snapshot(&self, feed: &str) -> Result<FeedSnapshot> {
        self.with_feed(feed, |f| {
            Ok(FeedSnapshot {
                items: f.items.keys().copied().collect(),
                queued: f.queued.iter().copied().collect(),
                claimed: f.claimed.keys().copied().collect(),
                stalled: f.stalled.iter().copied().collect(),
            })
        })
    }

    async fn restore(&self, feed: &str, ids: &[JobId]) -> Result<Vec<JobId>> {
        let restored = self.with_feed(feed, |f| {
            let mut restored = Vec::new();
            for &id in ids {
                if f.items.contains_key(&id) && f.state_of(id).is_none() {
                    f.queued.push_front(id);
                    restored.push(id);
                }
            }
            Ok(restored)
        })?;
        if !restored.is_empty() {
            self.ready.notify_waiters();
        }
        Ok(restored)
    }

    async fn stats(&self, feed: &str) -> Result<FeedStats> {
        self.with_feed(feed, |f| {
            Ok(FeedStats {
                queued: f.queued.len() as u64,
                claimed: f.claimed.len() as u64,
                stalled: f.stalled.len() as u64,
                published: f.published,
                finished: f.finished,
            })
        })
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Drop an id from every index while keeping its item, as a crash
    /// between two store writes would.
    pub(crate) fn orphan(&self, feed: &str, id: JobId) {
        let mut feeds = self.lock();
        if let Some(f) = feeds.get_mut(feed) {
            f.remove_queued(id);
            f.claimed.remove(&id);
            f.stalled.remove(&id);
        }
    }
}
