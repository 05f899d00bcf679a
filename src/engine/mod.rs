//! Core engine. The public API for publishing and processing jobs.
//!
//! The engine owns the injected store and the event notifier. All state
//! transitions go through a [`JobQueue`] obtained from it.

pub mod maintenance;
pub mod queue;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::info;

use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::notify::Notifier;
use crate::store::{MemoryStore, Store};

pub use maintenance::{Reconciler, ReconcilerConfig};
pub use queue::JobQueue;

/// How long finish results are kept before maintenance prunes them.
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(3600);

/// The job engine. Owns the store handle and the event stream.
pub struct Engine<S: Store + ?Sized> {
    store: Arc<S>,
    notifier: Notifier,
    result_ttl: Duration,
    /// One reconciliation lock per feed, shared by every `JobQueue` handed
    /// out for that feed.
    maintenance_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Engine<MemoryStore> {
    /// Create an engine with in-memory storage (for testing).
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }
}

impl<S: Store + ?Sized> Engine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_notifier(store, Notifier::default())
    }

    pub fn with_notifier(store: Arc<S>, notifier: Notifier) -> Self {
        Self {
            store,
            notifier,
            result_ttl: DEFAULT_RESULT_TTL,
            maintenance_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Keep finish results for `ttl`. Older results are dropped by the next
    /// maintenance pass on their feed.
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The event stream every transition is published to.
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Create a feed. Returns true if it was new, in which case a
    /// `FeedCreated` event is published.
    pub async fn create_feed(&self, feed: &str) -> Result<bool> {
        let created = self.store.create_feed(feed).await?;
        if created {
            info!(feed, "feed created");
            self.notifier.publish(feed, EventKind::FeedCreated);
        }
        Ok(created)
    }

    pub async fn feed_exists(&self, feed: &str) -> Result<bool> {
        self.store.feed_exists(feed).await
    }

    /// Handle for an existing feed.
    pub async fn job(&self, feed: &str) -> Result<JobQueue<S>> {
        if !self.store.feed_exists(feed).await? {
            return Err(Error::FeedDoesNotExist(feed.to_string()));
        }
        Ok(self.queue_handle(feed))
    }

    /// Handle for a feed, creating the feed first if needed.
    pub async fn create_job(&self, feed: &str) -> Result<JobQueue<S>> {
        self.create_feed(feed).await?;
        Ok(self.queue_handle(feed))
    }

    fn queue_handle(&self, feed: &str) -> JobQueue<S> {
        let lock = {
            let mut locks = self
                .maintenance_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(feed.to_string()).or_default())
        };
        JobQueue::new(
            Arc::clone(&self.store),
            self.notifier.clone(),
            feed.to_string(),
            self.result_ttl,
            lock,
        )
    }
}
