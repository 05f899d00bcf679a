//! Reconciliation: put jobs that fell out of every index back on the queue.
//!
//! A crash between two store writes can leave an item that is neither
//! queued, claimed, nor stalled. Such a job would never be dispatched again.
//! Maintenance finds these ids and restores them at the head of the queue.
//! Ids present in two indexes at once are not repaired here.
//!
//! Each pass also drops finish results older than the engine's result TTL.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::queue::JobQueue;
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::{FeedSnapshot, JobId, now_ms};
use crate::store::Store;
use crate::telemetry::metrics;

/// Ids present in `items` but in none of queued, claimed, stalled.
pub fn unaccounted(snapshot: &FeedSnapshot) -> Vec<JobId> {
    let accounted: HashSet<&JobId> = snapshot
        .queued
        .iter()
        .chain(&snapshot.claimed)
        .chain(&snapshot.stalled)
        .collect();
    snapshot
        .items
        .iter()
        .filter(|id| !accounted.contains(id))
        .copied()
        .collect()
}

impl<S: Store + ?Sized> JobQueue<S> {
    /// Run one reconciliation pass. Returns the ids restored to the queue.
    ///
    /// Passes for the same feed are serialized within this engine. A job
    /// that moves normally between the read and the restore is skipped by
    /// the store; at worst a job is handed out twice, which callers must
    /// already tolerate as an implicit cancel.
    pub async fn maintenance(&self) -> Result<Vec<JobId>> {
        let _pass = self.maintenance_lock.lock().await;

        self.prune_results().await?;

        let snapshot = self.store.snapshot(&self.feed).await?;
        let orphans = unaccounted(&snapshot);
        if orphans.is_empty() {
            return Ok(Vec::new());
        }

        let restored = self.store.restore(&self.feed, &orphans).await?;
        self.count_operation("maintenance");
        metrics::maintenance_restored().add(
            restored.len() as u64,
            &[KeyValue::new("feed", self.feed.clone())],
        );
        for id in &restored {
            info!(feed = %self.feed, job.id = %id, "restored unaccounted job");
            self.notifier
                .publish(&self.feed, EventKind::Restored { id: *id });
        }
        Ok(restored)
    }

    async fn prune_results(&self) -> Result<()> {
        let ttl_ms = i64::try_from(self.result_ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms().saturating_sub(ttl_ms);
        let pruned = self.store.prune_results(&self.feed, cutoff).await?;
        if pruned > 0 {
            metrics::results_pruned()
                .add(pruned, &[KeyValue::new("feed", self.feed.clone())]);
            info!(feed = %self.feed, pruned, "pruned expired results");
        }
        Ok(())
    }
}

/// Configuration for the periodic reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between passes. The first pass runs immediately.
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Runs maintenance over a set of feeds on a timer until shut down.
pub struct Reconciler<S: Store + ?Sized> {
    queues: Arc<Vec<JobQueue<S>>>,
    config: ReconcilerConfig,
    shutdown: Arc<Notify>,
}

impl<S: Store + ?Sized> Clone for Reconciler<S> {
    fn clone(&self) -> Self {
        Self {
            queues: Arc::clone(&self.queues),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<S: Store + ?Sized> Reconciler<S> {
    /// Fails with [`Error::Config`] if the interval is zero.
    pub fn new(queues: Vec<JobQueue<S>>, config: ReconcilerConfig) -> Result<Self> {
        if config.interval.is_zero() {
            return Err(Error::Config(
                "maintenance interval must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            queues: Arc::new(queues),
            config,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Signal the reconciler to stop after the current pass.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run passes until shutdown.
    pub async fn run(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            feeds = self.queues.len(),
            interval_secs = self.config.interval.as_secs(),
            "reconciler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("reconciler shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }
    }

    /// One pass over every feed. Errors are logged and do not stop the
    /// remaining feeds. Returns the number of jobs restored.
    pub async fn run_once(&self) -> usize {
        let mut total = 0;
        for queue in self.queues.iter() {
            match queue.maintenance().await {
                Ok(restored) => total += restored.len(),
                Err(e) => error!(feed = queue.feed(), "maintenance failed: {e}"),
            }
        }
        total
    }
}
