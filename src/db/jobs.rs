//! Job feed procedures as SQL transactions.
//!
//! Claims pop with `FOR UPDATE SKIP LOCKED`, so concurrent workers never see
//! the same queued row. Every write that makes an id claimable also issues
//! `pg_notify` inside its transaction; the notification only fires on commit.
//!
//! Row locks are taken in one order everywhere: the `jobq_queued` row, then
//! the `jobq_items` row, then the other index rows. A claim holds its queued
//! row while its insert into `jobq_claimed` waits on the item row, so any
//! procedure that locks an item must not then wait on a queued row.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgExecutor, Postgres, Transaction};
use tokio::time::Instant;
use uuid::Uuid;

use super::{Db, READY_CHANNEL};
use crate::error::{Error, Result};
use crate::model::{ClaimedJob, FeedSnapshot, FeedStats, JobId, JobState, NewJob, now_ms};
use crate::store::Store;

/// Validate a state transition, returning an error if disallowed.
fn validate_transition(from: JobState, to: JobState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::Other(format!("illegal transition: {from} -> {to}")))
    }
}

async fn notify_ready(tx: &mut Transaction<'_, Postgres>, feed: &str) -> Result<()> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(READY_CHANNEL)
        .bind(feed)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn enqueue_tail(tx: &mut Transaction<'_, Postgres>, feed: &str, id: Uuid) -> Result<()> {
    sqlx::query(
        "INSERT INTO jobq_queued (feed, id, position, queued_at)
         VALUES ($1, $2, nextval('jobq_tail_seq'), $3)",
    )
    .bind(feed)
    .bind(id)
    .bind(now_ms())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn feed_exists<'e, E: PgExecutor<'e>>(executor: E, feed: &str) -> Result<bool> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM jobq_feeds WHERE name = $1")
        .bind(feed)
        .fetch_optional(executor)
        .await?;
    Ok(row.is_some())
}

async fn require_feed<'e, E: PgExecutor<'e>>(executor: E, feed: &str) -> Result<()> {
    if feed_exists(executor, feed).await? {
        Ok(())
    } else {
        Err(Error::FeedDoesNotExist(feed.to_string()))
    }
}

/// `err`, or `FeedDoesNotExist` when the precondition failed because the
/// whole feed is missing.
async fn precondition_failed<'e, E: PgExecutor<'e>>(
    executor: E,
    feed: &str,
    err: Error,
) -> Result<Error> {
    if feed_exists(executor, feed).await? {
        Ok(err)
    } else {
        Ok(Error::FeedDoesNotExist(feed.to_string()))
    }
}

/// Lock the item row. Returns false if the item does not exist.
async fn lock_item(tx: &mut Transaction<'_, Postgres>, feed: &str, id: Uuid) -> Result<bool> {
    let row: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM jobq_items WHERE feed = $1 AND id = $2 FOR UPDATE")
            .bind(feed)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
    Ok(row.is_some())
}

/// Remove a claim. Returns false if the id was not claimed.
async fn release_claim(tx: &mut Transaction<'_, Postgres>, feed: &str, id: Uuid) -> Result<bool> {
    let rows = sqlx::query("DELETE FROM jobq_claimed WHERE feed = $1 AND id = $2")
        .bind(feed)
        .bind(id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    Ok(rows == 1)
}

impl Db {
    /// One non-blocking pop-and-claim attempt.
    async fn try_claim(&self, feed: &str) -> Result<Option<ClaimedJob>> {
        validate_transition(JobState::Queued, JobState::Claimed)?;
        let mut tx = self.pool().begin().await?;

        let popped: Option<(Uuid,)> = sqlx::query_as(
            "WITH next AS (
                 SELECT feed, id FROM jobq_queued
                 WHERE feed = $1
                 ORDER BY position
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             DELETE FROM jobq_queued q USING next
             WHERE q.feed = next.feed AND q.id = next.id
             RETURNING q.id",
        )
        .bind(feed)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id,)) = popped else {
            return Ok(None);
        };

        sqlx::query("INSERT INTO jobq_claimed (feed, id, claimed_at) VALUES ($1, $2, $3)")
            .bind(feed)
            .bind(id)
            .bind(now_ms())
            .execute(&mut *tx)
            .await?;

        let (content, failures): (Vec<u8>, Option<i64>) = sqlx::query_as(
            "SELECT i.content, c.failures
             FROM jobq_items i
             LEFT JOIN jobq_cancelled c ON c.feed = i.feed AND c.id = i.id
             WHERE i.feed = $1 AND i.id = $2",
        )
        .bind(feed)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(ClaimedJob {
            id: JobId(id),
            content,
            failure_count: failures.unwrap_or(0) as u64,
        }))
    }
}

#[async_trait]
impl Store for Db {
    async fn create_feed(&self, feed: &str) -> Result<bool> {
        let rows = sqlx::query("INSERT INTO jobq_feeds (name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(feed)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(rows == 1)
    }

    async fn feed_exists(&self, feed: &str) -> Result<bool> {
        feed_exists(self.pool(), feed).await
    }

    async fn publish(&self, feed: &str, job: &NewJob) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        let rows = sqlx::query("UPDATE jobq_feeds SET published = published + 1 WHERE name = $1")
            .bind(feed)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if rows == 0 {
            return Err(Error::FeedDoesNotExist(feed.to_string()));
        }

        let rows = sqlx::query(
            "INSERT INTO jobq_items (feed, id, content, submitted_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT DO NOTHING",
        )
        .bind(feed)
        .bind(job.id.0)
        .bind(&job.content)
        .bind(job.submitted_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if rows == 0 {
            return Err(Error::JobExists(job.id));
        }

        let position = if job.priority {
            "-nextval('jobq_head_seq')"
        } else {
            "nextval('jobq_tail_seq')"
        };
        sqlx::query(&format!(
            "INSERT INTO jobq_queued (feed, id, position, queued_at) VALUES ($1, $2, {position}, $3)"
        ))
        .bind(feed)
        .bind(job.id.0)
        .bind(job.submitted_at)
        .execute(&mut *tx)
        .await?;

        notify_ready(&mut tx, feed).await?;
        tx.commit().await?;
        self.wake(feed);
        Ok(())
    }

    async fn claim(&self, feed: &str, timeout: Option<Duration>) -> Result<Option<ClaimedJob>> {
        require_feed(self.pool(), feed).await?;
        let deadline = timeout.map(|t| Instant::now() + t);

        if let Some(job) = self.try_claim(feed).await? {
            return Ok(Some(job));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(None);
        }

        // Only claims that have to wait need the listener.
        let ready = self.ready(feed).await;
        loop {
            // Register before checking so a wakeup between the check and
            // the wait is not lost.
            let notified = ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.try_claim(feed).await? {
                return Ok(Some(job));
            }

            let wait = match deadline {
                None => self.poll_interval,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    (deadline - now).min(self.poll_interval)
                }
            };

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn finish(&self, feed: &str, id: JobId, result: Option<&[u8]>) -> Result<()> {
        validate_transition(JobState::Claimed, JobState::Finished)?;
        let mut tx = self.pool().begin().await?;

        if !lock_item(&mut tx, feed, id.0).await? || !release_claim(&mut tx, feed, id.0).await? {
            return Err(precondition_failed(&mut *tx, feed, Error::JobNotClaimed(id)).await?);
        }

        // Cascades to jobq_cancelled.
        sqlx::query("DELETE FROM jobq_items WHERE feed = $1 AND id = $2")
            .bind(feed)
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        if let Some(result) = result {
            sqlx::query(
                "INSERT INTO jobq_results (feed, id, result, finished_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (feed, id) DO UPDATE SET result = EXCLUDED.result, finished_at = EXCLUDED.finished_at",
            )
            .bind(feed)
            .bind(id.0)
            .bind(result)
            .bind(now_ms())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE jobq_feeds SET finished = finished + 1 WHERE name = $1")
            .bind(feed)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn cancel(&self, feed: &str, id: JobId) -> Result<u64> {
        validate_transition(JobState::Claimed, JobState::Queued)?;
        let mut tx = self.pool().begin().await?;

        if !lock_item(&mut tx, feed, id.0).await? || !release_claim(&mut tx, feed, id.0).await? {
            return Err(precondition_failed(&mut *tx, feed, Error::JobNotClaimed(id)).await?);
        }

        let (failures,): (i64,) = sqlx::query_as(
            "INSERT INTO jobq_cancelled (feed, id, failures) VALUES ($1, $2, 1)
             ON CONFLICT (feed, id) DO UPDATE SET failures = jobq_cancelled.failures + 1
             RETURNING failures",
        )
        .bind(feed)
        .bind(id.0)
        .fetch_one(&mut *tx)
        .await?;

        enqueue_tail(&mut tx, feed, id.0).await?;
        notify_ready(&mut tx, feed).await?;
        tx.commit().await?;
        self.wake(feed);
        Ok(failures as u64)
    }

    async fn stall(&self, feed: &str, id: JobId) -> Result<()> {
        validate_transition(JobState::Claimed, JobState::Stalled)?;
        let mut tx = self.pool().begin().await?;

        if !lock_item(&mut tx, feed, id.0).await? || !release_claim(&mut tx, feed, id.0).await? {
            return Err(precondition_failed(&mut *tx, feed, Error::JobNotClaimed(id)).await?);
        }

        sqlx::query("INSERT INTO jobq_stalled (feed, id, stalled_at) VALUES ($1, $2, $3)")
            .bind(feed)
            .bind(id.0)
            .bind(now_ms())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn retry(&self, feed: &str, id: JobId) -> Result<()> {
        validate_transition(JobState::Stalled, JobState::Queued)?;
        let mut tx = self.pool().begin().await?;

        let stalled = lock_item(&mut tx, feed, id.0).await?
            && sqlx::query("DELETE FROM jobq_stalled WHERE feed = $1 AND id = $2")
                .bind(feed)
                .bind(id.0)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                == 1;
        if !stalled {
            return Err(precondition_failed(&mut *tx, feed, Error::JobNotStalled(id)).await?);
        }

        enqueue_tail(&mut tx, feed, id.0).await?;
        notify_ready(&mut tx, feed).await?;
        tx.commit().await?;
        self.wake(feed);
        Ok(())
    }

    async fn retract(&self, feed: &str, id: JobId) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        // Queued row before item row, the same order a claim uses. Waits for
        // an in-flight claim of this id to commit, after which the job is
        // claimed and still retractable.
        sqlx::query("SELECT id FROM jobq_queued WHERE feed = $1 AND id = $2 FOR UPDATE")
            .bind(feed)
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?;

        if !lock_item(&mut tx, feed, id.0).await? {
            return Err(precondition_failed(&mut *tx, feed, Error::ItemDoesNotExist(id)).await?);
        }

        // Cascades to queued, claimed, stalled and cancelled rows.
        sqlx::query("DELETE FROM jobq_items WHERE feed = $1 AND id = $2")
            .bind(feed)
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn item_ids(&self, feed: &str) -> Result<Vec<JobId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT i.id
             FROM jobq_items i
             LEFT JOIN jobq_queued q ON q.feed = i.feed AND q.id = i.id
             WHERE i.feed = $1
             ORDER BY (q.position IS NULL), q.position, i.submitted_at, i.id",
        )
        .bind(feed)
        .fetch_all(self.pool())
        .await?;
        if rows.is_empty() {
            require_feed(self.pool(), feed).await?;
        }
        Ok(rows.into_iter().map(|(id,)| JobId(id)).collect())
    }

    async fn failure_count(&self, feed: &str, id: JobId) -> Result<u64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT failures FROM jobq_cancelled WHERE feed = $1 AND id = $2")
                .bind(feed)
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;
        match row {
            Some((n,)) => Ok(n as u64),
            None => require_feed(self.pool(), feed).await.map(|()| 0),
        }
    }

    async fn result(&self, feed: &str, id: JobId) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT result FROM jobq_results WHERE feed = $1 AND id = $2")
                .bind(feed)
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;
        match row {
            Some((result,)) => Ok(Some(result)),
            None => require_feed(self.pool(), feed).await.map(|()| None),
        }
    }

    async fn prune_results(&self, feed: &str, finished_before: i64) -> Result<u64> {
        let pruned = sqlx::query("DELETE FROM jobq_results WHERE feed = $1 AND finished_at < $2")
            .bind(feed)
            .bind(finished_before)
            .execute(self.pool())
            .await?
            .rows_affected();
        if pruned == 0 {
            require_feed(self.pool(), feed).await?;
        }
        Ok(pruned)
    }

    async fn state(&self, feed: &str, id: JobId) -> Result<Option<JobState>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT CASE
                 WHEN EXISTS (SELECT 1 FROM jobq_claimed c WHERE c.feed = i.feed AND c.id = i.id) THEN 'claimed'
                 WHEN EXISTS (SELECT 1 FROM jobq_stalled s WHERE s.feed = i.feed AND s.id = i.id) THEN 'stalled'
                 WHEN EXISTS (SELECT 1 FROM jobq_queued q WHERE q.feed = i.feed AND q.id = i.id) THEN 'queued'
             END
             FROM jobq_items i
             WHERE i.feed = $1 AND i.id = $2",
        )
        .bind(feed)
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some((state,)) => state.map(|s| s.parse()).transpose(),
            None => require_feed(self.pool(), feed).await.map(|()| None),
        }
    }

    async fn snapshot(&self, feed: &str) -> Result<FeedSnapshot> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;
        require_feed(&mut *tx, feed).await?;

        let mut snapshot = FeedSnapshot::default();
        for (table, target) in [
            ("jobq_items", &mut snapshot.items),
            ("jobq_queued", &mut snapshot.queued),
            ("jobq_claimed", &mut snapshot.claimed),
            ("jobq_stalled", &mut snapshot.stalled),
        ] {
            let rows: Vec<(Uuid,)> =
                sqlx::query_as(&format!("SELECT id FROM {table} WHERE feed = $1"))
                    .bind(feed)
                    .fetch_all(&mut *tx)
                    .await?;
            *target = rows.into_iter().map(|(id,)| JobId(id)).collect();
        }

        tx.commit().await?;
        Ok(snapshot)
    }

    async fn restore(&self, feed: &str, ids: &[JobId]) -> Result<Vec<JobId>> {
        let mut tx = self.pool().begin().await?;
        require_feed(&mut *tx, feed).await?;
        let mut restored = Vec::new();

        for id in ids {
            if !lock_item(&mut tx, feed, id.0).await? {
                continue;
            }

            let rows = sqlx::query(
                "INSERT INTO jobq_queued (feed, id, position, queued_at)
                 SELECT $1, $2, -nextval('jobq_head_seq'), $3
                 WHERE NOT EXISTS (SELECT 1 FROM jobq_queued WHERE feed = $1 AND id = $2)
                   AND NOT EXISTS (SELECT 1 FROM jobq_claimed WHERE feed = $1 AND id = $2)
                   AND NOT EXISTS (SELECT 1 FROM jobq_stalled WHERE feed = $1 AND id = $2)",
            )
            .bind(feed)
            .bind(id.0)
            .bind(now_ms())
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if rows == 1 {
                restored.push(*id);
            }
        }

        if !restored.is_empty() {
            notify_ready(&mut tx, feed).await?;
        }
        tx.commit().await?;
        if !restored.is_empty() {
            self.wake(feed);
        }
        Ok(restored)
    }

    async fn stats(&self, feed: &str) -> Result<FeedStats> {
        let row: Option<(i64, i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT
                 (SELECT COUNT(*) FROM jobq_queued WHERE feed = $1),
                 (SELECT COUNT(*) FROM jobq_claimed WHERE feed = $1),
                 (SELECT COUNT(*) FROM jobq_stalled WHERE feed = $1),
                 f.published,
                 f.finished
             FROM jobq_feeds f
             WHERE f.name = $1",
        )
        .bind(feed)
        .fetch_optional(self.pool())
        .await?;

        let (queued, claimed, stalled, published, finished) =
            row.ok_or_else(|| Error::FeedDoesNotExist(feed.to_string()))?;
        Ok(FeedStats {
            queued: queued as u64,
            claimed: claimed as u64,
            stalled: stalled as u64,
            published: published as u64,
            finished: finished as u64,
        })
    }
}
