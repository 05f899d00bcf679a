//! PostgreSQL-backed store: connection pool, migrations, and health check.
//!
//! Every store procedure runs as one SQL transaction, so transitions stay
//! atomic across any number of worker processes sharing the database.

pub mod jobs;
mod listener;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{Notify, OnceCell};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use listener::Wakers;

/// Channel used to wake blocked claims when an id is queued.
pub const READY_CHANNEL: &str = "jobq_ready";

/// Database handle. Owns the connection pool shared by all feeds.
pub struct Db {
    pool: PgPool,
    /// Upper bound on how long a blocked claim sleeps between attempts when
    /// no notification arrives.
    poll_interval: Duration,
    wakers: Arc<Wakers>,
    /// Single LISTEN task shared by every blocked claim. Started on the
    /// first claim that has to wait.
    listener: OnceCell<JoinHandle<()>>,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: Duration::from_millis(500),
            wakers: Arc::new(Wakers::default()),
            listener: OnceCell::new(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Migration(e.to_string()))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Wakeup handle for `feed`, starting the shared listener if needed.
    pub(crate) async fn ready(&self, feed: &str) -> Arc<Notify> {
        self.listener
            .get_or_init(|| {
                listener::spawn(
                    self.pool.clone(),
                    Arc::clone(&self.wakers),
                    self.poll_interval,
                )
            })
            .await;
        self.wakers.for_feed(feed)
    }

    /// Wake claims in this process waiting on `feed`.
    pub(crate) fn wake(&self, feed: &str) {
        self.wakers.wake(feed);
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Some(task) = self.listener.get() {
            task.abort();
        }
    }
}
