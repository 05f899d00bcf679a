//! One LISTEN connection per [`Db`](super::Db), fanned out to blocked claims
//! through a `Notify` per feed.
//!
//! A listener holds a pooled connection for as long as it lives, so blocked
//! claims must never open their own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::READY_CHANNEL;
use crate::error::Result;

#[derive(Debug, Default)]
pub(super) struct Wakers {
    feeds: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Wakers {
    pub(super) fn for_feed(&self, feed: &str) -> Arc<Notify> {
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(feeds.entry(feed.to_string()).or_default())
    }

    pub(super) fn wake(&self, feed: &str) {
        let feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ready) = feeds.get(feed) {
            ready.notify_waiters();
        }
    }

    fn wake_all(&self) {
        let feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        for ready in feeds.values() {
            ready.notify_waiters();
        }
    }
}

async fn listen(pool: &PgPool) -> Result<PgListener> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(READY_CHANNEL).await?;
    Ok(listener)
}

/// Start listening, then hand the connection to a background task. LISTEN is
/// in effect when this returns unless the first attempt failed, in which case
/// claims fall back to polling until the task reconnects.
pub(super) async fn spawn(pool: PgPool, wakers: Arc<Wakers>, retry: Duration) -> JoinHandle<()> {
    let initial = match listen(&pool).await {
        Ok(listener) => Some(listener),
        Err(e) => {
            warn!("cannot listen on {READY_CHANNEL}: {e}, polling until reconnected");
            None
        }
    };
    tokio::spawn(run(pool, wakers, retry, initial))
}

async fn run(pool: PgPool, wakers: Arc<Wakers>, retry: Duration, mut listener: Option<PgListener>) {
    info!(channel = READY_CHANNEL, "ready listener started");
    loop {
        if listener.is_none() {
            tokio::time::sleep(retry).await;
            match listen(&pool).await {
                Ok(reconnected) => {
                    info!(channel = READY_CHANNEL, "ready listener reconnected");
                    listener = Some(reconnected);
                    wakers.wake_all();
                }
                Err(e) => {
                    warn!("ready listener reconnect failed: {e}");
                    continue;
                }
            }
        }
        let Some(active) = listener.as_mut() else {
            continue;
        };

        match active.try_recv().await {
            Ok(Some(notification)) => {
                debug!(feed = notification.payload(), "ready notification");
                wakers.wake(notification.payload());
            }
            // Connection dropped; sqlx reconnects on the next call but
            // anything sent in between is lost.
            Ok(None) => wakers.wake_all(),
            Err(e) => {
                warn!("ready listener failed: {e}, reconnecting");
                listener = None;
                wakers.wake_all();
            }
        }
    }
}
