//! Event fan-out: a typed broadcast bus plus a callback registry.
//!
//! Delivery is best-effort and at-most-once. Publishing never blocks the
//! caller beyond the send itself and never fails a transition; a receiver
//! that falls behind the channel capacity skips the oldest events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::event::{Event, EventKind, EventType};

/// Default number of events buffered per receiver.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Publishing side of the event bus. Cheap to clone; clones share the
/// channel and the sequence counter.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Event>,
    seq: Arc<AtomicU64>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event to all current subscribers. Returns the event's
    /// sequence number.
    pub fn publish(&self, feed: &str, kind: EventKind) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let event = Event {
            seq,
            timestamp: Utc::now(),
            feed: feed.to_string(),
            kind,
        };
        // No subscribers is not an error: the event is simply dropped.
        if let Err(e) = self.tx.send(event) {
            debug!(seq, feed, kind = ?e.0.kind.event_type(), "event dropped, no subscribers");
        }
        seq
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;
type HandlerTable = RwLock<HashMap<EventType, Vec<(HandlerId, Handler)>>>;

/// Identifies a registered handler so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Invokes registered callbacks for every event on a [`Notifier`].
///
/// Runs on a background tokio task. Handlers run on that task, one event at
/// a time, so a slow handler delays later events but never the publisher.
pub struct Listener {
    handlers: Arc<HandlerTable>,
    next_id: AtomicU64,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Listener {
    /// Subscribe to `notifier` and start dispatching. Must be called from
    /// within a tokio runtime. Events published after this returns are seen.
    pub fn spawn(notifier: &Notifier) -> Self {
        let mut rx = notifier.subscribe();
        let handlers: Arc<HandlerTable> = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = Arc::new(Notify::new());

        let task = {
            let handlers = Arc::clone(&handlers);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        recv = rx.recv() => match recv {
                            Ok(event) => dispatch(&handlers, &event),
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "event listener lagged, events dropped");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            })
        };

        Self {
            handlers,
            next_id: AtomicU64::new(0),
            shutdown,
            task,
        }
    }

    /// Register a callback for one event type. Several handlers may be
    /// registered for the same type; all of them are invoked.
    pub fn register_handler<F>(&self, event_type: EventType, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut table = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for entries in table.values_mut() {
            let before = entries.len();
            entries.retain(|(hid, _)| *hid != id);
            removed |= entries.len() != before;
        }
        removed
    }

    /// Stop dispatching and wait for the background task to exit.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            warn!("event listener task ended abnormally: {e}");
        }
    }
}

fn dispatch(handlers: &HandlerTable, event: &Event) {
    // Clone the matching handlers so callbacks run without the lock held and
    // may themselves register or remove handlers.
    let matching: Vec<Handler> = handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&event.kind.event_type())
        .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
        .unwrap_or_default();

    for handler in matching {
        handler(event);
    }
}
