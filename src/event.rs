//! Structured events emitted by the engine on every successful transition.
//!
//! Listeners subscribe to build dashboards, result collectors, or audit
//! logs. Events are published after the transition has committed, so a lost
//! event never means a lost transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::JobId;

/// A structured event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// Feed the job belongs to.
    pub feed: String,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    FeedCreated,
    Published {
        id: JobId,
        content: Vec<u8>,
        priority: bool,
    },
    Claimed {
        id: JobId,
    },
    Cancelled {
        id: JobId,
        failure_count: u64,
    },
    Stalled {
        id: JobId,
    },
    Retried {
        id: JobId,
    },
    Finished {
        id: JobId,
        /// `None` when the worker supplied no result.
        result: Option<Vec<u8>>,
    },
    Retracted {
        id: JobId,
    },
    /// Put back on the queue by maintenance after a partial failure.
    Restored {
        id: JobId,
    },
}

/// Discriminant of [`EventKind`], used to register handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    FeedCreated,
    Published,
    Claimed,
    Cancelled,
    Stalled,
    Retried,
    Finished,
    Retracted,
    Restored,
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::FeedCreated => EventType::FeedCreated,
            EventKind::Published { .. } => EventType::Published,
            EventKind::Claimed { .. } => EventType::Claimed,
            EventKind::Cancelled { .. } => EventType::Cancelled,
            EventKind::Stalled { .. } => EventType::Stalled,
            EventKind::Retried { .. } => EventType::Retried,
            EventKind::Finished { .. } => EventType::Finished,
            EventKind::Retracted { .. } => EventType::Retracted,
            EventKind::Restored { .. } => EventType::Restored,
        }
    }

    /// The job this event concerns, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            EventKind::FeedCreated => None,
            EventKind::Published { id, .. }
            | EventKind::Claimed { id }
            | EventKind::Cancelled { id, .. }
            | EventKind::Stalled { id }
            | EventKind::Retried { id }
            | EventKind::Finished { id, .. }
            | EventKind::Retracted { id }
            | EventKind::Restored { id } => Some(*id),
        }
    }
}
