//! Core data model.
//!
//! A job is an opaque payload published to a named feed. Its lifecycle state
//! is not stored as a field: stores derive it from which index (queued,
//! claimed, stalled) currently holds the id.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Job id
// ---------------------------------------------------------------------------

/// Random 128-bit job identifier, rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|_| Error::InvalidJobId(s.to_string()))
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for JobId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
///
/// `Finished` and `Retracted` are never stored: they describe a job that is
/// no longer present in any index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the dispatch queue.
    Queued,
    /// Held by exactly one worker.
    Claimed,
    /// Withheld from dispatch until retried.
    Stalled,
    /// Completed by its worker. Terminal.
    Finished,
    /// Removed by a producer. Terminal.
    Retracted,
}

impl JobState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Claimed)
                | (Queued, Retracted)
                | (Claimed, Finished)
                | (Claimed, Queued)     // cancel
                | (Claimed, Stalled)
                | (Claimed, Retracted)
                | (Stalled, Queued)     // retry
                | (Stalled, Retracted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Retracted)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Claimed => "claimed",
            JobState::Stalled => "stalled",
            JobState::Finished => "finished",
            JobState::Retracted => "retracted",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "claimed" => Ok(JobState::Claimed),
            "stalled" => Ok(JobState::Stalled),
            "finished" => Ok(JobState::Finished),
            "retracted" => Ok(JobState::Retracted),
            _ => Err(Error::Other(format!("unknown job state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Store payloads
// ---------------------------------------------------------------------------

/// A job about to be published.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub content: Vec<u8>,
    /// Milliseconds since the epoch.
    pub submitted_at: i64,
    /// Insert at the head of the queue instead of the tail.
    pub priority: bool,
}

/// A job handed to a worker by `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: JobId,
    pub content: Vec<u8>,
    /// Cancellations recorded against this job so far.
    pub failure_count: u64,
}

/// Point-in-time view of every index of a feed, used by reconciliation.
#[derive(Debug, Clone, Default)]
pub struct FeedSnapshot {
    pub items: Vec<JobId>,
    pub queued: Vec<JobId>,
    pub claimed: Vec<JobId>,
    pub stalled: Vec<JobId>,
}

/// Per-feed counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedStats {
    pub queued: u64,
    pub claimed: u64,
    pub stalled: u64,
    /// Successful puts over the life of the feed.
    pub published: u64,
    /// Successful finishes over the life of the feed.
    pub finished: u64,
}

/// Current time in milliseconds since the epoch.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
