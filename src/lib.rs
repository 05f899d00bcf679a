//! # jobq
//!
//! Durable job feeds. Producers put opaque payloads on a named feed;
//! workers claim them one at a time and finish, cancel, or stall them.
//! Every transition is one atomic store procedure, so any number of
//! workers in any number of processes can share a feed.
//!
//! Ships an in-memory store and a Postgres store, a typed event bus for
//! observing transitions, a reconciler that repairs jobs orphaned by
//! partial failures, and OpenTelemetry observability.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod notify;
pub mod store;
pub mod telemetry;

pub use engine::{Engine, JobQueue};
pub use error::{Error, Result};
pub use model::{ClaimedJob, JobId, JobState};
