//! Job lifecycle span helpers.
//!
//! Provides span creation and state-transition recording for jobs
//! moving through a feed.

use tracing::Span;

use crate::model::JobId;

/// Start a span for one job on one feed.
///
/// The `job.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_job_span(feed: &str, job_id: &JobId) -> Span {
    tracing::debug_span!(
        "job.transition",
        "job.feed" = feed,
        "job.id" = %job_id,
        "job.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and emit a debug event in it.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
