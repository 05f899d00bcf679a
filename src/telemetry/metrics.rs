//! Metric instrument factories for jobq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"jobq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for jobq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("jobq")
}

/// Counter: jobs published.
/// Labels: `feed`, `priority`.
pub fn jobs_published() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.published")
        .with_description("Number of jobs published")
        .build()
}

/// Counter: job state transitions.
/// Labels: `feed`, `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: feed-level operations (put, get, get_empty, retract, maintenance).
/// Labels: `feed`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("jobq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: jobs put back on the queue by maintenance.
/// Labels: `feed`.
pub fn maintenance_restored() -> Counter<u64> {
    meter()
        .u64_counter("jobq.maintenance.restored")
        .with_description("Jobs restored to the queue by maintenance")
        .build()
}

/// Counter: finish results dropped after their TTL.
/// Labels: `feed`.
pub fn results_pruned() -> Counter<u64> {
    meter()
        .u64_counter("jobq.maintenance.results_pruned")
        .with_description("Finish results dropped by maintenance")
        .build()
}

/// Histogram: time a `get` spent waiting, in milliseconds.
/// Labels: `feed`.
pub fn claim_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobq.claim.wait_ms")
        .with_description("Time spent waiting for a job to claim")
        .with_unit("ms")
        .build()
}
