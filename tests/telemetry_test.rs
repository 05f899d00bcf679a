//! Integration tests for telemetry initialization and span helpers.

use jobq::model::JobId;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = jobq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "jobq-test".to_string(),
        log_level: "debug".to_string(),
    };
    let _guard = jobq::telemetry::init_telemetry(config);
}

#[test]
fn job_span_creates_and_records_transition() {
    let id = JobId::new();
    let span = jobq::telemetry::job::start_job_span("testjob", &id);
    jobq::telemetry::job::record_state_transition(&span, "queued", "claimed");
}
