//! Integration tests for telemetry initialization and span helpers.

use requestq::model::TaskId;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = requestq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "requestq-test".to_string(),
        log_level: "debug".to_string(),
    };
    // Err if another test in this process already set a global subscriber.
    if let Ok(guard) = requestq::telemetry::init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn task_span_creates_and_records_transition() {
    let span = requestq::telemetry::task::start_task_span(&TaskId(42));
    requestq::telemetry::task::record_state_transition(&span, "pending", "completed");
}

#[test]
fn metric_instruments_build_without_provider() {
    use opentelemetry::KeyValue;
    requestq::telemetry::metrics::retry_attempts().add(1, &[KeyValue::new("operation", "test")]);
    requestq::telemetry::metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("operation", "enqueue"),
            KeyValue::new("outcome", "ok"),
        ],
    );
    requestq::telemetry::metrics::broker_calls().add(1, &[KeyValue::new("call", "send")]);
    requestq::telemetry::metrics::operation_duration_ms()
        .record(1.5, &[KeyValue::new("operation", "test")]);
}
