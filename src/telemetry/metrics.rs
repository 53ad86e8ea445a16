//! Metric instrument factories for requestq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"requestq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for requestq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("requestq")
}

/// Counter: tasks submitted.
/// Labels: `result` ("ok" | "error").
pub fn tasks_submitted() -> Counter<u64> {
    meter()
        .u64_counter("requestq.tasks.submitted")
        .with_description("Number of tasks submitted")
        .build()
}

/// Counter: task status transitions.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("requestq.tasks.state_transitions")
        .with_description("Number of task status transitions")
        .build()
}

/// Counter: client-level queue operations, one per enqueue or dequeue call.
/// Labels: `queue`, `operation` ("enqueue" | "dequeue"), `outcome`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("requestq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: pgmq SQL calls (create, send, read, delete, archive, reject).
/// Several may back one queue operation.
/// Labels: `queue`, `call`.
pub fn broker_calls() -> Counter<u64> {
    meter()
        .u64_counter("requestq.broker.calls")
        .with_description("Number of pgmq function calls")
        .build()
}

/// Counter: broker connection lifecycle events.
/// Labels: `event` ("created" | "closed"), `reason` for closes.
pub fn broker_connections() -> Counter<u64> {
    meter()
        .u64_counter("requestq.broker.connections")
        .with_description("Broker connections opened and closed by the pool")
        .build()
}

/// Counter: retries after a transient failure.
/// Labels: `operation`.
pub fn retry_attempts() -> Counter<u64> {
    meter()
        .u64_counter("requestq.retry.attempts")
        .with_description("Retries after transient broker failures")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("requestq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
