//! Task span helpers.
//!
//! Provides span creation and state-transition recording for tasks
//! moving through the lifecycle.

use crate::model::TaskId;
use tracing::Span;

/// Start a span for work on one task.
///
/// The `task.status` field is declared empty and can be filled in by the
/// caller once the outcome is known.
pub fn start_task_span(task_id: &TaskId) -> Span {
    tracing::info_span!(
        "task.process",
        "task.id" = %task_id,
        "task.status" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
