//! # requestq
//!
//! Queue-backed request processing. Clients submit queries, a worker pool
//! pulls them from a durable queue, processes them, and posts results back.
//!
//! Provides a pooled, retrying broker client (pgmq over Postgres, or an
//! in-process broker for tests), the task lifecycle tracker, a Postgres
//! task store, a polling worker, and OpenTelemetry observability.

pub mod broker;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod worker;
