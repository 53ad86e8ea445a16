//! Worker loop: poll the queue, process each task, post the result.
//!
//! A task whose processing fails stays `pending`. Its message has already
//! been acknowledged, so nothing redelivers it; there is no failed state.

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::lifecycle::Tracker;
use crate::store::TaskStore;
use crate::telemetry::task::{record_state_transition, start_task_span};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info};
use uuid::Uuid;

/// Turns a query into a result.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, query: &str) -> Result<String>;
}

/// Answers every query with a fixed acknowledgement of it.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoProcessor;

#[async_trait]
impl Processor for EchoProcessor {
    async fn process(&self, query: &str) -> Result<String> {
        Ok(format!("Processed result for query: {query}"))
    }
}

/// Runs an executable with the query on stdin; its stdout is the result.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    pub command: PathBuf,
}

impl CommandProcessor {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Processor for CommandProcessor {
    async fn process(&self, query: &str) -> Result<String> {
        let mut child = Command::new(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(query.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Other(format!(
                "{} exited with {}: {}",
                self.command.display(),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue is empty or a poll failed.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Polls for tasks until shut down. Clones share the shutdown signal, so
/// several loops can run side by side.
pub struct Worker<S: TaskStore, B: Broker> {
    id: Uuid,
    tracker: Tracker<S, B>,
    processor: Arc<dyn Processor>,
    config: WorkerConfig,
    stopped: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl<S: TaskStore, B: Broker> Clone for Worker<S, B> {
    fn clone(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            tracker: self.tracker.clone(),
            processor: Arc::clone(&self.processor),
            config: self.config.clone(),
            stopped: Arc::clone(&self.stopped),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<S: TaskStore, B: Broker> Worker<S, B> {
    pub fn new(
        tracker: Tracker<S, B>,
        processor: Arc<dyn Processor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tracker,
            processor,
            config,
            stopped: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal every clone of this worker to stop after its current task.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(worker = %self.id, "worker started");

        while !self.is_stopped() {
            let idle = match self.process_one().await {
                Ok(processed) => !processed,
                Err(e) => {
                    error!(worker = %self.id, "poll error: {e}");
                    true
                }
            };

            // Drain without pausing while there is work.
            if idle {
                tokio::select! {
                    _ = self.shutdown.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(worker = %self.id, "worker shutting down");
        Ok(())
    }

    /// Fetch and process at most one task. Returns whether one was found.
    pub async fn process_one(&self) -> Result<bool> {
        let Some(dispatch) = self.tracker.fetch_next().await? else {
            debug!(worker = %self.id, "no tasks in queue");
            return Ok(false);
        };

        let id = dispatch.message.id;
        let span = start_task_span(&id);

        async {
            let start = Instant::now();
            match self.processor.process(&dispatch.message.query).await {
                Ok(result) => {
                    let duration_ms = start.elapsed().as_millis() as u64;
                    self.tracker.complete(id, result).await?;
                    info!(worker = %self.id, task_id = %id, duration_ms, "task processed");
                }
                Err(e) => {
                    record_state_transition(&span, "dequeued", "pending");
                    error!(
                        worker = %self.id,
                        task_id = %id,
                        error = %e,
                        "processing failed, task left pending"
                    );
                }
            }
            Ok::<_, Error>(true)
        }
        .instrument(span.clone())
        .await
    }
}
