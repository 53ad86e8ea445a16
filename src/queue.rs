//! Queue client: durable enqueue/dequeue over pooled broker connections.
//!
//! Every call checks a connection out of the pool, declares the queue on
//! it the first time that session is used, performs one broker operation
//! and returns the connection. Transient failures retry with the shared
//! fixed-delay policy; a failure that broke the session drops the
//! connection so the next attempt gets a fresh one. An attempt opens at
//! most one connection, so `max_retries` bounds every broker call made on
//! behalf of one enqueue or dequeue.
//!
//! Delivery is at-least-once. A message is acknowledged only after its
//! body decodes into a [`QueueMessage`]; if the process dies between the
//! fetch and the ack, the broker hands the message out again and nothing
//! here deduplicates it.

use crate::broker::{Broker, BrokerConnection};
use crate::error::{Error, Result};
use crate::model::{Dispatch, QueueMessage, Task};
use crate::pool::{ConnectionPool, PoolConfig, PooledConnection, PoolStats};
use crate::retry::{RetryExhausted, RetryPolicy};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    /// Declare the queue so its contents survive a broker restart.
    pub durable: bool,
    /// How long a fetched, unacknowledged message stays invisible (pgmq).
    pub visibility_timeout: Duration,
    /// Archive acknowledged messages instead of deleting them (pgmq).
    pub archive_on_ack: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "request_queue".to_string(),
            durable: true,
            visibility_timeout: Duration::from_secs(60),
            archive_on_ack: false,
        }
    }
}

/// Publishes task envelopes and hands them to workers.
pub struct QueueClient<B: Broker> {
    pool: ConnectionPool<B>,
    config: QueueConfig,
    retry: RetryPolicy,
}

impl<B: Broker> QueueClient<B> {
    pub fn new(broker: B, pool: PoolConfig, retry: RetryPolicy, config: QueueConfig) -> Self {
        Self {
            pool: ConnectionPool::new(broker, pool, retry),
            config,
            retry,
        }
    }

    /// Connect once and declare the queue, so a misconfigured broker fails
    /// at startup instead of on the first request.
    pub async fn init(&self) -> Result<()> {
        let conn = self.channel().await?;
        info!(
            queue = %self.config.name,
            durable = self.config.durable,
            max_connections = self.pool.config().max_connections,
            "queue client ready"
        );
        conn.release().await;
        Ok(())
    }

    /// Close all pooled connections. Further calls fail.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        info!(queue = %self.config.name, "queue client shut down");
    }

    pub fn queue_name(&self) -> &str {
        &self.config.name
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn broker(&self) -> &B {
        self.pool.broker()
    }

    /// A pooled connection with the queue declared on it.
    async fn channel(&self) -> Result<PooledConnection<'_, B>> {
        let conn = self.pool.acquire().await?;
        self.declared(conn).await
    }

    /// One attempt's connection: at most one connect, so the caller's retry
    /// loop owns the whole attempt budget.
    async fn attempt_channel(&self) -> Result<PooledConnection<'_, B>> {
        let conn = self.pool.try_acquire().await?;
        self.declared(conn).await
    }

    async fn declared<'a>(
        &self,
        mut conn: PooledConnection<'a, B>,
    ) -> Result<PooledConnection<'a, B>> {
        if !conn.is_declared(&self.config.name) {
            conn.declare_queue(&self.config.name, self.config.durable)
                .await?;
            conn.mark_declared(&self.config.name);
            debug!(queue = %self.config.name, connection = %conn.id(), "queue declared");
        }
        Ok(conn)
    }

    /// Publish `{id, query}` for `task` as a persistent message.
    ///
    /// Fails with [`Error::EnqueueFailed`] once the retry budget is spent.
    /// The task itself is not touched; callers keep it `pending`.
    pub async fn enqueue(&self, task: &Task) -> Result<()> {
        self.enqueue_message(&task.message()).await
    }

    pub async fn enqueue_message(&self, message: &QueueMessage) -> Result<()> {
        let body = serde_json::to_value(message)?;
        let start = Instant::now();

        let published = self
            .retry
            .run("queue.enqueue", |attempt| {
                let body = &body;
                async move {
                    let mut conn = self.attempt_channel().await?;
                    let msg_id = conn.publish(&self.config.name, body).await?;
                    debug!(task_id = %message.id, msg_id, attempt, "published");
                    conn.release().await;
                    Ok::<_, Error>(msg_id)
                }
            })
            .await;

        match published {
            Ok(_) => {
                self.record("enqueue", "ok", start);
                Ok(())
            }
            Err(exhausted) => {
                self.record("enqueue", "failed", start);
                let RetryExhausted {
                    attempts,
                    last_error,
                } = exhausted;
                error!(
                    task_id = %message.id,
                    queue = %self.config.name,
                    attempts,
                    error = %last_error,
                    "enqueue failed"
                );
                Err(Error::EnqueueFailed {
                    attempts,
                    reason: last_error.to_string(),
                })
            }
        }
    }

    /// Fetch at most one task without waiting. `Ok(None)` when the queue
    /// is empty.
    ///
    /// Fails with [`Error::DequeueFailed`] once the retry budget is spent,
    /// or with [`Error::MalformedMessage`] when the message body is not a
    /// task envelope (the message is rejected, not redelivered).
    pub async fn dequeue(&self) -> Result<Option<QueueMessage>> {
        Ok(self.dequeue_dispatch().await?.map(|d| d.message))
    }

    /// Like [`dequeue`](Self::dequeue), keeping the delivery count.
    pub async fn dequeue_dispatch(&self) -> Result<Option<Dispatch>> {
        let start = Instant::now();

        let fetched = self
            .retry
            .run("queue.dequeue", |attempt| async move {
                let mut conn = self.attempt_channel().await?;
                let Some(delivery) = conn.get(&self.config.name).await? else {
                    conn.release().await;
                    return Ok(None);
                };

                let message: QueueMessage = match serde_json::from_value(delivery.body.clone()) {
                    Ok(message) => message,
                    Err(e) => {
                        error!(
                            queue = %self.config.name,
                            tag = delivery.tag,
                            error = %e,
                            "malformed queue message, rejecting"
                        );
                        conn.reject(&self.config.name, delivery.tag).await?;
                        conn.release().await;
                        return Err(Error::MalformedMessage {
                            tag: delivery.tag,
                            reason: e.to_string(),
                        });
                    }
                };

                // Handed off: from here the caller owns the task. A failed ack
                // means the broker may deliver it again.
                if let Err(e) = conn.ack(&self.config.name, delivery.tag).await {
                    warn!(
                        task_id = %message.id,
                        tag = delivery.tag,
                        error = %e,
                        "ack failed, message may be redelivered"
                    );
                }
                conn.release().await;

                if delivery.delivery_count > 1 {
                    warn!(
                        task_id = %message.id,
                        delivery_count = delivery.delivery_count,
                        attempt,
                        "redelivered message"
                    );
                }
                Ok::<_, Error>(Some(Dispatch {
                    message,
                    delivery_count: delivery.delivery_count,
                }))
            })
            .await;

        match fetched {
            Ok(Some(dispatch)) => {
                self.record("dequeue", "ok", start);
                Ok(Some(dispatch))
            }
            Ok(None) => {
                self.record("dequeue", "empty", start);
                Ok(None)
            }
            Err(RetryExhausted {
                last_error: e @ Error::MalformedMessage { .. },
                ..
            }) => {
                self.record("dequeue", "malformed", start);
                Err(e)
            }
            Err(exhausted) => {
                self.record("dequeue", "failed", start);
                let RetryExhausted {
                    attempts,
                    last_error,
                } = exhausted;
                error!(
                    queue = %self.config.name,
                    attempts,
                    error = %last_error,
                    "dequeue failed"
                );
                Err(Error::DequeueFailed {
                    attempts,
                    reason: last_error.to_string(),
                })
            }
        }
    }

    /// Messages waiting in the queue.
    pub async fn depth(&self) -> Result<u64> {
        let mut conn = self.channel().await?;
        let depth = conn.depth(&self.config.name).await?;
        conn.release().await;
        Ok(depth)
    }

    fn record(&self, operation: &'static str, outcome: &'static str, start: Instant) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.config.name.clone()),
                KeyValue::new("operation", operation),
                KeyValue::new("outcome", outcome),
            ],
        );
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", operation)],
        );
    }
}
