//! pgmq broker: one dedicated Postgres session per broker connection.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.delete, pgmq.archive, pgmq.metrics. A message read but never
//! deleted becomes visible again once its visibility timeout lapses,
//! which is how unacknowledged deliveries are redelivered.

use super::{Broker, BrokerConnection, Delivery, DeliveryTag};
use crate::config::BrokerConfig;
use crate::config::secrets::ExposeSecret;
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use std::time::Duration;

/// Opens pgmq sessions against one Postgres database.
#[derive(Debug, Clone)]
pub struct PgmqBroker {
    options: PgConnectOptions,
    visibility_timeout: Duration,
    archive_on_ack: bool,
}

impl PgmqBroker {
    pub fn new(config: &BrokerConfig, visibility_timeout: Duration, archive_on_ack: bool) -> Self {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .database(&config.database)
            .application_name("requestq");
        if let Some(ref password) = config.password {
            options = options.password(password.expose_secret());
        }
        Self {
            options,
            visibility_timeout,
            archive_on_ack,
        }
    }
}

#[async_trait]
impl Broker for PgmqBroker {
    type Connection = PgmqConnection;

    async fn connect(&self) -> Result<PgmqConnection> {
        let conn = PgConnection::connect_with(&self.options)
            .await
            .map_err(|e| Error::Connection(format!("pgmq connect failed: {e}")))?;
        Ok(PgmqConnection {
            conn,
            open: true,
            vt_seconds: self.visibility_timeout.as_secs().min(i32::MAX as u64) as i32,
            archive_on_ack: self.archive_on_ack,
        })
    }
}

/// A single Postgres session speaking pgmq.
pub struct PgmqConnection {
    conn: PgConnection,
    open: bool,
    vt_seconds: i32,
    archive_on_ack: bool,
}

impl PgmqConnection {
    /// Map a sqlx failure, marking the session broken when the failure
    /// means the socket is gone.
    fn fail(&mut self, e: sqlx::Error) -> Error {
        let err = Error::from(e);
        if err.is_transient() {
            self.open = false;
            Error::Connection(err.to_string())
        } else {
            err
        }
    }

    fn record(queue: &str, call: &'static str) {
        metrics::broker_calls().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("call", call),
            ],
        );
    }
}

#[async_trait]
impl BrokerConnection for PgmqConnection {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn ping(&mut self) -> Result<()> {
        match self.conn.ping().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.open = false;
                Err(Error::Connection(format!("ping failed: {e}")))
            }
        }
    }

    async fn declare_queue(&mut self, queue: &str, durable: bool) -> Result<()> {
        // pgmq.create is idempotent; unlogged queues do not survive a crash.
        let sql = if durable {
            "SELECT pgmq.create($1)"
        } else {
            "SELECT pgmq.create_unlogged($1)"
        };
        if let Err(e) = sqlx::query(sql).bind(queue).execute(&mut self.conn).await {
            return Err(self.fail(e));
        }
        Self::record(queue, "create");
        Ok(())
    }

    async fn publish(&mut self, queue: &str, body: &serde_json::Value) -> Result<i64> {
        let row: (i64,) = match sqlx::query_as("SELECT pgmq.send($1, $2)")
            .bind(queue)
            .bind(body)
            .fetch_one(&mut self.conn)
            .await
        {
            Ok(row) => row,
            Err(e) => return Err(self.fail(e)),
        };
        Self::record(queue, "send");
        Ok(row.0)
    }

    async fn get(&mut self, queue: &str) -> Result<Option<Delivery>> {
        let row = match sqlx::query_as::<_, (i64, i32, serde_json::Value)>(
            "SELECT msg_id, read_ct, message FROM pgmq.read($1, $2, 1)",
        )
        .bind(queue)
        .bind(self.vt_seconds)
        .fetch_optional(&mut self.conn)
        .await
        {
            Ok(row) => row,
            Err(e) => return Err(self.fail(e)),
        };

        let delivery = row.map(|(msg_id, read_ct, message)| Delivery {
            tag: msg_id,
            body: message,
            delivery_count: read_ct.max(1) as u32,
        });
        Self::record(
            queue,
            if delivery.is_some() { "read" } else { "read_empty" },
        );
        Ok(delivery)
    }

    async fn ack(&mut self, queue: &str, tag: DeliveryTag) -> Result<()> {
        // Archive keeps the message for audit; delete drops it.
        let (sql, call) = if self.archive_on_ack {
            ("SELECT pgmq.archive($1, $2)", "archive")
        } else {
            ("SELECT pgmq.delete($1, $2)", "delete")
        };
        if let Err(e) = sqlx::query(sql)
            .bind(queue)
            .bind(tag)
            .execute(&mut self.conn)
            .await
        {
            return Err(self.fail(e));
        }
        Self::record(queue, call);
        Ok(())
    }

    async fn reject(&mut self, queue: &str, tag: DeliveryTag) -> Result<()> {
        if let Err(e) = sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue)
            .bind(tag)
            .execute(&mut self.conn)
            .await
        {
            return Err(self.fail(e));
        }
        Self::record(queue, "reject");
        Ok(())
    }

    async fn depth(&mut self, queue: &str) -> Result<u64> {
        let row: (i64,) = match sqlx::query_as("SELECT queue_length FROM pgmq.metrics($1)")
            .bind(queue)
            .fetch_one(&mut self.conn)
            .await
        {
            Ok(row) => row,
            Err(e) => return Err(self.fail(e)),
        };
        Ok(row.0.max(0) as u64)
    }

    async fn close(self) -> Result<()> {
        self.conn
            .close()
            .await
            .map_err(|e| Error::Connection(format!("close failed: {e}")))
    }
}
