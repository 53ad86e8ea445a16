//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. Sensitive values wrapped in secrecy::SecretString to prevent
//! log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use crate::model::ResultPolicy;
use crate::pool::PoolConfig;
use crate::queue::QueueConfig;
use crate::retry::RetryPolicy;
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    /// Task store (request records).
    pub database_url: SecretString,
    pub broker: BrokerConfig,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub queue: QueueConfig,
    pub result_policy: ResultPolicy,
    pub worker_poll_interval: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Where the broker lives. The pgmq broker is a Postgres database with the
/// pgmq extension installed.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<SecretString>,
    pub database: String,
    /// Idle connections older than this are pinged before reuse.
    pub heartbeat: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            username: "postgres".to_string(),
            password: None,
            database: "postgres".to_string(),
            heartbeat: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        let broker_defaults = BrokerConfig::default();
        let broker = BrokerConfig {
            host: std::env::var("BROKER_HOST").unwrap_or(broker_defaults.host),
            port: parsed_var("BROKER_PORT", broker_defaults.port)?,
            username: std::env::var("BROKER_USER").unwrap_or(broker_defaults.username),
            password: std::env::var("BROKER_PASSWORD").ok().map(SecretString::from),
            database: std::env::var("BROKER_DATABASE").unwrap_or(broker_defaults.database),
            heartbeat: Duration::from_secs(parsed_var("BROKER_HEARTBEAT_SECS", 60u64)?),
        };

        let pool = PoolConfig {
            max_connections: parsed_var("POOL_MAX_CONNECTIONS", 5usize)?,
            heartbeat: broker.heartbeat,
        };
        if pool.max_connections == 0 {
            return Err(Error::Config(
                "POOL_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }

        let retry = RetryPolicy::new(
            parsed_var("RETRY_MAX_ATTEMPTS", 3u32)?,
            Duration::from_secs(parsed_var("RETRY_DELAY_SECS", 5u64)?),
        );
        if retry.max_retries == 0 {
            return Err(Error::Config(
                "RETRY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let queue_defaults = QueueConfig::default();
        let queue = QueueConfig {
            name: std::env::var("QUEUE_NAME").unwrap_or(queue_defaults.name),
            durable: queue_defaults.durable,
            visibility_timeout: Duration::from_secs(parsed_var(
                "QUEUE_VISIBILITY_TIMEOUT_SECS",
                queue_defaults.visibility_timeout.as_secs(),
            )?),
            archive_on_ack: parsed_var("QUEUE_ARCHIVE_ON_ACK", queue_defaults.archive_on_ack)?,
        };

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            broker,
            pool,
            retry,
            queue,
            result_policy: parsed_var("RESULT_POLICY", ResultPolicy::default())?,
            worker_poll_interval: Duration::from_secs(parsed_var(
                "WORKER_POLL_INTERVAL_SECS",
                5u64,
            )?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value for {name} ({raw:?}): {e}"))),
        Err(_) => Ok(default),
    }
}
