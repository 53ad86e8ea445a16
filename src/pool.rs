//! Bounded pool of broker connections.
//!
//! Idle connections live in a LIFO list guarded by a mutex that is only
//! held to push or pop, never across I/O. A semaphore caps live
//! connections (idle plus checked out) at `max_connections`, so `acquire`
//! waits when every connection is in use.
//!
//! Checked-out connections are wrapped in [`PooledConnection`], which goes
//! back to the pool when dropped, on every exit path.

use crate::broker::{Broker, BrokerConnection};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Cap on live connections and on the idle set.
    pub max_connections: usize,
    /// Connections idle longer than this are pinged before reuse.
    pub heartbeat: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            heartbeat: Duration::from_secs(60),
        }
    }
}

/// Outcome of checking an idle connection before handing it out.
#[derive(Debug)]
pub enum Health {
    Healthy,
    /// Closed by the broker or by a previous failure. Replace it.
    Stale,
    /// The health check itself failed with something other than a closed
    /// session.
    Error(Error),
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub closed: u64,
}

struct Slot<C> {
    conn: C,
    id: Uuid,
    /// Queues already declared on this session.
    declared: HashSet<String>,
    last_used: Instant,
}

pub struct ConnectionPool<B: Broker> {
    broker: B,
    config: PoolConfig,
    retry: RetryPolicy,
    idle: Mutex<Vec<Slot<B::Connection>>>,
    permits: Semaphore,
    created: AtomicU64,
    closed: AtomicU64,
}

impl<B: Broker> ConnectionPool<B> {
    pub fn new(broker: B, config: PoolConfig, retry: RetryPolicy) -> Self {
        let max = config.max_connections.max(1);
        Self {
            broker,
            config: PoolConfig {
                max_connections: max,
                ..config
            },
            retry,
            idle: Mutex::new(Vec::with_capacity(max)),
            permits: Semaphore::new(max),
            created: AtomicU64::new(0),
            closed: AtomicU64::new(0),
        }
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn idle(&self) -> MutexGuard<'_, Vec<Slot<B::Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out a healthy connection, reusing an idle one when possible.
    ///
    /// A stale idle connection is discarded (along with the rest of the
    /// idle set) and replaced by a new one; the discard counts against the
    /// retry budget. Connecting retries with the pool's fixed delay and
    /// fails with [`Error::BrokerUnavailable`] once the budget is spent.
    pub async fn acquire(&self) -> Result<PooledConnection<'_, B>> {
        self.checkout(Some(self.retry)).await
    }

    /// Like [`acquire`](Self::acquire), but makes at most one connect
    /// attempt and returns its error unchanged. For callers that run their
    /// own retry loop around the whole operation.
    pub async fn try_acquire(&self) -> Result<PooledConnection<'_, B>> {
        self.checkout(None).await
    }

    async fn checkout(&self, retry: Option<RetryPolicy>) -> Result<PooledConnection<'_, B>> {
        let permit = self.permits.acquire().await.map_err(|_| Error::PoolClosed)?;

        let mut spent = 0u32;
        let popped = self.idle().pop();
        if let Some(mut slot) = popped {
            match self.check_health(&mut slot).await {
                Health::Healthy => {
                    debug!(connection = %slot.id, "reusing idle broker connection");
                    return Ok(PooledConnection::new(self, slot, permit));
                }
                Health::Stale => {
                    info!(connection = %slot.id, "idle broker connection is stale, reconnecting");
                    spent += 1;
                    self.discard(slot, "stale").await;
                    // A broker that closed one idle session has usually
                    // closed all of them.
                    self.purge_idle().await;
                }
                Health::Error(e) => {
                    warn!(connection = %slot.id, error = %e, "health check failed, reconnecting");
                    spent += 1;
                    self.discard(slot, "unhealthy").await;
                }
            }
        }

        let conn = match retry {
            Some(policy) => self.connect_within(policy, spent).await?,
            None => self.broker.connect().await?,
        };

        let slot = Slot {
            conn,
            id: Uuid::new_v4(),
            declared: HashSet::new(),
            last_used: Instant::now(),
        };
        self.created.fetch_add(1, Ordering::Relaxed);
        metrics::broker_connections().add(1, &[KeyValue::new("event", "created")]);
        debug!(connection = %slot.id, "broker connection opened");
        Ok(PooledConnection::new(self, slot, permit))
    }

    /// Connect under `policy`, less the attempts already `spent`.
    async fn connect_within(&self, policy: RetryPolicy, spent: u32) -> Result<B::Connection> {
        let budget = RetryPolicy::new(
            policy.max_retries.max(1).saturating_sub(spent).max(1),
            policy.retry_delay,
        );
        budget
            .run("broker.connect", |attempt| async move {
                debug!(attempt, "opening broker connection");
                self.broker.connect().await
            })
            .await
            .map_err(|exhausted| {
                error!(
                    attempts = exhausted.attempts + spent,
                    error = %exhausted.last_error,
                    "broker unreachable, giving up"
                );
                Error::BrokerUnavailable {
                    attempts: exhausted.attempts + spent,
                    reason: exhausted.last_error.to_string(),
                }
            })
    }

    /// Return a connection to the pool. Equivalent to dropping the guard,
    /// except a rejected connection is closed gracefully.
    pub async fn release(&self, conn: PooledConnection<'_, B>) {
        conn.release().await;
    }

    async fn check_health(&self, slot: &mut Slot<B::Connection>) -> Health {
        if !slot.conn.is_open() {
            return Health::Stale;
        }
        if slot.last_used.elapsed() < self.config.heartbeat {
            return Health::Healthy;
        }
        match slot.conn.ping().await {
            Ok(()) => Health::Healthy,
            Err(_) if !slot.conn.is_open() => Health::Stale,
            Err(Error::Connection(_)) => Health::Stale,
            Err(e) => Health::Error(e),
        }
    }

    /// Put a slot back in the idle set. Hands it back when it is broken,
    /// the set is full, or the pool is shut down.
    fn put_back(&self, mut slot: Slot<B::Connection>) -> Option<Slot<B::Connection>> {
        if !slot.conn.is_open() || self.permits.is_closed() {
            return Some(slot);
        }
        let mut idle = self.idle();
        if idle.len() >= self.config.max_connections {
            return Some(slot);
        }
        slot.last_used = Instant::now();
        idle.push(slot);
        None
    }

    async fn discard(&self, slot: Slot<B::Connection>, reason: &'static str) {
        let id = slot.id;
        if let Err(e) = slot.conn.close().await {
            debug!(connection = %id, error = %e, "error closing broker connection");
        }
        self.note_closed(reason);
    }

    fn note_closed(&self, reason: &'static str) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        metrics::broker_connections().add(
            1,
            &[
                KeyValue::new("event", "closed"),
                KeyValue::new("reason", reason),
            ],
        );
    }

    async fn purge_idle(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.idle());
        for slot in drained {
            self.discard(slot, "stale").await;
        }
    }

    /// Close the pool. Waiting and future `acquire` calls fail with
    /// [`Error::PoolClosed`]; checked-out connections are closed when they
    /// come back.
    pub async fn shutdown(&self) {
        self.permits.close();
        let idle = self.idle().len();
        self.purge_idle().await;
        info!(closed_idle = idle, "connection pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.idle().len();
        let in_use = if self.permits.is_closed() {
            0
        } else {
            self.config
                .max_connections
                .saturating_sub(self.permits.available_permits())
        };
        PoolStats {
            idle,
            in_use,
            created: self.created.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Exclusively owned by the holder. Returns to the pool on drop; a broken
/// connection is closed instead.
pub struct PooledConnection<'a, B: Broker> {
    pool: &'a ConnectionPool<B>,
    slot: Option<Slot<B::Connection>>,
    _permit: SemaphorePermit<'a>,
}

const PRESENT: &str = "connection present until released";

impl<'a, B: Broker> PooledConnection<'a, B> {
    fn new(
        pool: &'a ConnectionPool<B>,
        slot: Slot<B::Connection>,
        permit: SemaphorePermit<'a>,
    ) -> Self {
        Self {
            pool,
            slot: Some(slot),
            _permit: permit,
        }
    }

    pub fn id(&self) -> Uuid {
        self.slot.as_ref().expect(PRESENT).id
    }

    /// Whether `queue` was already declared on this session.
    pub fn is_declared(&self, queue: &str) -> bool {
        self.slot.as_ref().expect(PRESENT).declared.contains(queue)
    }

    pub fn mark_declared(&mut self, queue: &str) {
        self.slot
            .as_mut()
            .expect(PRESENT)
            .declared
            .insert(queue.to_string());
    }

    /// Return to the pool, closing gracefully if the pool will not take it.
    pub async fn release(mut self) {
        if let Some(slot) = self.slot.take() {
            if let Some(rejected) = self.pool.put_back(slot) {
                self.pool.discard(rejected, "released").await;
            }
        }
    }
}

impl<B: Broker> Deref for PooledConnection<'_, B> {
    type Target = B::Connection;

    fn deref(&self) -> &Self::Target {
        &self.slot.as_ref().expect(PRESENT).conn
    }
}

impl<B: Broker> DerefMut for PooledConnection<'_, B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.slot.as_mut().expect(PRESENT).conn
    }
}

impl<B: Broker> Drop for PooledConnection<'_, B> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if let Some(rejected) = self.pool.put_back(slot) {
                debug!(connection = %rejected.id, "dropping broker connection");
                drop(rejected);
                self.pool.note_closed("dropped");
            }
        }
    }
}
