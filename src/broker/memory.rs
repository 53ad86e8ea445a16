//! In-process broker with fault injection.
//!
//! Behaves like a durable, acknowledgment-based broker: a fetched message
//! stays unacknowledged until `ack`, and goes back to the head of its
//! queue when the session that fetched it goes away. Failures can be
//! injected to exercise the retry and reconnect paths.

use super::{Broker, BrokerConnection, Delivery, DeliveryTag};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct Stored {
    tag: DeliveryTag,
    body: serde_json::Value,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct MemQueue {
    durable: bool,
    ready: VecDeque<Stored>,
    /// Fetched, not yet acknowledged, keyed by tag, with the owning session.
    unacked: HashMap<DeliveryTag, (u64, Stored)>,
    dead_letters: Vec<serde_json::Value>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, MemQueue>,
    next_tag: DeliveryTag,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    /// Bumped whenever the broker drops every session.
    generation: AtomicU64,
    next_connection: AtomicU64,
    down: AtomicBool,
    failing_connects: AtomicU32,
    failing_operations: AtomicU32,
    failing_pings: AtomicU32,
    connect_attempts: AtomicU64,
    pings: AtomicU64,
    publish_attempts: AtomicU64,
    get_attempts: AtomicU64,
    live_connections: AtomicUsize,
    peak_connections: AtomicUsize,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return every unacknowledged message owned by `session` to the head
    /// of its queue.
    fn requeue_session(&self, session: u64) {
        let mut state = self.state();
        for queue in state.queues.values_mut() {
            let mut orphaned: Vec<Stored> = queue
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == session)
                .map(|(_, (_, stored))| stored.clone())
                .collect();
            if orphaned.is_empty() {
                continue;
            }
            for stored in &orphaned {
                queue.unacked.remove(&stored.tag);
            }
            orphaned.sort_by_key(|s| std::cmp::Reverse(s.tag));
            for stored in orphaned {
                queue.ready.push_front(stored);
            }
        }
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Shared handle to one in-process broker. Clones see the same queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` queue operations. Each failure also breaks the
    /// session it happened on, like a dropped socket.
    pub fn fail_next_operations(&self, n: u32) {
        self.inner.failing_operations.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` pings, as if the broker closed those sessions
    /// without the client noticing.
    pub fn fail_next_pings(&self, n: u32) {
        self.inner.failing_pings.store(n, Ordering::SeqCst);
    }

    /// Take the broker down (or bring it back). While down, connects and
    /// operations fail.
    pub fn set_down(&self, down: bool) {
        self.inner.down.store(down, Ordering::SeqCst);
        if down {
            self.drop_connections();
        }
    }

    /// Close every open session from the broker side. Existing connection
    /// handles report themselves closed; their unacknowledged messages are
    /// requeued.
    pub fn drop_connections(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state();
        for queue in state.queues.values_mut() {
            let mut orphaned: Vec<Stored> =
                queue.unacked.drain().map(|(_, (_, stored))| stored).collect();
            orphaned.sort_by_key(|s| std::cmp::Reverse(s.tag));
            for stored in orphaned {
                queue.ready.push_front(stored);
            }
        }
    }

    /// Simulate a broker restart: sessions drop and non-durable queues
    /// lose their contents.
    pub fn restart(&self) {
        self.drop_connections();
        let mut state = self.inner.state();
        state.queues.retain(|_, q| q.durable);
    }

    /// Messages waiting (not in flight) in `queue`.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet acknowledged in `queue`.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Bodies rejected from `queue`.
    pub fn dead_letters(&self, queue: &str) -> Vec<serde_json::Value> {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.dead_letters.clone())
            .unwrap_or_default()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.state().queues.contains_key(queue)
    }

    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn publish_attempts(&self) -> u64 {
        self.inner.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn get_attempts(&self) -> u64 {
        self.inner.get_attempts.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> u64 {
        self.inner.pings.load(Ordering::SeqCst)
    }

    /// Sessions currently open.
    pub fn live_connections(&self) -> usize {
        self.inner.live_connections.load(Ordering::SeqCst)
    }

    /// Most sessions ever open at once.
    pub fn peak_connections(&self) -> usize {
        self.inner.peak_connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.down.load(Ordering::SeqCst) {
            return Err(Error::Connection("broker is down".to_string()));
        }
        if Inner::take_fault(&self.inner.failing_connects) {
            return Err(Error::Connection("injected connect failure".to_string()));
        }

        let live = self.inner.live_connections.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_connections.fetch_max(live, Ordering::SeqCst);
        Ok(MemoryConnection {
            inner: Arc::clone(&self.inner),
            session: self.inner.next_connection.fetch_add(1, Ordering::SeqCst),
            generation: self.inner.generation.load(Ordering::SeqCst),
            open: true,
        })
    }
}

/// One session on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    inner: Arc<Inner>,
    session: u64,
    generation: u64,
    open: bool,
}

impl MemoryConnection {
    /// Gate every operation: closed sessions and injected faults fail with
    /// a connection error.
    fn check(&mut self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Connection("connection closed".to_string()));
        }
        if self.inner.down.load(Ordering::SeqCst) {
            self.open = false;
            return Err(Error::Connection("broker is down".to_string()));
        }
        if Inner::take_fault(&self.inner.failing_operations) {
            self.open = false;
            return Err(Error::Connection("injected operation failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open && self.generation == self.inner.generation.load(Ordering::SeqCst)
    }

    async fn ping(&mut self) -> Result<()> {
        self.inner.pings.fetch_add(1, Ordering::SeqCst);
        if !self.is_open()
            || self.inner.down.load(Ordering::SeqCst)
            || Inner::take_fault(&self.inner.failing_pings)
        {
            self.open = false;
            return Err(Error::Connection("connection closed".to_string()));
        }
        Ok(())
    }

    async fn declare_queue(&mut self, queue: &str, durable: bool) -> Result<()> {
        self.check()?;
        let mut state = self.inner.state();
        state.queues.entry(queue.to_string()).or_insert_with(|| MemQueue {
            durable,
            ..MemQueue::default()
        });
        Ok(())
    }

    async fn publish(&mut self, queue: &str, body: &serde_json::Value) -> Result<i64> {
        self.inner.publish_attempts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let mut state = self.inner.state();
        state.next_tag += 1;
        let tag = state.next_tag;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::Other(format!("queue {queue} is not declared")))?;
        q.ready.push_back(Stored {
            tag,
            body: body.clone(),
            delivery_count: 0,
        });
        Ok(tag)
    }

    async fn get(&mut self, queue: &str) -> Result<Option<Delivery>> {
        self.inner.get_attempts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let mut state = self.inner.state();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::Other(format!("queue {queue} is not declared")))?;
        let Some(mut stored) = q.ready.pop_front() else {
            return Ok(None);
        };
        stored.delivery_count += 1;
        let delivery = Delivery {
            tag: stored.tag,
            body: stored.body.clone(),
            delivery_count: stored.delivery_count,
        };
        q.unacked.insert(stored.tag, (self.session, stored));
        Ok(Some(delivery))
    }

    async fn ack(&mut self, queue: &str, tag: DeliveryTag) -> Result<()> {
        self.check()?;
        let mut state = self.inner.state();
        if let Some(q) = state.queues.get_mut(queue) {
            q.unacked.remove(&tag);
        }
        Ok(())
    }

    async fn reject(&mut self, queue: &str, tag: DeliveryTag) -> Result<()> {
        self.check()?;
        let mut state = self.inner.state();
        if let Some(q) = state.queues.get_mut(queue) {
            if let Some((_, stored)) = q.unacked.remove(&tag) {
                q.dead_letters.push(stored.body);
            }
        }
        Ok(())
    }

    async fn depth(&mut self, queue: &str) -> Result<u64> {
        self.check()?;
        let state = self.inner.state();
        Ok(state.queues.get(queue).map_or(0, |q| q.ready.len() as u64))
    }

    async fn close(self) -> Result<()> {
        // Drop does the bookkeeping.
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.inner.live_connections.fetch_sub(1, Ordering::SeqCst);
        self.inner.requeue_session(self.session);
    }
}
