//! Broker seam: the durable message queue the pool connects to.
//!
//! A [`Broker`] opens sessions; a [`BrokerConnection`] is one session.
//! Connections are used by exactly one caller at a time (the pool hands
//! them out exclusively), so every operation takes `&mut self`.
//!
//! Two implementations ship with the crate: [`pgmq::PgmqBroker`] over
//! Postgres + pgmq, and [`memory::MemoryBroker`], an in-process broker
//! with fault injection.

pub mod memory;
pub mod pgmq;

use crate::error::Result;
use async_trait::async_trait;

/// Handle used to acknowledge or reject one delivered message.
pub type DeliveryTag = i64;

/// A message fetched from a queue but not yet acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: serde_json::Value,
    /// Times this message has been handed out, this delivery included.
    pub delivery_count: u32,
}

/// Opens broker sessions.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Open a new session. Fails with `Error::Connection` when the broker
    /// cannot be reached.
    async fn connect(&self) -> Result<Self::Connection>;
}

/// One broker session.
#[async_trait]
pub trait BrokerConnection: Send + Sized + 'static {
    /// Local view of the session: false once the connection is known to be
    /// closed or broken. Cheap, no I/O.
    fn is_open(&self) -> bool;

    /// Round trip to the broker.
    async fn ping(&mut self) -> Result<()>;

    /// Create the queue if it does not exist. Idempotent.
    async fn declare_queue(&mut self, queue: &str, durable: bool) -> Result<()>;

    /// Publish a persistent message. Returns the broker's message id.
    async fn publish(&mut self, queue: &str, body: &serde_json::Value) -> Result<i64>;

    /// Fetch at most one message without waiting. `None` when empty.
    async fn get(&mut self, queue: &str) -> Result<Option<Delivery>>;

    /// Confirm a delivery; the broker may forget the message.
    async fn ack(&mut self, queue: &str, tag: DeliveryTag) -> Result<()>;

    /// Refuse a delivery permanently (dead-letter, no redelivery).
    async fn reject(&mut self, queue: &str, tag: DeliveryTag) -> Result<()>;

    /// Messages currently waiting in the queue.
    async fn depth(&mut self, queue: &str) -> Result<u64>;

    /// Close the session gracefully.
    async fn close(self) -> Result<()>;
}
