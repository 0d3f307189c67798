//! Broker port: durable exchange/queue pairs the services talk through.
//!
//! Exchanges fan out by declaration: a message published to an exchange
//! under a routing key lands in every queue bound to that pair. Queues hand
//! out one delivery at a time with a visibility timeout; an unacknowledged
//! delivery becomes visible again once the timeout lapses.

pub mod memory;
pub mod pgmq;
pub mod topology;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use memory::InMemoryBroker;
pub use pgmq::PgmqBroker;

/// One message handed out by a queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    /// Broker-assigned message id, used to acknowledge.
    pub tag: i64,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub message: serde_json::Value,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Create a queue and its dead-letter queue (idempotent).
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Route messages published to `exchange` under `routing_key` into
    /// `queue` (idempotent).
    async fn bind_queue(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()>;

    /// Publish to every queue bound to `(exchange, routing_key)`. Returns the
    /// number of queues the message was routed to; zero means it was dropped.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &serde_json::Value,
    ) -> Result<usize>;

    /// Take the next visible message, hiding it for `visibility`.
    async fn receive(&self, queue: &str, visibility: Duration) -> Result<Option<Delivery>>;

    /// Remove a delivered message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Move a delivered message to the queue's dead-letter queue.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()>;

    /// Block until new messages may be available on `queue` or `timeout`
    /// passes. Spurious wakeups are allowed.
    async fn wait(&self, _queue: &str, timeout: Duration) -> Result<()> {
        tokio::time::sleep(timeout).await;
        Ok(())
    }
}

/// Name of the dead-letter queue paired with `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}.dlq")
}

/// Body stored in a dead-letter queue.
pub(crate) fn dead_letter_body(delivery: &Delivery, reason: &str) -> serde_json::Value {
    serde_json::json!({
        "queue": delivery.queue,
        "reason": reason,
        "attempt": delivery.attempt,
        "enqueued_at": delivery.enqueued_at,
        "message": delivery.message,
    })
}
