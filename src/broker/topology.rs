//! Standard exchange/queue layout.
//!
//! One exchange per producing domain, one queue per consuming domain, bound
//! with an empty routing key.

use super::Broker;
use crate::error::Result;

pub const AUTH_EXCHANGE: &str = "auth.out";
pub const TRACKER_EXCHANGE: &str = "task_tracker.out";

pub const TRACKER_QUEUE: &str = "task_tracker.in";
pub const ACCOUNTING_QUEUE: &str = "accounting.in";

pub const ROUTING_KEY: &str = "";

/// `(exchange, queue)` pairs.
pub const BINDINGS: [(&str, &str); 3] = [
    (AUTH_EXCHANGE, TRACKER_QUEUE),
    (AUTH_EXCHANGE, ACCOUNTING_QUEUE),
    (TRACKER_EXCHANGE, ACCOUNTING_QUEUE),
];

/// Declare every standard queue and binding. Safe to run repeatedly.
pub async fn declare(broker: &dyn Broker) -> Result<()> {
    for queue in [TRACKER_QUEUE, ACCOUNTING_QUEUE] {
        broker.declare_queue(queue).await?;
    }
    for (exchange, queue) in BINDINGS {
        broker.bind_queue(exchange, queue, ROUTING_KEY).await?;
    }
    Ok(())
}
