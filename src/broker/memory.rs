//! In-process broker for tests and single-binary demos.
//!
//! Same routing and visibility semantics as the pgmq broker, minus
//! durability. Visibility uses `tokio::time::Instant`, so paused-clock tests
//! can advance past a timeout to force a redelivery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use super::{Broker, Delivery, dead_letter_body, dead_letter_queue};
use crate::error::{Error, Result};

#[derive(Debug)]
struct Stored {
    tag: i64,
    reads: u32,
    enqueued_at: DateTime<Utc>,
    visible_at: Instant,
    message: serde_json::Value,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, VecDeque<Stored>>,
    bindings: HashSet<(String, String, String)>,
    next_tag: i64,
}

impl State {
    fn enqueue(&mut self, queue: &str, message: serde_json::Value) -> Result<()> {
        self.next_tag += 1;
        let tag = self.next_tag;
        let messages = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::NotFound(format!("queue {queue}")))?;
        messages.push_back(Stored {
            tag,
            reads: 0,
            enqueued_at: Utc::now(),
            visible_at: Instant::now(),
            message,
        });
        Ok(())
    }

    fn remove(&mut self, queue: &str, tag: i64) -> Result<()> {
        let messages = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::NotFound(format!("queue {queue}")))?;
        messages.retain(|m| m.tag != tag);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    ready: Notify,
    failing_publishes: AtomicUsize,
    failing_acks: AtomicUsize,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Other("broker state poisoned".into()))
    }

    /// Make the next `n` publishes fail as if the broker were unreachable.
    pub fn fail_next_publishes(&self, n: usize) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` acks fail, leaving the messages in place.
    pub fn fail_next_acks(&self, n: usize) {
        self.failing_acks.store(n, Ordering::SeqCst);
    }

    /// Messages held by `queue`, visible or not. Zero for unknown queues.
    pub fn depth(&self, queue: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|state| state.queues.get(queue).map(VecDeque::len))
            .unwrap_or(0)
    }

    /// Bodies parked in the dead-letter queue of `queue`.
    pub fn dead_letters(&self, queue: &str) -> Vec<serde_json::Value> {
        let dlq = dead_letter_queue(queue);
        self.lock()
            .ok()
            .and_then(|state| {
                state
                    .queues
                    .get(&dlq)
                    .map(|messages| messages.iter().map(|m| m.message.clone()).collect())
            })
            .unwrap_or_default()
    }

    fn take_injected_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.queues.entry(queue.to_string()).or_default();
        state.queues.entry(dead_letter_queue(queue)).or_default();
        Ok(())
    }

    async fn bind_queue(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        let mut state = self.lock()?;
        if !state.queues.contains_key(queue) {
            return Err(Error::NotFound(format!("queue {queue}")));
        }
        state
            .bindings
            .insert((exchange.to_string(), queue.to_string(), routing_key.to_string()));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &serde_json::Value,
    ) -> Result<usize> {
        if Self::take_injected_failure(&self.failing_publishes) {
            return Err(Error::Delivery("broker unreachable".into()));
        }

        let routed = {
            let mut state = self.lock()?;
            let mut targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|(e, _, k)| e == exchange && k == routing_key)
                .map(|(_, q, _)| q.clone())
                .collect();
            targets.sort();
            for queue in &targets {
                state.enqueue(queue, message.clone())?;
            }
            targets.len()
        };

        if routed == 0 {
            warn!(exchange, routing_key, "no queue bound, message dropped");
        } else {
            self.ready.notify_waiters();
        }
        Ok(routed)
    }

    async fn receive(&self, queue: &str, visibility: Duration) -> Result<Option<Delivery>> {
        let mut state = self.lock()?;
        let messages = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::NotFound(format!("queue {queue}")))?;

        let now = Instant::now();
        let Some(stored) = messages.iter_mut().find(|m| m.visible_at <= now) else {
            return Ok(None);
        };
        stored.reads += 1;
        stored.visible_at = now + visibility;

        Ok(Some(Delivery {
            queue: queue.to_string(),
            tag: stored.tag,
            attempt: stored.reads,
            enqueued_at: stored.enqueued_at,
            message: stored.message.clone(),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        if Self::take_injected_failure(&self.failing_acks) {
            return Err(Error::Delivery("ack lost".into()));
        }
        self.lock()?.remove(&delivery.queue, delivery.tag)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.enqueue(
            &dead_letter_queue(&delivery.queue),
            dead_letter_body(delivery, reason),
        )?;
        state.remove(&delivery.queue, delivery.tag)
    }

    async fn wait(&self, _queue: &str, timeout: Duration) -> Result<()> {
        let _ = tokio::time::timeout(timeout, self.ready.notified()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn broker_with(queues: &[&str], exchange: &str) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        for q in queues {
            broker.declare_queue(q).await.unwrap();
            broker.bind_queue(exchange, q, "").await.unwrap();
        }
        broker
    }

    #[tokio::test]
    async fn publish_fans_out_to_bound_queues() {
        let broker = broker_with(&["a.in", "b.in"], "x.out").await;
        let routed = broker.publish("x.out", "", &json!({"n": 1})).await.unwrap();
        assert_eq!(routed, 2);
        assert_eq!(broker.depth("a.in"), 1);
        assert_eq!(broker.depth("b.in"), 1);
    }

    #[tokio::test]
    async fn unbound_exchange_drops_message() {
        let broker = broker_with(&["a.in"], "x.out").await;
        let routed = broker.publish("y.out", "", &json!({})).await.unwrap();
        assert_eq!(routed, 0);
        assert_eq!(broker.depth("a.in"), 0);
    }

    #[tokio::test]
    async fn receive_is_fifo_and_hides_the_message() {
        let broker = broker_with(&["a.in"], "x.out").await;
        broker.publish("x.out", "", &json!(1)).await.unwrap();
        broker.publish("x.out", "", &json!(2)).await.unwrap();

        let first = broker.receive("a.in", Duration::from_secs(30)).await.unwrap().unwrap();
        let second = broker.receive("a.in", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(first.message, json!(1));
        assert_eq!(second.message, json!(2));
        assert!(broker.receive("a.in", Duration::from_secs(30)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_message_is_redelivered_after_visibility_timeout() {
        let broker = broker_with(&["a.in"], "x.out").await;
        broker.publish("x.out", "", &json!("m")).await.unwrap();

        let first = broker.receive("a.in", Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        let again = broker.receive("a.in", Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(again.tag, first.tag);
        assert_eq!(again.attempt, 2);

        broker.ack(&again).await.unwrap();
        assert_eq!(broker.depth("a.in"), 0);
    }

    #[tokio::test]
    async fn dead_letter_moves_the_message() {
        let broker = broker_with(&["a.in"], "x.out").await;
        broker.publish("x.out", "", &json!({"k": "v"})).await.unwrap();
        let delivery = broker.receive("a.in", Duration::from_secs(5)).await.unwrap().unwrap();

        broker.dead_letter(&delivery, "poison").await.unwrap();

        assert_eq!(broker.depth("a.in"), 0);
        let parked = broker.dead_letters("a.in");
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0]["reason"], "poison");
        assert_eq!(parked[0]["message"]["k"], "v");
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let broker = broker_with(&["a.in"], "x.out").await;
        broker.fail_next_publishes(1);
        assert!(matches!(
            broker.publish("x.out", "", &json!({})).await,
            Err(Error::Delivery(_))
        ));
        assert_eq!(broker.publish("x.out", "", &json!({})).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_queue_is_not_found() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.receive("nope", Duration::from_secs(1)).await,
            Err(Error::NotFound(_))
        ));
    }
}
