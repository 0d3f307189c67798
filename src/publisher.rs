//! Event publisher: hands envelopes to one exchange.
//!
//! Fire-and-forget. A publish returns once the broker has accepted the
//! message at the exchange; nothing here retries or waits for consumers.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{debug, error};

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::event::{Envelope, EventPayload};
use crate::telemetry::metrics;

#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    exchange: String,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn Broker>, exchange: impl Into<String>) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Send an envelope. Returns how many queues it was routed to. Any broker
    /// failure comes back as [`Error::Delivery`].
    pub async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<usize> {
        let message = envelope.to_message()?;
        let outcome = self
            .broker
            .publish(&self.exchange, routing_key, &message)
            .await
            .map_err(|e| match e {
                Error::Delivery(_) => e,
                other => Error::Delivery(other.to_string()),
            });

        let result = if outcome.is_ok() { "ok" } else { "error" };
        metrics::events_published().add(
            1,
            &[
                KeyValue::new("event_type", envelope.event_type.as_str()),
                KeyValue::new("result", result),
            ],
        );

        match &outcome {
            Ok(routed) => debug!(
                exchange = %self.exchange,
                event_type = %envelope.event_type,
                event_id = ?envelope.event_id,
                routed,
                "event published"
            ),
            Err(e) => error!(
                exchange = %self.exchange,
                event_type = %envelope.event_type,
                event_id = ?envelope.event_id,
                "publish failed: {e}"
            ),
        }
        outcome
    }

    /// Wrap a typed payload in a fresh envelope and send it.
    pub async fn publish_payload<P: EventPayload + Sync>(
        &self,
        routing_key: &str,
        payload: &P,
    ) -> Result<Envelope> {
        let envelope = Envelope::new(payload)?;
        self.publish(routing_key, &envelope).await?;
        Ok(envelope)
    }
}
