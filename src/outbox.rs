//! Transactional outbox relay.
//!
//! The tracker writes outgoing events into an outbox table in the same
//! transaction as the task change. This relay drains that table to the
//! broker in insertion order. A row is marked published only after the
//! broker accepted it, so every committed event is sent at least once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::broker::topology::ROUTING_KEY;
use crate::error::{Error, Result};
use crate::event::Envelope;
use crate::publisher::EventPublisher;
use crate::telemetry::metrics;

/// One staged event.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    /// Monotonic; defines publication order.
    pub id: i64,
    pub envelope: Envelope,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outbox rows are deduplicated downstream by event id, so every staged
/// envelope must carry one.
pub(crate) fn require_event_ids(events: &[Envelope]) -> Result<()> {
    match events.iter().find(|envelope| envelope.event_id.is_none()) {
        Some(envelope) => Err(Error::InvalidInput(format!(
            "{} envelope staged without an event id",
            envelope.event_type
        ))),
        None => Ok(()),
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Unpublished records, oldest first.
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    async fn mark_published(&self, id: i64) -> Result<()>;

    async fn record_failure(&self, id: i64, error: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub published: usize,
    /// Set when the batch stopped on a failed publish.
    pub stalled: bool,
}

#[derive(Clone)]
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: EventPublisher,
    config: RelayConfig,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn OutboxStore>, publisher: EventPublisher, config: RelayConfig) -> Self {
        Self {
            store,
            publisher,
            config,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Publish one batch. Stops at the first failure so later events never
    /// overtake an earlier one.
    pub async fn relay_once(&self) -> Result<RelayReport> {
        let mut report = RelayReport::default();

        for record in self.store.pending(self.config.batch_size).await? {
            match self.publisher.publish(ROUTING_KEY, &record.envelope).await {
                Ok(_) => {
                    self.store.mark_published(record.id).await?;
                    metrics::outbox_relayed().add(1, &[KeyValue::new("result", "published")]);
                    report.published += 1;
                }
                Err(e) => {
                    warn!(
                        outbox_id = record.id,
                        attempts = record.attempts + 1,
                        event_type = %record.envelope.event_type,
                        "outbox publish failed: {e}"
                    );
                    self.store.record_failure(record.id, &e.to_string()).await?;
                    metrics::outbox_relayed().add(1, &[KeyValue::new("result", "failed")]);
                    report.stalled = true;
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Drain the outbox until [`OutboxRelay::shutdown`].
    pub async fn run(&self) -> Result<()> {
        info!(exchange = self.publisher.exchange(), "outbox relay started");

        while !self.stopping.load(Ordering::SeqCst) {
            match self.relay_once().await {
                // A full batch likely means more is waiting.
                Ok(report)
                    if !report.stalled
                        && report.published > 0
                        && report.published == self.config.batch_size =>
                {
                    continue;
                }
                Ok(_) => {}
                Err(e) => error!("outbox relay error: {e}"),
            }

            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("outbox relay stopped");
        Ok(())
    }
}
