//! Event consumer: one long-lived loop per inbound queue.
//!
//! Pulls one delivery at a time, validates its payload against the schema
//! gate, dispatches it by event type to a registered handler and settles it
//! according to the [`AckMode`]. Deliveries on one queue are processed
//! strictly in order; the loop never holds more than one at a time.

pub mod registry;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::{Notify, watch};
use tracing::{Instrument, debug, error, info, warn};

use crate::broker::{Broker, Delivery};
use crate::error::{Error, ErrorClass, Result};
use crate::event::Envelope;
use crate::schema::SchemaGate;
use crate::telemetry::delivery::{record_disposition, record_event_type, start_delivery_span};
use crate::telemetry::metrics;

pub use registry::{EventHandler, HandlerRegistry, Route};

/// When a delivery is acknowledged to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Ack on receipt, before the handler runs. A handler failure or a crash
    /// mid-handler loses the event: at-most-once.
    Auto,
    /// Ack only after the handler succeeds. Failed deliveries reappear after
    /// the visibility timeout and are dead-lettered on attempt
    /// `max_attempts`.
    AfterCommit { max_attempts: u32 },
}

impl Default for AckMode {
    fn default() -> Self {
        AckMode::AfterCommit { max_attempts: 5 }
    }
}

impl std::str::FromStr for AckMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(AckMode::Auto),
            "after-commit" | "after_commit" => Ok(AckMode::default()),
            other => Err(Error::Config(format!(
                "unknown ack mode '{other}' (expected auto or after-commit)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub ack_mode: AckMode,
    /// How long a received delivery stays hidden from other readers.
    pub visibility_timeout: Duration,
    /// Upper bound on idle waits when no notification arrives.
    pub poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::default(),
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Listening,
    Dispatching,
    Stopped,
}

/// How one delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    /// Known type with nothing to do on this queue.
    Ignored,
    /// Undecodable, unregistered type or contract violation. Never retried.
    Rejected(String),
    /// Handler failed. Redelivered later under `AfterCommit`, lost under `Auto`.
    Failed { error: String, attempt: u32 },
    /// Handler kept failing and the delivery was parked.
    DeadLettered(String),
}

/// Disposition label for a delivery whose ack or dead-letter write failed.
pub const SETTLE_FAILED: &str = "settle_failed";

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Handled => "handled",
            Disposition::Ignored => "ignored",
            Disposition::Rejected(_) => "rejected",
            Disposition::Failed { .. } => "failed",
            Disposition::DeadLettered(_) => "dead_lettered",
        }
    }
}

/// What dispatching produced, before settlement.
enum Outcome {
    Handled,
    Ignored,
    Rejected(String),
    Failed(Error),
}

#[derive(Clone)]
pub struct Consumer {
    broker: Arc<dyn Broker>,
    queue: String,
    registry: Arc<HandlerRegistry>,
    gate: Arc<dyn SchemaGate>,
    config: ConsumerConfig,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    state: Arc<watch::Sender<ConsumerState>>,
}

impl Consumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
        registry: HandlerRegistry,
        gate: Arc<dyn SchemaGate>,
        config: ConsumerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            broker,
            queue: queue.into(),
            registry: Arc::new(registry),
            gate,
            config,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            state: Arc::new(state),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Ask the loop to stop. A delivery already being handled finishes first.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Subscribe to state changes.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    /// Run until [`Consumer::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        info!(queue = %self.queue, ack_mode = ?self.config.ack_mode, "consumer started");

        while !self.stopping.load(Ordering::SeqCst) {
            match self.process_one().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                // Logged by process_one.
                Err(_) => {}
            }

            tokio::select! {
                _ = self.shutdown.notified() => break,
                waited = self.broker.wait(&self.queue, self.config.poll_interval) => {
                    if let Err(e) = waited {
                        warn!(queue = %self.queue, "wait failed: {e}, polling");
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
            }
        }

        self.set_state(ConsumerState::Stopped);
        info!(queue = %self.queue, "consumer stopped");
        Ok(())
    }

    /// Take and fully settle at most one delivery. `Ok(None)` when the queue
    /// had nothing visible.
    pub async fn process_one(&self) -> Result<Option<Disposition>> {
        self.set_state(ConsumerState::Listening);
        let received = self
            .broker
            .receive(&self.queue, self.config.visibility_timeout)
            .await;
        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                self.set_state(ConsumerState::Idle);
                return Ok(None);
            }
            Err(e) => {
                self.set_state(ConsumerState::Idle);
                error!(queue = %self.queue, "receive failed: {e}");
                return Err(e);
            }
        };

        self.set_state(ConsumerState::Dispatching);
        let span = start_delivery_span(&self.queue, delivery.tag, delivery.attempt);
        let settled = async {
            if self.config.ack_mode == AckMode::Auto {
                self.broker.ack(&delivery).await?;
            }
            let outcome = self.dispatch(&delivery, &span).await;
            self.settle(&delivery, outcome).await
        }
        .instrument(span.clone())
        .await;
        self.set_state(ConsumerState::Idle);

        let disposition = match settled {
            Ok(disposition) => disposition,
            Err(e) => {
                error!(
                    queue = %self.queue,
                    tag = delivery.tag,
                    attempt = delivery.attempt,
                    "settle failed, delivery stays queued: {e}"
                );
                self.count_settled(&span, SETTLE_FAILED);
                return Err(e);
            }
        };
        self.count_settled(&span, disposition.label());
        Ok(Some(disposition))
    }

    fn count_settled(&self, span: &tracing::Span, label: &'static str) {
        record_disposition(span, label);
        metrics::deliveries().add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("disposition", label),
            ],
        );
    }

    async fn dispatch(&self, delivery: &Delivery, span: &tracing::Span) -> Outcome {
        let envelope = match Envelope::from_message(&delivery.message) {
            Ok(envelope) => envelope,
            Err(e) => return Outcome::Rejected(format!("undecodable envelope: {e}")),
        };
        record_event_type(span, envelope.event_type.as_str());

        let handler = match self.registry.route(envelope.event_type) {
            Route::Handle(handler) => handler,
            Route::Ignore => return Outcome::Ignored,
            Route::Unregistered => {
                return Outcome::Rejected(format!(
                    "no handler for {} on {}",
                    envelope.event_type, self.queue
                ));
            }
        };

        match self.gate.validate(envelope.event_type, &envelope.payload).await {
            Ok(()) => {}
            Err(e) if e.class() == ErrorClass::ContractViolation => {
                return Outcome::Rejected(e.to_string());
            }
            Err(e) => return Outcome::Failed(e),
        }

        let started = Instant::now();
        let handled = handler.handle(&envelope).await;
        metrics::handler_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("event_type", envelope.event_type.as_str())],
        );

        match handled {
            Ok(()) => Outcome::Handled,
            Err(e) if e.class() == ErrorClass::ContractViolation => {
                Outcome::Rejected(e.to_string())
            }
            Err(e) => Outcome::Failed(e),
        }
    }

    async fn settle(&self, delivery: &Delivery, outcome: Outcome) -> Result<Disposition> {
        let attempt = delivery.attempt;
        match (self.config.ack_mode, outcome) {
            (AckMode::Auto, Outcome::Handled) => Ok(Disposition::Handled),
            (AckMode::Auto, Outcome::Ignored) => Ok(Disposition::Ignored),
            (AckMode::Auto, Outcome::Rejected(reason)) => {
                warn!(%reason, "delivery rejected and discarded");
                Ok(Disposition::Rejected(reason))
            }
            (AckMode::Auto, Outcome::Failed(e)) => {
                error!(attempt, "handler failed after ack, event lost: {e}");
                Ok(Disposition::Failed {
                    error: e.to_string(),
                    attempt,
                })
            }
            (AckMode::AfterCommit { .. }, Outcome::Handled) => {
                self.broker.ack(delivery).await?;
                Ok(Disposition::Handled)
            }
            (AckMode::AfterCommit { .. }, Outcome::Ignored) => {
                self.broker.ack(delivery).await?;
                debug!("delivery ignored");
                Ok(Disposition::Ignored)
            }
            (AckMode::AfterCommit { .. }, Outcome::Rejected(reason)) => {
                warn!(%reason, "delivery rejected, dead-lettering");
                self.broker.dead_letter(delivery, &reason).await?;
                Ok(Disposition::Rejected(reason))
            }
            (AckMode::AfterCommit { max_attempts }, Outcome::Failed(e)) => {
                if attempt >= max_attempts {
                    let reason = format!("gave up after {attempt} attempts: {e}");
                    error!(attempt, "{reason}");
                    self.broker.dead_letter(delivery, &reason).await?;
                    Ok(Disposition::DeadLettered(reason))
                } else {
                    warn!(attempt, max_attempts, "handler failed, will be redelivered: {e}");
                    Ok(Disposition::Failed {
                        error: e.to_string(),
                        attempt,
                    })
                }
            }
        }
    }
}
