//! Metric instrument factories for taskledger.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"taskledger"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for taskledger instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("taskledger")
}

/// Counter: events handed to the broker.
/// Labels: `event_type`, `result` ("ok" | "error").
pub fn events_published() -> Counter<u64> {
    meter()
        .u64_counter("taskledger.events.published")
        .with_description("Number of events handed to the broker")
        .build()
}

/// Counter: deliveries processed by a consumer loop.
/// Labels: `queue`, `disposition`.
pub fn deliveries() -> Counter<u64> {
    meter()
        .u64_counter("taskledger.deliveries")
        .with_description("Number of deliveries processed, by disposition")
        .build()
}

/// Counter: broker-level operations (send, read, ack, dead_letter).
/// Labels: `queue`, `operation`.
pub fn broker_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskledger.broker.operations")
        .with_description("Number of broker operations")
        .build()
}

/// Counter: schema gate decisions.
/// Labels: `event_type`, `result` ("valid" | "invalid").
pub fn schema_validations() -> Counter<u64> {
    meter()
        .u64_counter("taskledger.schema.validations")
        .with_description("Number of schema gate validations")
        .build()
}

/// Counter: ledger entries folded into balances.
/// Labels: `direction` ("debit" | "credit"), `result` ("applied" | "duplicate").
pub fn ledger_entries() -> Counter<u64> {
    meter()
        .u64_counter("taskledger.ledger.entries")
        .with_description("Number of ledger entries recorded")
        .build()
}

/// Counter: task lifecycle transitions.
/// Labels: `action` ("created" | "completed" | "reassigned").
pub fn task_transitions() -> Counter<u64> {
    meter()
        .u64_counter("taskledger.tasks.transitions")
        .with_description("Number of task lifecycle transitions")
        .build()
}

/// Counter: outbox rows relayed to the broker.
/// Labels: `result` ("published" | "failed").
pub fn outbox_relayed() -> Counter<u64> {
    meter()
        .u64_counter("taskledger.outbox.relayed")
        .with_description("Number of outbox rows relayed")
        .build()
}

/// Histogram: handler duration in milliseconds.
/// Labels: `event_type`.
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskledger.handler.duration_ms")
        .with_description("Event handler duration in milliseconds")
        .with_unit("ms")
        .build()
}
