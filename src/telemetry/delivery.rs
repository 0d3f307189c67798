//! Delivery processing span helpers.
//!
//! One span per delivery pulled off a queue, from receipt to
//! acknowledgement.

use tracing::Span;

/// Start a span for processing one delivery.
///
/// `event.type` and `delivery.disposition` are declared empty and filled in
/// once known.
pub fn start_delivery_span(queue: &str, tag: i64, attempt: u32) -> Span {
    tracing::info_span!(
        "delivery.process",
        "messaging.destination" = queue,
        "messaging.message.id" = tag,
        "delivery.attempt" = attempt,
        "event.type" = tracing::field::Empty,
        "delivery.disposition" = tracing::field::Empty,
    )
}

/// Record the decoded event type on the span.
pub fn record_event_type(span: &Span, event_type: &str) {
    span.record("event.type", event_type);
}

/// Record how the delivery ended and emit an `info` event in its scope.
pub fn record_disposition(span: &Span, disposition: &str) {
    span.record("delivery.disposition", disposition);
    span.in_scope(|| {
        tracing::info!(disposition, "delivery_settled");
    });
}
