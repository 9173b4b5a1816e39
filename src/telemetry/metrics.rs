//! Metric instrument factories for leaseq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"leaseq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for leaseq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("leaseq")
}

/// Counter: queue-level operations.
/// Labels: `queue`, `operation` ("send" | "get" | "get_empty" | "ack" |
/// "ack_send" | "requeue" | "requeue_stale" | "renew" | "renew_stale").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: store errors swallowed while polling inside a wait budget.
/// Labels: `queue`.
pub fn transient_errors() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.queue.transient_errors")
        .with_description("Store errors retried during get polling")
        .build()
}

/// Counter: how the listener disposed of each claimed message.
/// Labels: `queue`, `outcome` ("acked" | "requeued" | "exhausted").
pub fn listener_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.listener.outcomes")
        .with_description("Listener message outcomes")
        .build()
}

/// Histogram: handler duration in milliseconds.
/// Labels: `queue`.
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("leaseq.handler.duration_ms")
        .with_description("Handler duration in milliseconds")
        .with_unit("ms")
        .build()
}
