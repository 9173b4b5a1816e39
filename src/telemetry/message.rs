//! Message processing span helpers.
//!
//! Provides span creation and state-transition recording for messages
//! flowing through a listener.

use tracing::Span;

use crate::model::MessageId;

/// Start a span for one claimed message.
///
/// The `message.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_message_span(queue: &str, id: &MessageId) -> Span {
    tracing::info_span!(
        "message.process",
        "message.queue" = queue,
        "message.id" = %id.0,
        "message.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("message.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
