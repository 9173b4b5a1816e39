//! Blocking claim with a wait budget and cooperative cancellation.

use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Queue;
use crate::error::Result;
use crate::model::{Message, Payload, now};
use crate::telemetry::metrics;

/// Result of a cancellable claim.
#[derive(Debug)]
pub enum GetOutcome<P> {
    /// A message was claimed; the caller now holds its lease.
    Message(Message<P>),
    /// Nothing became eligible within the wait budget.
    Empty,
    /// The token fired before a message was claimed.
    Cancelled,
}

impl<P> GetOutcome<P> {
    pub fn into_message(self) -> Option<Message<P>> {
        match self {
            GetOutcome::Message(message) => Some(message),
            GetOutcome::Empty | GetOutcome::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GetOutcome::Cancelled)
    }
}

impl<P: Payload> Queue<P> {
    /// Claim the best eligible message, polling every `poll` for up to
    /// `wait`, and give up as soon as `cancel` fires.
    ///
    /// A zero `poll` or `wait` means one immediate check. Store errors while
    /// polling are logged and retried until the budget runs out. The only
    /// error returned is a payload that does not decode into `P`; that
    /// message stays leased and comes back when the lease expires.
    pub async fn get_cancellable(
        &self,
        poll: Duration,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<GetOutcome<P>> {
        if cancel.is_cancelled() {
            return Ok(GetOutcome::Cancelled);
        }

        let started = Instant::now();
        loop {
            let now = now();
            match self.store.claim(now, self.lease_until(now)).await {
                Ok(Some(doc)) => {
                    self.record("get");
                    let message = Message::from_document(doc)?;
                    debug!(
                        queue = self.name(),
                        id = %message.id,
                        priority = message.priority,
                        "message claimed"
                    );
                    return Ok(GetOutcome::Message(message));
                }
                Ok(None) => {}
                Err(e) => {
                    metrics::transient_errors()
                        .add(1, &[KeyValue::new("queue", self.name().to_string())]);
                    warn!(queue = self.name(), "claim failed, will retry within wait budget: {e}");
                }
            }

            let elapsed = started.elapsed();
            if poll.is_zero() || elapsed >= wait {
                self.record("get_empty");
                return Ok(GetOutcome::Empty);
            }

            let nap = poll.min(wait - elapsed);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(GetOutcome::Cancelled),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}
