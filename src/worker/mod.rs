//! Worker loop: a polling consumer that hands claimed messages to a
//! [`Handler`], keeps their leases alive while the handler runs, and applies
//! the retry budget when it fails.

mod listener;
mod renewal;

pub use listener::Listener;

use std::time::Duration;

use async_trait::async_trait;

use crate::model::{Message, Payload};

/// Business logic plugged into a [`Listener`].
#[async_trait]
pub trait Handler<P: Payload>: Send + Sync {
    /// Process one message. `Ok` acks it.
    async fn handle(&self, message: &Message<P>) -> anyhow::Result<()>;

    /// Called once after every failed `handle`, before the retry decision.
    async fn on_failure(&self, _message: &Message<P>, _error: &anyhow::Error) {}
}

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Poll interval while waiting in `get`.
    pub poll_interval: Duration,
    /// Wait budget for one `get`.
    pub wait: Duration,
    /// Lease renewal period. `None`: half the queue's reset duration.
    pub renew_interval: Option<Duration>,
    /// Delay before a requeued message becomes visible again.
    pub retry_delay: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            wait: Duration::from_secs(3),
            renew_interval: None,
            retry_delay: Duration::ZERO,
        }
    }
}

/// Where the listener is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Polling for work.
    Running,
    /// A handler is executing.
    Processing,
    /// Not polling: stopped, finished a single run, or never started.
    Stopped,
}

impl ListenerState {
    fn as_u8(self) -> u8 {
        match self {
            ListenerState::Running => 0,
            ListenerState::Processing => 1,
            ListenerState::Stopped => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ListenerState::Running,
            1 => ListenerState::Processing,
            _ => ListenerState::Stopped,
        }
    }
}

/// What happened to a claimed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// Handler succeeded; message deleted.
    Acked,
    /// Handler failed with budget left; message back in the pool.
    Requeued,
    /// Handler failed with no budget; message left claimed.
    Exhausted,
    /// Handler failed after the lease was lost to another consumer; the
    /// message was left to its new holder.
    LeaseLost,
}

impl Processed {
    pub fn as_str(self) -> &'static str {
        match self {
            Processed::Acked => "acked",
            Processed::Requeued => "requeued",
            Processed::Exhausted => "exhausted",
            Processed::LeaseLost => "lease_lost",
        }
    }
}

/// Result of one pass of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing was eligible within the wait budget.
    Idle,
    Processed(Processed),
    /// The stop signal fired while waiting.
    Stopped,
}
