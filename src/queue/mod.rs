//! The queue protocol: send, claim, ack, replace, requeue and lease renewal
//! over an injected [`Store`].
//!
//! A `Queue` is cheap to share behind an `Arc`. Several queues, in one
//! process or many, may address the same collection; the store's atomic
//! claim is the only synchronization point between them.

mod poll;

pub use poll::GetOutcome;

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Lease, Message, MessageId, NewMessage, Payload, now};
use crate::store::{CountFilter, Store};
use crate::telemetry::metrics;

/// Lease length used until [`Queue::set_reset_duration`] is called.
pub const DEFAULT_RESET_DURATION: Duration = Duration::from_secs(60);

/// Poll interval used by [`Queue::get_wait`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Typed view of one message collection.
pub struct Queue<P> {
    store: Arc<dyn Store>,
    reset_duration_ms: AtomicU64,
    _payload: PhantomData<fn() -> P>,
}

fn check_priority(priority: f64) -> Result<()> {
    if priority.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidPriority(priority))
    }
}

/// Largest retry budget every store can persist.
pub const MAX_RETRIES: u32 = i32::MAX as u32;

fn check_retries(retries: u32) -> Result<()> {
    if retries <= MAX_RETRIES {
        Ok(())
    } else {
        Err(Error::InvalidRetries(retries))
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl<P: Payload> Queue<P> {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_reset_duration(store, DEFAULT_RESET_DURATION)
    }

    pub fn with_reset_duration(store: Arc<dyn Store>, reset_duration: Duration) -> Self {
        Self {
            store,
            reset_duration_ms: AtomicU64::new(duration_ms(reset_duration)),
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Lease length applied by subsequent claims and renewals.
    pub fn reset_duration(&self) -> Duration {
        Duration::from_millis(self.reset_duration_ms.load(Ordering::Relaxed))
    }

    pub fn set_reset_duration(&self, reset_duration: Duration) {
        self.reset_duration_ms
            .store(duration_ms(reset_duration), Ordering::Relaxed);
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ms = i64::try_from(self.reset_duration_ms.load(Ordering::Relaxed)).unwrap_or(i64::MAX);
        chrono::Duration::try_milliseconds(ms)
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn record(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name().to_string()),
                KeyValue::new("operation", operation),
            ],
        );
    }

    // -----------------------------------------------------------------------
    // Producing
    // -----------------------------------------------------------------------

    /// Persist a new message. Visible immediately unless an `earliest_get`
    /// or delay was set on the builder.
    pub async fn send(&self, new: NewMessage<P>) -> Result<Message<P>> {
        check_priority(new.priority)?;
        check_retries(new.retries)?;
        let message = new.into_message(MessageId::new(), now());
        self.store.insert(message.to_document()?).await?;
        self.record("send");
        debug!(
            queue = self.name(),
            id = %message.id,
            priority = message.priority,
            earliest_get = %message.earliest_get,
            "message sent"
        );
        Ok(message)
    }

    // -----------------------------------------------------------------------
    // Claiming
    // -----------------------------------------------------------------------

    /// Claim the best eligible message with a single immediate check.
    pub async fn get(&self) -> Result<Option<Message<P>>> {
        self.get_with(Duration::ZERO, Duration::ZERO).await
    }

    /// Claim, polling at [`DEFAULT_POLL_INTERVAL`] for up to `wait`.
    pub async fn get_wait(&self, wait: Duration) -> Result<Option<Message<P>>> {
        self.get_with(DEFAULT_POLL_INTERVAL, wait).await
    }

    /// Claim, polling every `poll` for up to `wait`.
    ///
    /// `None` means nothing became eligible in time (or the store kept
    /// failing); treat it as "try later".
    pub async fn get_with(&self, poll: Duration, wait: Duration) -> Result<Option<Message<P>>> {
        let never = CancellationToken::new();
        Ok(self.get_cancellable(poll, wait, &never).await?.into_message())
    }

    // `get_cancellable` lives in `poll.rs`.

    // -----------------------------------------------------------------------
    // Settling
    // -----------------------------------------------------------------------

    /// Delete the message permanently.
    pub async fn ack(&self, message: &Message<P>) -> Result<()> {
        let deleted = self.store.delete(message.id).await?;
        self.record("ack");
        if deleted {
            debug!(queue = self.name(), id = %message.id, "message acked");
        } else {
            debug!(queue = self.name(), id = %message.id, "ack of a message no longer stored");
        }
        Ok(())
    }

    /// Atomically replace `old` with `new`, keeping `old.id`.
    pub async fn ack_send(&self, old: &Message<P>, new: NewMessage<P>) -> Result<Message<P>> {
        check_priority(new.priority)?;
        check_retries(new.retries)?;
        let message = new.into_message(old.id, now());
        self.store.upsert(message.to_document()?).await?;
        self.record("ack_send");
        debug!(queue = self.name(), id = %message.id, "message replaced");
        Ok(message)
    }

    /// Return the message to the pool, visible now, at its current priority.
    pub async fn requeue(&self, message: Message<P>) -> Result<Option<Message<P>>> {
        let priority = message.priority;
        self.requeue_with(message, now(), priority).await
    }

    /// Return the message to the pool, visible from `earliest_get`.
    pub async fn requeue_at(
        &self,
        message: Message<P>,
        earliest_get: DateTime<Utc>,
    ) -> Result<Option<Message<P>>> {
        let priority = message.priority;
        self.requeue_with(message, earliest_get, priority).await
    }

    /// Return the message to the pool with a new schedule and priority.
    ///
    /// Lease state is cleared and `created` refreshed; payload and retries
    /// are kept as they are on `message`.
    ///
    /// Only the current lease holder can requeue: the store must still carry
    /// `message.reset_timestamp`. If the message was acked, or reclaimed by
    /// another consumer after this lease expired, nothing changes and `None`
    /// is returned.
    pub async fn requeue_with(
        &self,
        mut message: Message<P>,
        earliest_get: DateTime<Utc>,
        priority: f64,
    ) -> Result<Option<Message<P>>> {
        check_priority(priority)?;
        check_retries(message.retries)?;
        let held = message.reset_timestamp;
        message.earliest_get = earliest_get.trunc_subsecs(3);
        message.priority = priority;
        message.created = now();
        message.reset_timestamp = None;

        if !self.store.requeue(message.to_document()?, held).await? {
            self.record("requeue_stale");
            debug!(queue = self.name(), id = %message.id, "lease no longer held, not requeueing");
            return Ok(None);
        }

        self.record("requeue");
        debug!(
            queue = self.name(),
            id = %message.id,
            earliest_get = %message.earliest_get,
            retries = message.retries,
            "message requeued"
        );
        Ok(Some(message))
    }

    // -----------------------------------------------------------------------
    // Leases
    // -----------------------------------------------------------------------

    /// Extend the message's lease to now + reset duration.
    ///
    /// Returns `false` without side effects when the caller's lease is
    /// already expired or the store no longer carries it (reclaimed, acked or
    /// requeued elsewhere). On success `message.reset_timestamp` is updated.
    pub async fn update_reset_duration(&self, message: &mut Message<P>) -> Result<bool> {
        let Some(mut lease) = message.lease() else {
            return Ok(false);
        };
        let renewed = self.renew(&mut lease).await?;
        if renewed {
            message.reset_timestamp = Some(lease.reset_timestamp);
        }
        Ok(renewed)
    }

    /// [`Queue::update_reset_duration`] for a bare lease.
    pub async fn renew(&self, lease: &mut Lease) -> Result<bool> {
        let now = now();
        if lease.is_expired(now) {
            debug!(queue = self.name(), id = %lease.id, "lease already expired, not renewing");
            return Ok(false);
        }
        let until = self.lease_until(now);
        if self.store.renew(*lease, now, until).await? {
            lease.reset_timestamp = until;
            self.record("renew");
            Ok(true)
        } else {
            self.record("renew_stale");
            debug!(queue = self.name(), id = %lease.id, "lease no longer held, not renewing");
            Ok(false)
        }
    }

    // -----------------------------------------------------------------------
    // Counting
    // -----------------------------------------------------------------------

    pub async fn count(&self) -> Result<u64> {
        self.store.count(CountFilter::All, now()).await
    }

    /// Count messages whose lease is live (`true`) or not (`false`).
    pub async fn count_running(&self, running: bool) -> Result<u64> {
        self.store.count(CountFilter::Running(running), now()).await
    }
}
