//! Message envelope: identity and scheduling metadata around a caller payload.
//!
//! The queue never looks inside the payload. It only needs to turn it into a
//! JSON document for the store and back again, which is what [`Payload`]
//! guarantees.

use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

// ---------------------------------------------------------------------------
// Payload contract
// ---------------------------------------------------------------------------

/// Anything that can travel through the queue.
///
/// Blanket-implemented for every serde type that is safe to move across tasks.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Store-assigned message identity. Stable across requeue and ack_send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Current time at the precision every store can round-trip.
///
/// Postgres keeps microseconds; we keep milliseconds everywhere so a lease
/// timestamp read back compares equal to the one written.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A message as it exists in the store, with a typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<P> {
    pub id: MessageId,

    /// Caller data. Opaque to the queue.
    pub payload: P,

    /// Higher = more urgent. Always finite.
    pub priority: f64,

    /// Not claimable before this instant.
    pub earliest_get: DateTime<Utc>,

    /// Refreshed on every (re)insert. Breaks priority ties, oldest first.
    pub created: DateTime<Utc>,

    /// Lease expiry. `Some` and in the future means another consumer owns it.
    pub reset_timestamp: Option<DateTime<Utc>>,

    /// Remaining retry budget.
    pub retries: u32,
}

impl<P> Message<P> {
    /// Is the message leased as of `now`?
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.reset_timestamp.is_some_and(|reset| reset > now)
    }

    /// The caller's view of the current lease, if any.
    pub fn lease(&self) -> Option<Lease> {
        self.reset_timestamp.map(|reset_timestamp| Lease {
            id: self.id,
            reset_timestamp,
        })
    }
}

impl<P: Payload> Message<P> {
    pub(crate) fn to_document(&self) -> Result<Document> {
        Ok(Document {
            id: self.id,
            payload: serde_json::to_value(&self.payload)?,
            priority: self.priority,
            earliest_get: self.earliest_get,
            created: self.created,
            reset_timestamp: self.reset_timestamp,
            retries: self.retries,
        })
    }

    pub(crate) fn from_document(doc: Document) -> Result<Self> {
        Ok(Self {
            id: doc.id,
            payload: serde_json::from_value(doc.payload)?,
            priority: doc.priority,
            earliest_get: doc.earliest_get,
            created: doc.created,
            reset_timestamp: doc.reset_timestamp,
            retries: doc.retries,
        })
    }
}

/// A lease held on one message: the id plus the expiry the holder last saw.
///
/// Renewal succeeds only while the store still carries exactly this expiry,
/// so a holder whose lease was reclaimed elsewhere can never extend it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: MessageId,
    pub reset_timestamp: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.reset_timestamp <= now
    }
}

// ---------------------------------------------------------------------------
// Store document
// ---------------------------------------------------------------------------

/// Store-level form of a message. The payload is an untyped JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: MessageId,
    pub payload: serde_json::Value,
    pub priority: f64,
    pub earliest_get: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub reset_timestamp: Option<DateTime<Utc>>,
    pub retries: u32,
}

impl Document {
    /// Claimable iff visible and not under a live lease.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.earliest_get <= now && self.reset_timestamp.is_none_or(|reset| reset <= now)
    }

    pub fn is_running(&self, now: DateTime<Utc>) -> bool {
        self.reset_timestamp.is_some_and(|reset| reset > now)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a message that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NewMessage<P> {
    pub(crate) payload: P,
    pub(crate) priority: f64,
    pub(crate) earliest_get: Option<DateTime<Utc>>,
    pub(crate) retries: u32,
}

impl<P> NewMessage<P> {
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            priority: 0.0,
            earliest_get: None,
            retries: 0,
        }
    }

    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    /// Hide the message until `at`.
    pub fn earliest_get(mut self, at: DateTime<Utc>) -> Self {
        self.earliest_get = Some(at.trunc_subsecs(3));
        self
    }

    /// Hide the message for `delay` from now.
    pub fn delay(self, delay: std::time::Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let at = now().checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.earliest_get(at)
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Materialize under `id`, stamped with `now`.
    pub(crate) fn into_message(self, id: MessageId, now: DateTime<Utc>) -> Message<P> {
        Message {
            id,
            payload: self.payload,
            priority: self.priority,
            earliest_get: self.earliest_get.unwrap_or(now),
            created: now,
            reset_timestamp: None,
            retries: self.retries,
        }
    }
}
