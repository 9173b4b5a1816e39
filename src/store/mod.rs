//! Store port: the persistence primitives the queue is built on.
//!
//! Any backend that can do an atomic find-and-claim with filter + sort, a
//! conditional update, an upsert, a delete by id and a filtered count can
//! carry a queue. Atomicity lives here, never in the queue's process memory,
//! so any number of queues may share one backing collection.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Document, Lease, MessageId};

/// Which documents a count covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountFilter {
    All,
    /// `true`: lease still live. `false`: everything else.
    Running(bool),
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Name of the collection this store addresses.
    fn name(&self) -> &str;

    /// Atomically pick the best claimable document and lease it until
    /// `reset_until`.
    ///
    /// Claimable: `earliest_get <= now` and no live lease. Best: highest
    /// priority, then oldest `created`, then oldest insertion. Two concurrent
    /// callers must never receive the same document.
    async fn claim(
        &self,
        now: DateTime<Utc>,
        reset_until: DateTime<Utc>,
    ) -> Result<Option<Document>>;

    /// Insert a new document. Its id must not exist yet.
    async fn insert(&self, doc: Document) -> Result<()>;

    /// Replace the document with the same id, or insert it if absent, in one
    /// atomic step. The document moves to the back of its priority tier.
    async fn upsert(&self, doc: Document) -> Result<()>;

    /// Replace the stored document with `doc`, but only if it still exists
    /// and its lease expiry still equals `expected_reset`. The document moves
    /// to the back of its priority tier. Returns whether it was replaced.
    async fn requeue(
        &self,
        doc: Document,
        expected_reset: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Delete by id. Returns whether anything was deleted.
    async fn delete(&self, id: MessageId) -> Result<bool>;

    /// Move the lease expiry to `reset_until`, but only if the stored expiry
    /// still equals `lease.reset_timestamp` and is later than `now`.
    async fn renew(
        &self,
        lease: Lease,
        now: DateTime<Utc>,
        reset_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Count documents matching `filter`, evaluating leases against `now`.
    async fn count(&self, filter: CountFilter, now: DateTime<Utc>) -> Result<u64>;
}
