//! In-process store.
//!
//! One async mutex around the whole collection makes every primitive atomic.
//! Suitable for tests and for queues whose consumers all live in one process.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{CountFilter, Store};
use crate::error::{Error, Result};
use crate::model::{Document, Lease, MessageId};

/// A stored document plus its insertion sequence (final tie-break).
struct Slot {
    seq: u64,
    doc: Document,
}

#[derive(Default)]
struct Collection {
    slots: HashMap<MessageId, Slot>,
    next_seq: u64,
}

impl Collection {
    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Higher priority first, then older `created`, then older insertion.
fn claim_order(a: &Slot, b: &Slot) -> Ordering {
    a.doc
        .priority
        .total_cmp(&b.doc.priority)
        .then_with(|| b.doc.created.cmp(&a.doc.created))
        .then_with(|| b.seq.cmp(&a.seq))
}

/// Claims scan every document, so their cost grows linearly with queue size.
pub struct MemoryStore {
    name: String,
    collection: Mutex<Collection>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collection: Mutex::new(Collection::default()),
        }
    }

    /// Snapshot of one document, as persisted.
    pub async fn find(&self, id: MessageId) -> Option<Document> {
        let collection = self.collection.lock().await;
        collection.slots.get(&id).map(|slot| slot.doc.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("default")
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn claim(
        &self,
        now: DateTime<Utc>,
        reset_until: DateTime<Utc>,
    ) -> Result<Option<Document>> {
        let mut collection = self.collection.lock().await;
        let best = collection
            .slots
            .values_mut()
            .filter(|slot| slot.doc.is_claimable(now))
            .max_by(|a, b| claim_order(a, b));

        Ok(best.map(|slot| {
            slot.doc.reset_timestamp = Some(reset_until);
            slot.doc.clone()
        }))
    }

    async fn insert(&self, doc: Document) -> Result<()> {
        let mut collection = self.collection.lock().await;
        let seq = collection.bump_seq();
        match collection.slots.entry(doc.id) {
            Entry::Occupied(_) => Err(Error::Other(format!(
                "message {} already exists in {}",
                doc.id, self.name
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Slot { seq, doc });
                Ok(())
            }
        }
    }

    async fn upsert(&self, doc: Document) -> Result<()> {
        let mut collection = self.collection.lock().await;
        let seq = collection.bump_seq();
        collection.slots.insert(doc.id, Slot { seq, doc });
        Ok(())
    }

    async fn requeue(
        &self,
        doc: Document,
        expected_reset: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut collection = self.collection.lock().await;
        let seq = collection.bump_seq();
        match collection.slots.get_mut(&doc.id) {
            Some(slot) if slot.doc.reset_timestamp == expected_reset => {
                *slot = Slot { seq, doc };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: MessageId) -> Result<bool> {
        let mut collection = self.collection.lock().await;
        Ok(collection.slots.remove(&id).is_some())
    }

    async fn renew(
        &self,
        lease: Lease,
        now: DateTime<Utc>,
        reset_until: DateTime<Utc>,
    ) -> Result<bool> {
        let mut collection = self.collection.lock().await;
        let Some(slot) = collection.slots.get_mut(&lease.id) else {
            return Ok(false);
        };
        match slot.doc.reset_timestamp {
            Some(current) if current == lease.reset_timestamp && current > now => {
                slot.doc.reset_timestamp = Some(reset_until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count(&self, filter: CountFilter, now: DateTime<Utc>) -> Result<u64> {
        let collection = self.collection.lock().await;
        let n = match filter {
            CountFilter::All => collection.slots.len(),
            CountFilter::Running(running) => collection
                .slots
                .values()
                .filter(|slot| slot.doc.is_running(now) == running)
                .count(),
        };
        Ok(n as u64)
    }
}
