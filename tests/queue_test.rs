//! Queue protocol tests against the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leaseq::error::Error;
use leaseq::model::{Document, Lease, MessageId, NewMessage, now};
use leaseq::queue::{GetOutcome, MAX_RETRIES, Queue};
use leaseq::store::{CountFilter, MemoryStore, Store};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    name: String,
}

fn job(name: &str) -> Job {
    Job {
        name: name.to_string(),
    }
}

fn queue() -> Queue<Job> {
    Queue::new(Arc::new(MemoryStore::new("test")))
}

// ---------------------------------------------------------------------------
// Ordering and visibility
// ---------------------------------------------------------------------------

#[tokio::test]
async fn higher_priority_is_claimed_first() {
    let q = queue();
    q.send(NewMessage::new(job("a")).priority(1.0)).await.unwrap();
    q.send(NewMessage::new(job("b")).priority(3.0)).await.unwrap();
    q.send(NewMessage::new(job("c")).priority(2.0)).await.unwrap();

    let order: Vec<String> = [
        q.get().await.unwrap().unwrap(),
        q.get().await.unwrap().unwrap(),
        q.get().await.unwrap().unwrap(),
    ]
    .into_iter()
    .map(|m| m.payload.name)
    .collect();

    assert_eq!(order, ["b", "c", "a"]);
    assert!(q.get().await.unwrap().is_none());
}

#[tokio::test]
async fn descending_priorities_come_out_in_send_order() {
    let q = queue();
    q.send(NewMessage::new(job("A")).priority(0.5)).await.unwrap();
    q.send(NewMessage::new(job("B")).priority(0.4)).await.unwrap();
    q.send(NewMessage::new(job("C")).priority(0.3)).await.unwrap();

    assert_eq!(q.get().await.unwrap().unwrap().payload.name, "A");
    assert_eq!(q.get().await.unwrap().unwrap().payload.name, "B");
    assert_eq!(q.get().await.unwrap().unwrap().payload.name, "C");
}

#[tokio::test]
async fn equal_priority_is_fifo() {
    let q = queue();
    for name in ["first", "second", "third"] {
        q.send(NewMessage::new(job(name))).await.unwrap();
    }

    for expected in ["first", "second", "third"] {
        let m = q.get().await.unwrap().unwrap();
        assert_eq!(m.payload.name, expected);
    }
}

#[tokio::test]
async fn negative_priority_waits_behind_default() {
    let q = queue();
    q.send(NewMessage::new(job("low")).priority(-5.0)).await.unwrap();
    q.send(NewMessage::new(job("normal"))).await.unwrap();

    assert_eq!(q.get().await.unwrap().unwrap().payload.name, "normal");
    assert_eq!(q.get().await.unwrap().unwrap().payload.name, "low");
}

#[tokio::test]
async fn delayed_message_is_hidden_until_earliest_get() {
    let q = queue();
    q.send(NewMessage::new(job("later")).delay(Duration::from_millis(200)))
        .await
        .unwrap();

    assert!(q.get().await.unwrap().is_none());
    assert_eq!(q.count().await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let m = q.get().await.unwrap().unwrap();
    assert_eq!(m.payload.name, "later");
}

#[tokio::test]
async fn earliest_get_200ms_is_visible_after_200ms_sleep() {
    let q = queue();
    let at = now() + chrono::Duration::milliseconds(200);
    q.send(NewMessage::new(job("X")).earliest_get(at)).await.unwrap();

    assert!(q.get().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let m = q.get().await.unwrap().unwrap();
    assert_eq!(m.payload.name, "X");
}

#[tokio::test]
async fn get_wait_picks_up_message_that_becomes_visible() {
    let q = queue();
    q.send(NewMessage::new(job("soon")).delay(Duration::from_millis(100)))
        .await
        .unwrap();

    let m = q.get_wait(Duration::from_secs(2)).await.unwrap();
    assert_eq!(m.unwrap().payload.name, "soon");
}

#[tokio::test]
async fn get_wait_gives_up_after_budget() {
    let q = queue();
    let started = std::time::Instant::now();
    let m = q
        .get_with(Duration::from_millis(20), Duration::from_millis(100))
        .await
        .unwrap();
    assert!(m.is_none());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2));
}

#[tokio::test]
async fn zero_wait_or_poll_is_single_check() {
    let q = queue();
    let started = std::time::Instant::now();
    assert!(
        q.get_with(Duration::from_millis(200), Duration::ZERO)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        q.get_with(Duration::ZERO, Duration::from_secs(5))
            .await
            .unwrap()
            .is_none()
    );
    assert!(started.elapsed() < Duration::from_secs(1));
}

// ---------------------------------------------------------------------------
// Claiming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claimed_message_is_leased_and_hidden() {
    let q = queue();
    q.send(NewMessage::new(job("only"))).await.unwrap();

    let m = q.get().await.unwrap().unwrap();
    assert!(m.is_leased(Utc::now()));
    assert!(m.reset_timestamp.unwrap() > now() + chrono::Duration::seconds(50));
    assert!(q.get().await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_claims_are_unique() {
    let q = Arc::new(queue());
    for i in 0..20 {
        q.send(NewMessage::new(job(&format!("job-{i}")))).await.unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let q = q.clone();
        tasks.push(tokio::spawn(async move { q.get().await.unwrap() }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        let m = task.await.unwrap().expect("every worker gets a message");
        assert!(ids.insert(m.id), "message {} claimed twice", m.id);
    }
    assert_eq!(ids.len(), 20);
    assert!(q.get().await.unwrap().is_none());
}

#[tokio::test]
async fn two_queues_share_one_store() {
    let store = Arc::new(MemoryStore::new("shared"));
    let producer: Queue<Job> = Queue::new(store.clone());
    let consumer: Queue<Job> = Queue::new(store);

    producer.send(NewMessage::new(job("x"))).await.unwrap();
    assert_eq!(consumer.get().await.unwrap().unwrap().payload.name, "x");
    assert!(producer.get().await.unwrap().is_none());
    assert_eq!(producer.name(), "shared");
}

#[tokio::test]
async fn zero_reset_duration_recovers_stuck_messages() {
    let q = queue();
    q.set_reset_duration(Duration::ZERO);
    assert_eq!(q.reset_duration(), Duration::ZERO);

    let sent = q.send(NewMessage::new(job("m"))).await.unwrap();
    let first = q.get().await.unwrap().unwrap();
    let second = q.get().await.unwrap().unwrap();

    assert_eq!(first.id, sent.id);
    assert_eq!(second.id, sent.id);
    assert_eq!(q.count_running(true).await.unwrap(), 0);
}

#[tokio::test]
async fn zero_reset_duration_frees_messages_claimed_before() {
    let q: Queue<Job> = Queue::with_reset_duration(
        Arc::new(MemoryStore::new("stuck")),
        Duration::from_millis(30),
    );
    q.send(NewMessage::new(job("stuck"))).await.unwrap();
    let first = q.get().await.unwrap().unwrap();

    // Switching to a zero lease lets a recovery sweep read the message
    // once its old lease runs out, without blocking it again.
    q.set_reset_duration(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(60)).await;

    let a = q.get().await.unwrap().unwrap();
    let b = q.get().await.unwrap().unwrap();
    assert_eq!(a.id, first.id);
    assert_eq!(b.id, first.id);
}

// ---------------------------------------------------------------------------
// Settling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ack_removes_message() {
    let q = queue();
    q.send(NewMessage::new(job("done"))).await.unwrap();
    let m = q.get().await.unwrap().unwrap();

    q.ack(&m).await.unwrap();
    assert_eq!(q.count().await.unwrap(), 0);

    // Acking again is harmless.
    q.ack(&m).await.unwrap();
}

#[tokio::test]
async fn ack_send_replaces_in_place() {
    let q = queue();
    q.send(NewMessage::new(job("step-1"))).await.unwrap();
    let m = q.get().await.unwrap().unwrap();

    let replaced = q
        .ack_send(&m, NewMessage::new(job("step-2")).priority(4.0))
        .await
        .unwrap();
    assert_eq!(replaced.id, m.id);
    assert!(replaced.reset_timestamp.is_none());
    assert_eq!(q.count().await.unwrap(), 1);

    let next = q.get().await.unwrap().unwrap();
    assert_eq!(next.id, m.id);
    assert_eq!(next.payload.name, "step-2");
    assert_eq!(next.priority, 4.0);
}

#[tokio::test]
async fn requeue_makes_message_claimable_again() {
    let q = queue();
    q.send(NewMessage::new(job("again")).retries(2)).await.unwrap();
    let m = q.get().await.unwrap().unwrap();

    let back = q.requeue(m.clone()).await.unwrap().unwrap();
    assert_eq!(back.id, m.id);
    assert_eq!(back.retries, 2);
    assert!(back.reset_timestamp.is_none());

    let again = q.get().await.unwrap().unwrap();
    assert_eq!(again.id, m.id);
}

#[tokio::test]
async fn requeue_with_applies_schedule_and_priority() {
    let q = queue();
    q.send(NewMessage::new(job("move"))).await.unwrap();
    let m = q.get().await.unwrap().unwrap();

    let later = now() + chrono::Duration::hours(1);
    let back = q.requeue_with(m, later, 9.0).await.unwrap().unwrap();
    assert_eq!(back.priority, 9.0);
    assert_eq!(back.earliest_get, later);
    assert!(back.reset_timestamp.is_none());

    assert!(q.get().await.unwrap().is_none());
    assert_eq!(q.count_running(false).await.unwrap(), 1);
    assert_eq!(q.count_running(true).await.unwrap(), 0);
}

#[tokio::test]
async fn requeued_message_goes_behind_its_tier() {
    let q = queue();
    q.send(NewMessage::new(job("first"))).await.unwrap();
    q.send(NewMessage::new(job("second"))).await.unwrap();

    let first = q.get().await.unwrap().unwrap();
    q.requeue(first).await.unwrap().unwrap();

    assert_eq!(q.get().await.unwrap().unwrap().payload.name, "second");
    assert_eq!(q.get().await.unwrap().unwrap().payload.name, "first");
}

#[tokio::test]
async fn non_finite_priority_is_rejected() {
    let q = queue();
    let err = q
        .send(NewMessage::new(job("nan")).priority(f64::NAN))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidPriority(_)));
    assert_eq!(q.count().await.unwrap(), 0);

    q.send(NewMessage::new(job("ok"))).await.unwrap();
    let m = q.get().await.unwrap().unwrap();
    let err = q
        .requeue_with(m, now(), f64::INFINITY)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidPriority(_)));
    assert_eq!(q.count_running(true).await.unwrap(), 1);
}

#[tokio::test]
async fn stale_requeue_cannot_revive_acked_message() {
    let store = Arc::new(MemoryStore::new("stale-ack"));
    let a: Queue<Job> = Queue::with_reset_duration(store.clone(), Duration::from_millis(20));
    let b: Queue<Job> = Queue::new(store);
    a.send(NewMessage::new(job("contested"))).await.unwrap();

    let stale = a.get().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fresh = b.get().await.unwrap().unwrap();
    assert_eq!(fresh.id, stale.id);
    b.ack(&fresh).await.unwrap();
    assert_eq!(b.count().await.unwrap(), 0);

    assert!(a.requeue(stale).await.unwrap().is_none());
    assert_eq!(a.count().await.unwrap(), 0);
}

#[tokio::test]
async fn stale_requeue_keeps_new_holders_lease() {
    let store = Arc::new(MemoryStore::new("stale-lease"));
    let a: Queue<Job> = Queue::with_reset_duration(store.clone(), Duration::from_millis(20));
    let b: Queue<Job> = Queue::new(store.clone());
    let c: Queue<Job> = Queue::new(store);
    a.send(NewMessage::new(job("contested"))).await.unwrap();

    let stale = a.get().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let held = b.get().await.unwrap().unwrap();

    assert!(a.requeue(stale).await.unwrap().is_none());
    assert!(c.get().await.unwrap().is_none());
    assert_eq!(b.count_running(true).await.unwrap(), 1);

    let mut held = held;
    assert!(b.update_reset_duration(&mut held).await.unwrap());
}

#[tokio::test]
async fn oversized_retry_budget_is_rejected() {
    let q = queue();
    let err = q
        .send(NewMessage::new(job("greedy")).retries(MAX_RETRIES + 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRetries(_)));

    q.send(NewMessage::new(job("ok")).retries(MAX_RETRIES)).await.unwrap();
    assert_eq!(q.count().await.unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Lease renewal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn renewal_extends_held_lease() {
    let q = queue();
    q.send(NewMessage::new(job("long"))).await.unwrap();
    let mut m = q.get().await.unwrap().unwrap();
    let before = m.reset_timestamp.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(q.update_reset_duration(&mut m).await.unwrap());
    assert!(m.reset_timestamp.unwrap() > before);

    // The refreshed view can renew again.
    assert!(q.update_reset_duration(&mut m).await.unwrap());
}

#[tokio::test]
async fn renewal_of_expired_lease_is_noop() {
    let q: Queue<Job> = Queue::with_reset_duration(
        Arc::new(MemoryStore::new("short")),
        Duration::from_millis(30),
    );
    q.send(NewMessage::new(job("slow"))).await.unwrap();
    let mut m = q.get().await.unwrap().unwrap();
    let seen = m.reset_timestamp;

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!q.update_reset_duration(&mut m).await.unwrap());
    assert_eq!(m.reset_timestamp, seen);
    assert_eq!(q.count_running(true).await.unwrap(), 0);
}

#[tokio::test]
async fn renewal_after_reclaim_is_noop() {
    let q: Queue<Job> = Queue::with_reset_duration(
        Arc::new(MemoryStore::new("reclaim")),
        Duration::from_millis(30),
    );
    q.send(NewMessage::new(job("contested"))).await.unwrap();
    let mut stale = q.get().await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    q.set_reset_duration(Duration::from_secs(60));
    let fresh = q.get().await.unwrap().unwrap();
    assert_eq!(fresh.id, stale.id);

    // Pretend the stale holder believes its lease is still live.
    stale.reset_timestamp = Some(now() + chrono::Duration::seconds(30));
    assert!(!q.update_reset_duration(&mut stale).await.unwrap());

    let mut fresh = fresh;
    assert!(q.update_reset_duration(&mut fresh).await.unwrap());
}

#[tokio::test]
async fn renewal_without_lease_is_noop() {
    let q = queue();
    let mut m = q.send(NewMessage::new(job("unclaimed"))).await.unwrap();
    assert!(!q.update_reset_duration(&mut m).await.unwrap());
}

// ---------------------------------------------------------------------------
// Transient store errors
// ---------------------------------------------------------------------------

/// Memory store whose first `fail_claims` claims fail.
struct FlakyStore {
    inner: MemoryStore,
    fail_claims: AtomicUsize,
    claims: AtomicUsize,
}

impl FlakyStore {
    fn failing(times: usize) -> Self {
        Self {
            inner: MemoryStore::new("flaky"),
            fail_claims: AtomicUsize::new(times),
            claims: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Store for FlakyStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn claim(
        &self,
        now: DateTime<Utc>,
        reset_until: DateTime<Utc>,
    ) -> leaseq::error::Result<Option<Document>> {
        self.claims.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .fail_claims
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::Other("store unavailable".to_string()));
        }
        self.inner.claim(now, reset_until).await
    }

    async fn insert(&self, doc: Document) -> leaseq::error::Result<()> {
        self.inner.insert(doc).await
    }

    async fn upsert(&self, doc: Document) -> leaseq::error::Result<()> {
        self.inner.upsert(doc).await
    }

    async fn requeue(
        &self,
        doc: Document,
        expected_reset: Option<DateTime<Utc>>,
    ) -> leaseq::error::Result<bool> {
        self.inner.requeue(doc, expected_reset).await
    }

    async fn delete(&self, id: MessageId) -> leaseq::error::Result<bool> {
        self.inner.delete(id).await
    }

    async fn renew(
        &self,
        lease: Lease,
        now: DateTime<Utc>,
        reset_until: DateTime<Utc>,
    ) -> leaseq::error::Result<bool> {
        self.inner.renew(lease, now, reset_until).await
    }

    async fn count(&self, filter: CountFilter, now: DateTime<Utc>) -> leaseq::error::Result<u64> {
        self.inner.count(filter, now).await
    }
}

#[tokio::test]
async fn claim_errors_are_retried_within_budget() {
    let store = Arc::new(FlakyStore::failing(2));
    let q: Queue<u32> = Queue::new(store.clone());
    q.send(NewMessage::new(1)).await.unwrap();

    let m = q
        .get_with(Duration::from_millis(10), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(m.unwrap().payload, 1);
    assert_eq!(store.claims.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn persistent_claim_errors_give_up_after_budget() {
    let store = Arc::new(FlakyStore::failing(usize::MAX));
    let q: Queue<u32> = Queue::new(store.clone());
    q.send(NewMessage::new(1)).await.unwrap();

    let m = q
        .get_with(Duration::from_millis(10), Duration::from_millis(100))
        .await
        .unwrap();
    assert!(m.is_none());
    assert!(store.claims.load(Ordering::SeqCst) > 1);
    assert_eq!(q.count_running(false).await.unwrap(), 1);
}

#[tokio::test]
async fn single_check_reports_claim_error_as_empty() {
    let store = Arc::new(FlakyStore::failing(1));
    let q: Queue<u32> = Queue::new(store);
    q.send(NewMessage::new(1)).await.unwrap();

    assert!(q.get().await.unwrap().is_none());
    assert_eq!(q.get().await.unwrap().unwrap().payload, 1);
}

// ---------------------------------------------------------------------------
// Counting and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn running_counts_partition_total() {
    let q = queue();
    for name in ["a", "b", "c"] {
        q.send(NewMessage::new(job(name))).await.unwrap();
    }
    q.get().await.unwrap().unwrap();

    let total = q.count().await.unwrap();
    let running = q.count_running(true).await.unwrap();
    let idle = q.count_running(false).await.unwrap();
    assert_eq!(total, 3);
    assert_eq!(running, 1);
    assert_eq!(running + idle, total);
}

#[tokio::test]
async fn cancelled_token_returns_without_claiming() {
    let q = queue();
    q.send(NewMessage::new(job("kept"))).await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let outcome = q
        .get_cancellable(Duration::from_millis(10), Duration::from_secs(5), &token)
        .await
        .unwrap();
    assert!(outcome.is_cancelled());
    assert_eq!(q.count_running(true).await.unwrap(), 0);
}

#[tokio::test]
async fn cancellation_interrupts_wait() {
    let q = queue();
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let outcome = q
        .get_cancellable(Duration::from_millis(500), Duration::from_secs(30), &token)
        .await
        .unwrap();
    assert!(matches!(outcome, GetOutcome::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn stored_document_tracks_lease() {
    let store = Arc::new(MemoryStore::new("inspect"));
    let q: Queue<Job> = Queue::new(store.clone());
    let sent = q.send(NewMessage::new(job("watched")).retries(3)).await.unwrap();

    let doc = store.find(sent.id).await.unwrap();
    assert!(doc.reset_timestamp.is_none());
    assert_eq!(doc.retries, 3);

    let m = q.get().await.unwrap().unwrap();
    let doc = store.find(m.id).await.unwrap();
    assert_eq!(doc.reset_timestamp, m.reset_timestamp);
    assert!(doc.is_running(now()));

    q.ack(&m).await.unwrap();
    assert!(store.find(m.id).await.is_none());
}
