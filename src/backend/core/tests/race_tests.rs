//! Integration tests for operations that interleave inside a transaction.
//!
//! Tests cover:
//! - Unschedule landing between a claim's due-query and its payload read
//! - Acknowledge landing between a recover's membership check and payload read
//! - Claim loops racing whole-owner removal

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tickq_core::config::QueueConfig;
use tickq_core::error::Result;
use tickq_core::queue::{JobId, OwnerScope, ScheduleRequest, ScheduledQueue};
use tickq_core::store::{MemoryStore, Store, Transaction, WriteOp};
use tokio_test::assert_ok;

fn config() -> QueueConfig {
    QueueConfig::default()
        .with_namespace("race")
        .with_conflict_backoff(StdDuration::from_millis(1))
}

type Interloper = BoxFuture<'static, ()>;

/// Store that runs a queued write from "another client" right before the next
/// transactional payload read.
#[derive(Clone)]
struct Interleaving {
    inner: MemoryStore,
    pending: Arc<Mutex<Option<Interloper>>>,
}

impl Interleaving {
    fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    fn before_next_payload_read<F>(&self, interloper: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        *self.pending.lock() = Some(interloper.boxed());
    }
}

#[async_trait]
impl Store for Interleaving {
    async fn watch(&self, keys: &[String]) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(InterleavingTx {
            inner: self.inner.watch(keys).await?,
            pending: Arc::clone(&self.pending),
        }))
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.inner.incr(key).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.inner.hget(key, field).await
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.inner.hmget(key, fields).await
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        self.inner.hlen(key).await
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.inner.zcard(key).await
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        start: usize,
        stop: usize,
    ) -> Result<Vec<(String, f64)>> {
        self.inner.zrange_with_scores(key, start, stop).await
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        self.inner.scard(key).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.inner.smembers(key).await
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        self.inner.del(keys).await
    }
}

struct InterleavingTx {
    inner: Box<dyn Transaction>,
    pending: Arc<Mutex<Option<Interloper>>>,
}

#[async_trait]
impl Transaction for InterleavingTx {
    async fn zfirst_by_score(&mut self, key: &str, max: f64) -> Result<Option<(String, f64)>> {
        self.inner.zfirst_by_score(key, max).await
    }

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        if key.ends_with(":payloads") {
            let interloper = self.pending.lock().take();
            if let Some(interloper) = interloper {
                interloper.await;
            }
        }
        self.inner.hget(key, field).await
    }

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        self.inner.hgetall(key).await
    }

    async fn sismember(&mut self, key: &str, member: &str) -> Result<bool> {
        self.inner.sismember(key, member).await
    }

    async fn commit(self: Box<Self>, ops: Vec<WriteOp>) -> Result<bool> {
        self.inner.commit(ops).await
    }

    async fn discard(self: Box<Self>) -> Result<()> {
        self.inner.discard().await
    }
}

/// A queue whose transactions can be interrupted, plus a plain queue on the
/// same data acting as the other client.
fn interleaved() -> (Interleaving, ScheduledQueue, Arc<ScheduledQueue>) {
    let store = MemoryStore::new();
    let interleaving = Interleaving::new(store.clone());
    let queue = ScheduledQueue::new(Arc::new(interleaving.clone()), config()).unwrap();
    let other = Arc::new(ScheduledQueue::new(Arc::new(store), config()).unwrap());
    (interleaving, queue, other)
}

// ============================================================================
// Claim
// ============================================================================

#[tokio::test]
async fn test_claim_yields_nothing_when_entry_is_unscheduled_midway() {
    let (interleaving, queue, other) = interleaved();
    other
        .schedule(
            ScheduleRequest::new(b"x".to_vec(), Utc::now() - Duration::seconds(1)).with_owner("1"),
        )
        .await
        .unwrap();

    let remover = Arc::clone(&other);
    interleaving.before_next_payload_read(async move {
        let removed = remover
            .unschedule_all_for(OwnerScope::owner("1"), None)
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
    });

    let claimed = assert_ok!(queue.claim(Some("w")).await);
    assert!(claimed.is_none());
    assert_eq!(queue.size().await.unwrap(), 0);
    assert_eq!(queue.processing_set_size().await.unwrap(), 0);
    assert_eq!(queue.num_users().await.unwrap(), 0);
}

#[tokio::test]
async fn test_claim_moves_to_next_entry_after_midway_unschedule() {
    let (interleaving, queue, other) = interleaved();
    let now = Utc::now();
    other
        .schedule(ScheduleRequest::new(b"gone".to_vec(), now - Duration::seconds(2)).with_owner("1"))
        .await
        .unwrap();
    let kept = other
        .schedule(ScheduleRequest::new(b"kept".to_vec(), now - Duration::seconds(1)).with_owner("2"))
        .await
        .unwrap();

    let remover = Arc::clone(&other);
    interleaving.before_next_payload_read(async move {
        remover
            .unschedule_all_for(OwnerScope::owner("1"), None)
            .await
            .unwrap();
    });

    let claim = queue.claim(None).await.unwrap().unwrap();
    assert_eq!(claim.job_id(), kept);
    assert_eq!(claim.payload(), b"kept");
}

// ============================================================================
// Recover
// ============================================================================

#[tokio::test]
async fn test_recover_after_midway_acknowledge_is_a_no_op() {
    let (interleaving, queue, other) = interleaved();
    let id = other
        .schedule(ScheduleRequest::new(b"x".to_vec(), Utc::now()).with_owner("1"))
        .await
        .unwrap();
    let claim = other.claim(None).await.unwrap().unwrap();

    let acker = Arc::clone(&other);
    let descriptor = claim.descriptor().clone();
    interleaving.before_next_payload_read(async move {
        assert!(acker.acknowledge(&descriptor).await.unwrap());
    });

    let recovered = assert_ok!(queue.recover(claim.descriptor(), claim.ready_at()).await);
    assert!(!recovered);
    assert_eq!(queue.size().await.unwrap(), 0);
    assert_eq!(queue.processing_set_size().await.unwrap(), 0);
    assert_eq!(queue.num_users().await.unwrap(), 0);
    assert_eq!(queue.item(id).await.unwrap(), None);
}

// ============================================================================
// Claim Loops vs. Removal
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_claims_and_owner_removal_partition_entries() {
    let queue = Arc::new(ScheduledQueue::in_memory(config()).unwrap());
    let ready_at = Utc::now() - Duration::seconds(1);
    let mut all = HashSet::new();
    for i in 0..40 {
        let id = queue
            .schedule(
                ScheduleRequest::new(format!("p{}", i).into_bytes(), ready_at)
                    .with_owner("1")
                    .with_type("t"),
            )
            .await
            .unwrap();
        all.insert(id);
    }

    let mut claimers = Vec::new();
    for worker in 0..3 {
        let queue = Arc::clone(&queue);
        claimers.push(tokio::spawn(async move {
            let tag = format!("w{}", worker);
            let mut claimed = Vec::new();
            while let Some(claim) = queue.claim(Some(tag.as_str())).await.unwrap() {
                claimed.push(claim.job_id());
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let remover = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut removed = Vec::new();
            for _ in 0..20 {
                removed.extend(
                    queue
                        .unschedule_all_for(OwnerScope::owner("1"), None)
                        .await
                        .unwrap(),
                );
                tokio::task::yield_now().await;
            }
            removed
        })
    };

    let mut claimed: Vec<JobId> = Vec::new();
    for handle in claimers {
        claimed.extend(handle.await.unwrap());
    }
    let removed = remover.await.unwrap();

    let claimed_set: HashSet<JobId> = claimed.iter().copied().collect();
    let removed_set: HashSet<JobId> = removed.iter().copied().collect();
    assert_eq!(claimed_set.len(), claimed.len(), "an entry was claimed twice");
    assert_eq!(removed_set.len(), removed.len(), "an entry was removed twice");
    assert!(claimed_set.is_disjoint(&removed_set));
    assert_eq!(&claimed_set | &removed_set, all);

    assert_eq!(queue.size().await.unwrap(), 0);
    assert_eq!(queue.num_users().await.unwrap(), 0);
    assert_eq!(queue.size_by_type("t").await.unwrap(), 0);
    assert_eq!(queue.processing_set_size().await.unwrap(), claimed.len() as u64);
    for id in removed {
        assert_eq!(queue.item(id).await.unwrap(), None);
    }
}
