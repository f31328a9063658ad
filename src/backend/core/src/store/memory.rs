//! In-process store with Redis-compatible optimistic transactions.
//!
//! Every key carries a version that is bumped by any write touching it. A
//! transaction snapshots the versions of its watched keys; `commit` re-checks
//! them under the state lock and applies all writes or none.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{Store, Transaction, WriteOp};
use crate::error::Result;

#[derive(Debug, Default)]
struct MemoryState {
    counters: HashMap<String, i64>,
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    sets: HashMap<String, HashSet<String>>,
    versions: HashMap<String, u64>,
}

impl MemoryState {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn touch(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Members in rank order: score, then member bytes (Redis tie order).
    fn zsorted(&self, key: &str) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> = self
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| match a.1.total_cmp(&b.1) {
            Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });
        members
    }

    fn apply(&mut self, op: WriteOp) {
        self.touch(op.key());
        match op {
            WriteOp::ZAdd { key, member, score } => {
                self.zsets.entry(key).or_default().insert(member, score);
            }
            WriteOp::ZRem { key, member } => {
                if let Some(z) = self.zsets.get_mut(&key) {
                    z.remove(&member);
                    if z.is_empty() {
                        self.zsets.remove(&key);
                    }
                }
            }
            WriteOp::HSet { key, field, value } => {
                self.hashes.entry(key).or_default().insert(field, value);
            }
            WriteOp::HDel { key, field } => {
                if let Some(h) = self.hashes.get_mut(&key) {
                    h.remove(&field);
                    if h.is_empty() {
                        self.hashes.remove(&key);
                    }
                }
            }
            WriteOp::SAdd { key, member } => {
                self.sets.entry(key).or_default().insert(member);
            }
            WriteOp::SRem { key, member } => {
                if let Some(s) = self.sets.get_mut(&key) {
                    s.remove(&member);
                    if s.is_empty() {
                        self.sets.remove(&key);
                    }
                }
            }
        }
    }
}

/// Store backed by process memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn watch(&self, keys: &[String]) -> Result<Box<dyn Transaction>> {
        let state = self.state.lock();
        let watched = keys.iter().map(|k| (k.clone(), state.version(k))).collect();
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            watched,
        }))
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut state = self.state.lock();
        state.touch(key);
        let value = state.counters.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock();
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let state = self.state.lock();
        let hash = state.hashes.get(key);
        Ok(fields
            .iter()
            .map(|f| hash.and_then(|h| h.get(f)).cloned())
            .collect())
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        let state = self.state.lock();
        Ok(state.hashes.get(key).map_or(0, |h| h.len() as u64))
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let state = self.state.lock();
        Ok(state.zsets.get(key).map_or(0, |z| z.len() as u64))
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        start: usize,
        stop: usize,
    ) -> Result<Vec<(String, f64)>> {
        let state = self.state.lock();
        if stop < start {
            return Ok(Vec::new());
        }
        Ok(state
            .zsorted(key)
            .into_iter()
            .skip(start)
            .take((stop - start).saturating_add(1))
            .collect())
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let state = self.state.lock();
        Ok(state.sets.get(key).map_or(0, |s| s.len() as u64))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        for key in keys {
            state.touch(key);
            state.counters.remove(key);
            state.hashes.remove(key);
            state.zsets.remove(key);
            state.sets.remove(key);
        }
        Ok(())
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    watched: Vec<(String, u64)>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn zfirst_by_score(&mut self, key: &str, max: f64) -> Result<Option<(String, f64)>> {
        let state = self.state.lock();
        Ok(state.zsorted(key).into_iter().find(|(_, score)| *score <= max))
    }

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock();
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let state = self.state.lock();
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn sismember(&mut self, key: &str, member: &str) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.sets.get(key).is_some_and(|s| s.contains(member)))
    }

    async fn commit(self: Box<Self>, ops: Vec<WriteOp>) -> Result<bool> {
        let mut state = self.state.lock();
        let unchanged = self
            .watched
            .iter()
            .all(|(key, version)| state.version(key) == *version);
        if !unchanged {
            return Ok(false);
        }
        for op in ops {
            state.apply(op);
        }
        Ok(true)
    }

    async fn discard(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
