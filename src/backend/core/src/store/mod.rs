//! The shared key-value store the queue is built on.
//!
//! The queue needs four things from a store:
//!
//! - a score-ordered set (insert by member, range by score with a limit, remove by member)
//! - hashes with field-level get/set/delete
//! - unordered sets with add/remove/members/cardinality
//! - an optimistic transaction: watch keys, read, then commit a batch of writes
//!   only if none of the watched keys changed in the meantime
//!
//! [`RedisStore`] maps these onto `WATCH`/`MULTI`/`EXEC`. [`MemoryStore`] emulates
//! the same semantics in process with per-key versions.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// A write queued inside an optimistic transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    ZAdd { key: String, member: String, score: f64 },
    ZRem { key: String, member: String },
    HSet { key: String, field: String, value: Vec<u8> },
    HDel { key: String, field: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
}

impl WriteOp {
    /// The key this write touches.
    pub fn key(&self) -> &str {
        match self {
            Self::ZAdd { key, .. }
            | Self::ZRem { key, .. }
            | Self::HSet { key, .. }
            | Self::HDel { key, .. }
            | Self::SAdd { key, .. }
            | Self::SRem { key, .. } => key,
        }
    }
}

/// Non-transactional access to the store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Start an optimistic transaction watching `keys`.
    async fn watch(&self, keys: &[String]) -> Result<Box<dyn Transaction>>;

    /// Atomically increment an integer key, returning the new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;

    /// Fetch several fields at once; the result is positional.
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    async fn hlen(&self, key: &str) -> Result<u64>;

    async fn zcard(&self, key: &str) -> Result<u64>;

    /// Members ranked `start..=stop` (ascending score), with scores.
    async fn zrange_with_scores(
        &self,
        key: &str,
        start: usize,
        stop: usize,
    ) -> Result<Vec<(String, f64)>>;

    async fn scard(&self, key: &str) -> Result<u64>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn del(&self, keys: &[String]) -> Result<()>;
}

/// An open optimistic transaction.
///
/// Reads see the live store. Writes are handed to [`Transaction::commit`], which
/// applies all of them atomically or none of them.
#[async_trait]
pub trait Transaction: Send {
    /// The lowest-scored member with `score <= max`.
    async fn zfirst_by_score(&mut self, key: &str, max: f64) -> Result<Option<(String, f64)>>;

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, Vec<u8>>>;

    async fn sismember(&mut self, key: &str, member: &str) -> Result<bool>;

    /// Apply `ops` iff no watched key changed since [`Store::watch`].
    ///
    /// Returns `false` when the commit was rejected; nothing was written then.
    async fn commit(self: Box<Self>, ops: Vec<WriteOp>) -> Result<bool>;

    /// Drop the watch without writing.
    async fn discard(self: Box<Self>) -> Result<()>;
}
