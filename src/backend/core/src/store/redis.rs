//! Redis-backed store.
//!
//! Plain commands go through a shared [`ConnectionManager`]. `WATCH` state is
//! per connection, so every transaction runs on a dedicated connection. Those
//! are kept in a small idle pool (`max_idle_transactions`) and reused once
//! their transaction ended cleanly with `EXEC` or `UNWATCH`; a transaction that
//! errors or is dropped midway closes its connection. With an empty pool each
//! transaction pays a TCP connect.

use ::redis::aio::{Connection, ConnectionManager};
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Store, Transaction, WriteOp};
use crate::config::RedisConfig;
use crate::error::{ErrorCode, QueueError, Result};
use crate::telemetry::SensitiveFieldRedactor;

/// Store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    idle: Arc<IdlePool<Connection>>,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| {
            QueueError::with_internal(
                ErrorCode::StoreConnectionFailed,
                "Failed to create Redis client",
                e.to_string(),
            )
        })?;

        let mut manager = ConnectionManager::new(client.clone()).await.map_err(|e| {
            QueueError::with_internal(
                ErrorCode::StoreConnectionFailed,
                "Failed to connect to Redis",
                e.to_string(),
            )
        })?;

        ::redis::cmd("PING")
            .query_async::<_, String>(&mut manager)
            .await
            .map_err(|e| {
                QueueError::with_internal(
                    ErrorCode::StoreConnectionFailed,
                    "Redis ping failed",
                    e.to_string(),
                )
            })?;

        info!(
            url = %SensitiveFieldRedactor::global().redact_url(&config.url),
            "Redis store connected"
        );

        Ok(Self {
            client,
            manager,
            idle: Arc::new(IdlePool::new(config.max_idle_transactions)),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    fn transaction(&self, conn: Connection) -> Box<dyn Transaction> {
        Box::new(RedisTransaction {
            conn,
            idle: Arc::clone(&self.idle),
        })
    }
}

async fn watch_on(conn: &mut Connection, keys: &[String]) -> Result<()> {
    if !keys.is_empty() {
        ::redis::cmd("WATCH")
            .arg(keys)
            .query_async::<_, ()>(conn)
            .await?;
    }
    Ok(())
}

/// Bounded stack of idle connections.
struct IdlePool<T> {
    idle: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T> IdlePool<T> {
    fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    fn take(&self) -> Option<T> {
        self.idle.lock().pop()
    }

    /// Keep `item` for reuse; returns `false` (dropping it) when full.
    fn put(&self, item: T) -> bool {
        let mut idle = self.idle.lock();
        if idle.len() >= self.capacity {
            return false;
        }
        idle.push(item);
        true
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn watch(&self, keys: &[String]) -> Result<Box<dyn Transaction>> {
        if let Some(mut conn) = self.idle.take() {
            match watch_on(&mut conn, keys).await {
                Ok(()) => return Ok(self.transaction(conn)),
                Err(e) => debug!(error = %e, "Idle transaction connection failed, reconnecting"),
            }
        }
        let mut conn = self.client.get_async_connection().await?;
        watch_on(&mut conn, keys).await?;
        Ok(self.transaction(conn))
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        Ok(self.conn().incr(key, 1_i64).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.conn().hget(key, field).await?)
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<Vec<u8>>> = ::redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut self.conn())
            .await?;
        Ok(values)
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        Ok(self.conn().hlen(key).await?)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        Ok(self.conn().zcard(key).await?)
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        start: usize,
        stop: usize,
    ) -> Result<Vec<(String, f64)>> {
        Ok(self
            .conn()
            .zrange_withscores(
                key,
                isize::try_from(start).unwrap_or(isize::MAX),
                isize::try_from(stop).unwrap_or(-1),
            )
            .await?)
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        Ok(self.conn().scard(key).await?)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.conn().smembers(key).await?)
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.conn().del::<_, ()>(keys).await?;
        Ok(())
    }
}

struct RedisTransaction {
    conn: Connection,
    idle: Arc<IdlePool<Connection>>,
}

impl RedisTransaction {
    /// Hand the connection back once it carries no `WATCH` state.
    fn release(self: Box<Self>) {
        let RedisTransaction { conn, idle } = *self;
        idle.put(conn);
    }
}

#[async_trait]
impl Transaction for RedisTransaction {
    async fn zfirst_by_score(&mut self, key: &str, max: f64) -> Result<Option<(String, f64)>> {
        let mut first: Vec<(String, f64)> = ::redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut self.conn)
            .await?;
        Ok(first.pop())
    }

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.conn.hget(key, field).await?)
    }

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        Ok(self.conn.hgetall(key).await?)
    }

    async fn sismember(&mut self, key: &str, member: &str) -> Result<bool> {
        Ok(self.conn.sismember(key, member).await?)
    }

    async fn commit(mut self: Box<Self>, ops: Vec<WriteOp>) -> Result<bool> {
        if ops.is_empty() {
            // An empty pipeline never reaches the server, so the watch is
            // checked with a bare MULTI/EXEC.
            ::redis::cmd("MULTI")
                .query_async::<_, ()>(&mut self.conn)
                .await?;
            let reply: Option<::redis::Value> =
                ::redis::cmd("EXEC").query_async(&mut self.conn).await?;
            self.release();
            return Ok(reply.is_some());
        }

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                WriteOp::ZAdd { key, member, score } => {
                    pipe.cmd("ZADD").arg(key).arg(score).arg(member).ignore();
                }
                WriteOp::ZRem { key, member } => {
                    pipe.cmd("ZREM").arg(key).arg(member).ignore();
                }
                WriteOp::HSet { key, field, value } => {
                    pipe.cmd("HSET").arg(key).arg(field).arg(value).ignore();
                }
                WriteOp::HDel { key, field } => {
                    pipe.cmd("HDEL").arg(key).arg(field).ignore();
                }
                WriteOp::SAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                WriteOp::SRem { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member).ignore();
                }
            }
        }

        // EXEC replies nil when a watched key was modified.
        let reply: Option<::redis::Value> = pipe.query_async(&mut self.conn).await?;
        self.release();
        Ok(reply.is_some())
    }

    async fn discard(mut self: Box<Self>) -> Result<()> {
        ::redis::cmd("UNWATCH")
            .query_async::<_, ()>(&mut self.conn)
            .await?;
        self.release();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_pool_is_bounded() {
        let pool = IdlePool::new(2);
        assert!(pool.put(1));
        assert!(pool.put(2));
        assert!(!pool.put(3));

        assert_eq!(pool.take(), Some(2));
        assert!(pool.put(4));
        assert_eq!(pool.take(), Some(4));
        assert_eq!(pool.take(), Some(1));
        assert_eq!(pool.take(), None);
    }

    #[test]
    fn test_zero_capacity_pool_keeps_nothing() {
        let pool = IdlePool::new(0);
        assert!(!pool.put("conn"));
        assert_eq!(pool.take(), None);
    }
}
