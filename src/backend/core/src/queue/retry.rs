//! Optimistic transaction combinator.
//!
//! Every mutating queue operation has the same shape: watch a key set, read,
//! decide what to write, commit conditionally. [`optimistic`] owns the loop:
//! a rejected commit sleeps the fixed backoff and runs the attempt again from
//! a fresh watch, with no retry cap.
//!
//! Reads inside an attempt can be stale by the time the attempt decides. An
//! attempt that wants to fail because of what it read returns [`Step::Fail`];
//! the error is only surfaced if an empty commit proves the watched keys did
//! not move, otherwise the attempt is retried like any other conflict.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{QueueError, Result};
use crate::store::{Store, Transaction, WriteOp};
use crate::telemetry::QueueMetrics;

/// How an attempt ends.
#[derive(Debug)]
pub enum Step<T> {
    /// Commit the queued writes; yield `T` if the commit is accepted.
    Commit(T),
    /// Drop the watch without writing and yield `T`.
    Release(T),
    /// Fail with the error if the watched keys are unchanged; queued writes
    /// are dropped.
    Fail(QueueError),
}

/// One pass through an optimistic transaction: reads go to the store, writes
/// are queued until the combinator commits them.
pub struct Attempt {
    tx: Box<dyn Transaction>,
    ops: Vec<WriteOp>,
}

impl Attempt {
    fn new(tx: Box<dyn Transaction>) -> Self {
        Self {
            tx,
            ops: Vec::new(),
        }
    }

    pub async fn zfirst_by_score(&mut self, key: &str, max: f64) -> Result<Option<(String, f64)>> {
        self.tx.zfirst_by_score(key, max).await
    }

    pub async fn hget(&mut self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.tx.hget(key, field).await
    }

    pub async fn hgetall(&mut self, key: &str) -> Result<std::collections::HashMap<String, Vec<u8>>> {
        self.tx.hgetall(key).await
    }

    pub async fn sismember(&mut self, key: &str, member: &str) -> Result<bool> {
        self.tx.sismember(key, member).await
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn extend(&mut self, ops: impl IntoIterator<Item = WriteOp>) {
        self.ops.extend(ops);
    }
}

/// Run `attempt` until it releases or its commit is accepted.
///
/// An error from the attempt or the store ends the loop immediately. A
/// rejected commit, or a [`Step::Fail`] whose watch was broken, is retried.
pub async fn optimistic<T, F, Fut>(
    store: &dyn Store,
    watch: &[String],
    backoff: Duration,
    operation: &'static str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<(Attempt, Step<T>)>>,
{
    let mut conflicts: u32 = 0;
    loop {
        let tx = store.watch(watch).await?;
        let (done, step) = attempt(Attempt::new(tx)).await?;

        match step {
            Step::Release(value) => {
                done.tx.discard().await?;
                return Ok(value);
            }
            Step::Commit(value) => {
                if done.tx.commit(done.ops).await? {
                    return Ok(value);
                }
            }
            Step::Fail(err) => {
                if done.tx.commit(Vec::new()).await? {
                    return Err(err);
                }
                debug!(operation, error = %err, "Failure was based on stale reads, retrying");
            }
        }

        conflicts += 1;
        QueueMetrics::commit_conflict(operation);
        trace!(operation, conflicts, "Optimistic commit rejected, retrying");
        tokio::time::sleep(backoff).await;
    }
}
