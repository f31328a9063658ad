//! Chronological work-claiming queue.
//!
//! Callers deposit opaque payloads with a ready time; workers claim due
//! payloads, process them and acknowledge. All coordination happens through the
//! store's optimistic transactions, so any number of processes can share one
//! namespace without in-process locks.
//!
//! # Layout
//!
//! ```text
//! {ns}:queue       sorted set   entry key -> ready time (epoch ms)      Time Index
//! {ns}:processing  set          claim descriptors                       In-Flight Set
//! {ns}:counter     integer      last generated job id
//! {ns}:payloads    hash         job id -> payload                       Payload Store
//! {ns}:owners      hash         owner id -> [job id, ...]               Owner Index
//! {ns}:types       hash         type -> [job id, ...]                   Type Index
//! ```
//!
//! A job id is in at most one of the Time Index and the In-Flight Set, and its
//! payload stays in the Payload Store while it is in either. The Owner and Type
//! indexes hold exactly the job ids present in the Time Index.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tickq_core::prelude::*;
//!
//! let queue = ScheduledQueue::new(Arc::new(MemoryStore::new()), QueueConfig::default())?;
//! queue.schedule(ScheduleRequest::new(b"send-mail".to_vec(), Utc::now()).with_owner("42")).await?;
//!
//! queue.each(Some("worker-1"), |delivery| async move {
//!     process(delivery.payload).await?;
//!     Ok::<_, QueueError>(())
//! }).await?;
//! ```

pub mod claim;
pub mod consume;
pub mod entry;
pub mod index;
pub mod keys;
pub mod pagination;
pub mod retry;

pub use claim::Claim;
pub use entry::{ClaimDescriptor, Delivery, EntryKey, JobId};
pub use keys::QueueKeys;
pub use pagination::{Items, ScheduledItem};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use self::entry::score_of;
use self::index::{IndexSnapshot, MemberList};
use self::retry::{optimistic, Attempt, Step};
use crate::config::QueueConfig;
use crate::error::{ErrorCode, ErrorContext, QueueError, Result};
use crate::store::{MemoryStore, Store, WriteOp};
use crate::telemetry::QueueMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Requests
// ═══════════════════════════════════════════════════════════════════════════════

/// Arguments to [`ScheduledQueue::schedule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub payload: Vec<u8>,
    pub ready_at: DateTime<Utc>,
    pub owner: Option<String>,
    pub job_id: Option<JobId>,
    pub job_type: Option<String>,
}

impl ScheduleRequest {
    pub fn new(payload: impl Into<Vec<u8>>, ready_at: DateTime<Utc>) -> Self {
        Self {
            payload: payload.into(),
            ready_at,
            owner: None,
            job_id: None,
            job_type: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Reuse an existing job id instead of drawing one from the counter.
    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }
}

/// Owner selector for removal. `Any` is only meaningful together with a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerScope {
    Any,
    Owner(String),
}

impl OwnerScope {
    pub fn owner(id: impl Into<String>) -> Self {
        Self::Owner(id.into())
    }
}

#[derive(Debug, Clone, Copy)]
enum Selection<'a> {
    All,
    Ids(&'a [JobId]),
}

impl Selection<'_> {
    fn includes(&self, id: JobId) -> bool {
        match self {
            Self::All => true,
            Self::Ids(ids) => ids.contains(&id),
        }
    }
}

/// Point-in-time counts (read without a transaction).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub scheduled: u64,
    pub in_flight: u64,
    pub owners: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// A chronological work queue in one store namespace.
pub struct ScheduledQueue {
    store: Arc<dyn Store>,
    keys: QueueKeys,
    config: QueueConfig,
}

impl ScheduledQueue {
    pub fn new(store: Arc<dyn Store>, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            keys: QueueKeys::new(&config.namespace),
            store,
            config,
        })
    }

    /// Queue over a fresh [`MemoryStore`].
    pub fn in_memory(config: QueueConfig) -> Result<Self> {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub(crate) async fn optimistic<T, F, Fut>(
        &self,
        operation: &'static str,
        watch: &[String],
        attempt: F,
    ) -> Result<T>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: std::future::Future<Output = Result<(Attempt, Step<T>)>>,
    {
        optimistic(
            self.store.as_ref(),
            watch,
            self.config.conflict_backoff,
            operation,
            attempt,
        )
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduling
    // ─────────────────────────────────────────────────────────────────────────

    /// Store an entry and file it in the Time, Owner and Type indexes.
    ///
    /// Without an explicit job id one is drawn from the namespace counter.
    /// Re-scheduling an existing job id with the same owner and type replaces
    /// its ready time and payload. An explicit id already filed under a
    /// different owner or type is rejected with `PreconditionFailed`. Entries
    /// with neither owner nor type are not in any index, so re-using their id
    /// with another identity cannot be detected and leaves two members.
    #[instrument(
        skip(self, request),
        fields(namespace = %self.config.namespace, owner = ?request.owner, job_type = ?request.job_type)
    )]
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<JobId> {
        let job_id = match request.job_id {
            Some(id) => id,
            None => self.next_job_id().await?,
        };

        let entry = EntryKey::new(job_id, request.owner.clone(), request.job_type.clone());
        let member = entry.encode()?;
        let score = score_of(request.ready_at);
        let keys = &self.keys;
        let entry = &entry;
        let member = member.as_str();
        let payload = request.payload.as_slice();
        let explicit = request.job_id.is_some();

        self.optimistic(
            "schedule",
            &[keys.owners.clone(), keys.types.clone()],
            |mut attempt| async move {
                if explicit && filed_elsewhere(&mut attempt, keys, entry).await? {
                    let err = QueueError::precondition(
                        "job id is already scheduled with a different owner or type",
                    );
                    return Ok((attempt, Step::Fail(err)));
                }
                stage_schedule(&mut attempt, keys, entry, member, score, payload).await?;
                Ok::<_, QueueError>((attempt, Step::Commit(())))
            },
        )
        .await?;

        QueueMetrics::scheduled(&self.config.namespace);
        debug!(job_id = %job_id, ready_at = %request.ready_at, "Entry scheduled");
        Ok(job_id)
    }

    async fn next_job_id(&self) -> Result<JobId> {
        let raw = self.store.incr(&self.keys.counter).await?;
        u64::try_from(raw)
            .map(JobId)
            .map_err(|_| QueueError::malformed("job id counter", raw.to_string()))
    }

    /// Remove the given jobs of one owner (optionally narrowed to a type).
    ///
    /// With [`OwnerScope::Any`] the type is mandatory and selects the jobs.
    /// Claimed entries are not in the indexes and are left alone. Returns the
    /// ids actually removed.
    #[instrument(skip(self, job_ids), fields(namespace = %self.config.namespace, requested = job_ids.len()))]
    pub async fn unschedule(
        &self,
        owner: OwnerScope,
        job_ids: &[JobId],
        job_type: Option<&str>,
    ) -> Result<Vec<JobId>> {
        check_owner_scope(&owner, job_type)?;
        self.remove_entries("unschedule", &owner, Selection::Ids(job_ids), job_type)
            .await
    }

    /// Remove every scheduled entry of an owner (optionally of one type).
    #[instrument(skip(self), fields(namespace = %self.config.namespace))]
    pub async fn unschedule_all_for(
        &self,
        owner: OwnerScope,
        job_type: Option<&str>,
    ) -> Result<Vec<JobId>> {
        check_owner_scope(&owner, job_type)?;
        self.remove_entries("unschedule_all_for", &owner, Selection::All, job_type)
            .await
    }

    async fn remove_entries(
        &self,
        operation: &'static str,
        owner: &OwnerScope,
        selection: Selection<'_>,
        job_type: Option<&str>,
    ) -> Result<Vec<JobId>> {
        let keys = &self.keys;

        let removed = self
            .optimistic(operation, &keys.index_watch(), |mut attempt| async move {
                let mut owners = IndexSnapshot::decode(attempt.hgetall(&keys.owners).await?)?;
                let mut types = IndexSnapshot::decode(attempt.hgetall(&keys.types).await?)?;

                let candidates = match owner {
                    OwnerScope::Owner(id) => owners.list(id),
                    // check_owner_scope guarantees a type here
                    OwnerScope::Any => job_type.and_then(|t| types.list(t)),
                };
                let selected: Vec<JobId> = candidates
                    .map(|list| list.ids().to_vec())
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|id| selection.includes(*id))
                    .filter(|id| match job_type {
                        Some(t) => types.list(t).is_some_and(|list| list.contains(*id)),
                        None => true,
                    })
                    .collect();

                if selected.is_empty() {
                    return Ok((attempt, Step::Release(selected)));
                }

                for id in &selected {
                    let entry = EntryKey::new(
                        *id,
                        owners.field_of(*id).map(str::to_string),
                        types.field_of(*id).map(str::to_string),
                    );
                    attempt.push(WriteOp::ZRem {
                        key: keys.queue.clone(),
                        member: entry.encode()?,
                    });
                    attempt.push(WriteOp::HDel {
                        key: keys.payloads.clone(),
                        field: id.field(),
                    });
                }
                attempt.extend(owners.remove_all(&keys.owners, &selected)?);
                attempt.extend(types.remove_all(&keys.types, &selected)?);

                Ok::<_, QueueError>((attempt, Step::Commit(selected)))
            })
            .await?;

        if !removed.is_empty() {
            QueueMetrics::unscheduled(&self.config.namespace, removed.len());
            debug!(operation, removed = removed.len(), "Entries unscheduled");
        }
        Ok(removed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Scheduled `(job id, payload)` pairs of an owner, in index order.
    pub async fn scheduled_for(
        &self,
        owner: &str,
        job_type: Option<&str>,
    ) -> Result<Vec<(JobId, Vec<u8>)>> {
        let owned = MemberList::decode(
            self.store.hget(&self.keys.owners, owner).await?.as_deref(),
        )?;
        let typed = match job_type {
            Some(t) => Some(MemberList::decode(
                self.store.hget(&self.keys.types, t).await?.as_deref(),
            )?),
            None => None,
        };

        let ids: Vec<JobId> = owned
            .ids()
            .iter()
            .copied()
            .filter(|id| typed.as_ref().map_or(true, |list| list.contains(*id)))
            .collect();
        let fields: Vec<String> = ids.iter().map(JobId::field).collect();
        let payloads = self.store.hmget(&self.keys.payloads, &fields).await?;

        Ok(ids
            .into_iter()
            .zip(payloads)
            .filter_map(|(id, payload)| payload.map(|p| (id, p)))
            .collect())
    }

    /// Payload of a job that is scheduled or in flight.
    pub async fn item(&self, job_id: JobId) -> Result<Option<Vec<u8>>> {
        self.store.hget(&self.keys.payloads, &job_id.field()).await
    }

    /// Number of entries in the Time Index.
    pub async fn size(&self) -> Result<u64> {
        self.store.zcard(&self.keys.queue).await
    }

    /// Number of scheduled entries of one type.
    pub async fn size_by_type(&self, job_type: &str) -> Result<u64> {
        let list = MemberList::decode(
            self.store.hget(&self.keys.types, job_type).await?.as_deref(),
        )?;
        Ok(list.len() as u64)
    }

    /// Number of owners with at least one scheduled entry.
    pub async fn num_users(&self) -> Result<u64> {
        self.store.hlen(&self.keys.owners).await
    }

    pub async fn processing_set_size(&self) -> Result<u64> {
        self.store.scard(&self.keys.processing).await
    }

    /// Claimed, unacknowledged entries, oldest claim first.
    ///
    /// This is the recovery surface: a descriptor that stays here belongs to a
    /// worker that never acknowledged it.
    pub async fn processing_set_items(&self) -> Result<Vec<ClaimDescriptor>> {
        let mut descriptors = self
            .store
            .smembers(&self.keys.processing)
            .await?
            .iter()
            .map(|member| ClaimDescriptor::decode(member))
            .collect::<Result<Vec<_>>>()?;
        descriptors.sort_by_key(|d| (d.claimed_at, d.entry.job_id));
        Ok(descriptors)
    }

    /// In-flight descriptors claimed more than `older_than` ago.
    pub async fn stalled_claims(&self, older_than: Duration) -> Result<Vec<ClaimDescriptor>> {
        let age = chrono::Duration::from_std(older_than)
            .with_error_code(ErrorCode::InvalidInput)?;
        let cutoff = Utc::now() - age;
        Ok(self
            .processing_set_items()
            .await?
            .into_iter()
            .filter(|d| d.claimed_at <= cutoff)
            .collect())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let stats = QueueStats {
            scheduled: self.size().await?,
            in_flight: self.processing_set_size().await?,
            owners: self.num_users().await?,
        };
        QueueMetrics::snapshot(
            &self.config.namespace,
            stats.scheduled,
            stats.in_flight,
            stats.owners,
        );
        Ok(stats)
    }

    /// Delete every key of the namespace, in-flight claims included.
    #[instrument(skip(self), fields(namespace = %self.config.namespace))]
    pub async fn reset(&self) -> Result<()> {
        self.store.del(&self.keys.all()).await?;
        info!("Queue reset");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Recovery
    // ─────────────────────────────────────────────────────────────────────────

    /// Put a stuck claim back on the Time Index with its original identity.
    ///
    /// Scheduling and removing the descriptor commit together. Returns `false`
    /// when the descriptor is no longer in flight.
    #[instrument(skip(self, descriptor), fields(namespace = %self.config.namespace, job_id = %descriptor.job_id()))]
    pub async fn recover(
        &self,
        descriptor: &ClaimDescriptor,
        ready_at: DateTime<Utc>,
    ) -> Result<bool> {
        let keys = &self.keys;
        let entry = &descriptor.entry;
        let member = entry.encode()?;
        let member = member.as_str();
        let score = score_of(ready_at);
        let watch = [
            keys.processing.clone(),
            keys.owners.clone(),
            keys.types.clone(),
        ];

        let recovered = self
            .optimistic("recover", &watch, |mut attempt| async move {
                if !attempt.sismember(&keys.processing, descriptor.member()).await? {
                    return Ok((attempt, Step::Release(false)));
                }
                // A concurrent acknowledge removes the descriptor and the
                // payload together; Fail retries and then sees it gone.
                let Some(payload) = attempt.hget(&keys.payloads, &entry.job_id.field()).await?
                else {
                    let err = QueueError::missing_payload(entry.job_id);
                    return Ok((attempt, Step::Fail(err)));
                };

                stage_schedule(&mut attempt, keys, entry, member, score, &payload).await?;
                attempt.push(WriteOp::SRem {
                    key: keys.processing.clone(),
                    member: descriptor.member().to_string(),
                });
                Ok::<_, QueueError>((attempt, Step::Commit(true)))
            })
            .await?;

        if recovered {
            QueueMetrics::recovered(&self.config.namespace);
            info!(entry = %entry, "Stalled claim rescheduled");
        }
        Ok(recovered)
    }
}

/// Whether `entry.job_id` is already indexed under another owner or type.
async fn filed_elsewhere(attempt: &mut Attempt, keys: &QueueKeys, entry: &EntryKey) -> Result<bool> {
    let owners = IndexSnapshot::decode(attempt.hgetall(&keys.owners).await?)?;
    let types = IndexSnapshot::decode(attempt.hgetall(&keys.types).await?)?;
    let owner = owners.field_of(entry.job_id);
    let job_type = types.field_of(entry.job_id);
    if owner.is_none() && job_type.is_none() {
        return Ok(false);
    }
    Ok(owner != entry.owner.as_deref() || job_type != entry.job_type.as_deref())
}

/// Queue the writes that file `entry` in the Payload Store and all indexes.
async fn stage_schedule(
    attempt: &mut Attempt,
    keys: &QueueKeys,
    entry: &EntryKey,
    member: &str,
    score: f64,
    payload: &[u8],
) -> Result<()> {
    attempt.push(WriteOp::HSet {
        key: keys.payloads.clone(),
        field: entry.job_id.field(),
        value: payload.to_vec(),
    });

    for (key, field) in [(&keys.owners, &entry.owner), (&keys.types, &entry.job_type)] {
        if let Some(field) = field {
            let mut list = MemberList::decode(attempt.hget(key, field).await?.as_deref())?;
            list.insert(entry.job_id);
            attempt.push(list.write_op(key, field)?);
        }
    }

    attempt.push(WriteOp::ZAdd {
        key: keys.queue.clone(),
        member: member.to_string(),
        score,
    });
    Ok(())
}

fn check_owner_scope(owner: &OwnerScope, job_type: Option<&str>) -> Result<()> {
    match owner {
        OwnerScope::Owner(id) if id.is_empty() => {
            Err(QueueError::precondition("an owner id is required"))
        }
        OwnerScope::Any if job_type.is_none() => Err(QueueError::precondition(
            "a type is required when unscheduling for any owner",
        )),
        _ => Ok(()),
    }
}
