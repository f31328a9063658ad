//! Claim protocol.
//!
//! A claim moves the earliest due entry from the Time Index into the In-Flight
//! Set in one optimistic transaction. Among concurrent claimers of the same
//! entry exactly one commit lands; the others see their watch broken and retry
//! against the updated queue. The payload stays put until the claim is
//! acknowledged.

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use super::entry::{score_of, time_of, ClaimDescriptor, Delivery, EntryKey, JobId};
use super::index::MemberList;
use super::retry::Step;
use super::ScheduledQueue;
use crate::error::{QueueError, Result};
use crate::store::WriteOp;
use crate::telemetry::QueueMetrics;

/// A claimed entry: the In-Flight descriptor plus what the handler needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    descriptor: ClaimDescriptor,
    ready_at: DateTime<Utc>,
    payload: Vec<u8>,
}

impl Claim {
    pub fn descriptor(&self) -> &ClaimDescriptor {
        &self.descriptor
    }

    pub fn job_id(&self) -> JobId {
        self.descriptor.job_id()
    }

    pub fn ready_at(&self) -> DateTime<Utc> {
        self.ready_at
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn delivery(&self) -> Delivery {
        Delivery {
            job_id: self.job_id(),
            payload: self.payload.clone(),
            ready_at: self.ready_at,
        }
    }
}

impl ScheduledQueue {
    /// Claim the earliest entry whose ready time has passed.
    ///
    /// Returns `None` when nothing is due. A due entry whose member cannot be
    /// parsed, or whose payload is gone, is an error and stays in the queue.
    #[instrument(skip(self), fields(namespace = %self.config().namespace))]
    pub async fn claim(&self, tag: Option<&str>) -> Result<Option<Claim>> {
        let keys = self.keys();

        let claimed = self
            .optimistic("claim", &keys.index_watch(), |mut attempt| async move {
                let now = Utc::now();
                let Some((member, score)) =
                    attempt.zfirst_by_score(&keys.queue, score_of(now)).await?
                else {
                    return Ok((attempt, Step::Release(None)));
                };

                let entry = EntryKey::decode(&member)?;
                // An unschedule committing after the due-query also drops the
                // payload; that moves the Time Index and is retried by Fail.
                let Some(payload) = attempt.hget(&keys.payloads, &entry.job_id.field()).await?
                else {
                    let err = QueueError::missing_payload(entry.job_id);
                    return Ok((attempt, Step::Fail(err)));
                };

                for (key, field) in [(&keys.owners, &entry.owner), (&keys.types, &entry.job_type)] {
                    if let Some(field) = field {
                        let mut list =
                            MemberList::decode(attempt.hget(key, field).await?.as_deref())?;
                        if list.remove(entry.job_id) {
                            attempt.push(list.write_op(key, field)?);
                        }
                    }
                }

                let ready_at = time_of(score)?;
                let descriptor = ClaimDescriptor::new(entry, now, tag.map(str::to_string))?;
                attempt.push(WriteOp::ZRem {
                    key: keys.queue.clone(),
                    member,
                });
                attempt.push(WriteOp::SAdd {
                    key: keys.processing.clone(),
                    member: descriptor.member().to_string(),
                });

                Ok::<_, QueueError>((
                    attempt,
                    Step::Commit(Some(Claim {
                        descriptor,
                        ready_at,
                        payload,
                    })),
                ))
            })
            .await?;

        if let Some(claim) = &claimed {
            QueueMetrics::claimed(&self.config().namespace);
            debug!(entry = %claim.descriptor.entry, "Entry claimed");
        }
        Ok(claimed)
    }

    /// Finish a claim: drop the descriptor and the payload together.
    ///
    /// Returns `false` (and deletes nothing) when the descriptor is no longer
    /// in flight, e.g. after it was recovered by someone else.
    #[instrument(skip(self, descriptor), fields(job_id = %descriptor.job_id()))]
    pub async fn acknowledge(&self, descriptor: &ClaimDescriptor) -> Result<bool> {
        let keys = self.keys();

        let acknowledged = self
            .optimistic(
                "acknowledge",
                std::slice::from_ref(&keys.processing),
                |mut attempt| async move {
                    if !attempt.sismember(&keys.processing, descriptor.member()).await? {
                        return Ok((attempt, Step::Release(false)));
                    }
                    attempt.push(WriteOp::SRem {
                        key: keys.processing.clone(),
                        member: descriptor.member().to_string(),
                    });
                    attempt.push(WriteOp::HDel {
                        key: keys.payloads.clone(),
                        field: descriptor.job_id().field(),
                    });
                    Ok::<_, QueueError>((attempt, Step::Commit(true)))
                },
            )
            .await?;

        if acknowledged {
            QueueMetrics::acknowledged(&self.config().namespace);
        } else {
            debug!("Descriptor no longer in flight, nothing acknowledged");
        }
        Ok(acknowledged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::error::ErrorCode;
    use crate::queue::ScheduleRequest;
    use crate::store::Store;
    use chrono::Duration;

    fn queue() -> ScheduledQueue {
        ScheduledQueue::in_memory(QueueConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_claim_picks_earliest_due_entry() {
        let queue = queue();
        let now = Utc::now();
        queue
            .schedule(ScheduleRequest::new(b"later".to_vec(), now - Duration::seconds(1)))
            .await
            .unwrap();
        let first = queue
            .schedule(ScheduleRequest::new(b"first".to_vec(), now - Duration::seconds(5)))
            .await
            .unwrap();
        queue
            .schedule(ScheduleRequest::new(b"future".to_vec(), now + Duration::hours(1)))
            .await
            .unwrap();

        let claim = queue.claim(Some("w1")).await.unwrap().unwrap();
        assert_eq!(claim.job_id(), first);
        assert_eq!(claim.payload(), b"first");
        assert_eq!(claim.descriptor().tag.as_deref(), Some("w1"));
        assert_eq!(queue.size().await.unwrap(), 2);
        assert_eq!(queue.processing_set_size().await.unwrap(), 1);
        // payload survives the claim
        assert_eq!(queue.item(first).await.unwrap(), Some(b"first".to_vec()));
    }

    #[tokio::test]
    async fn test_claim_with_nothing_due() {
        let queue = queue();
        queue
            .schedule(ScheduleRequest::new(b"x".to_vec(), Utc::now() + Duration::hours(1)))
            .await
            .unwrap();
        assert!(queue.claim(None).await.unwrap().is_none());
        assert_eq!(queue.processing_set_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_removes_entry_from_indexes() {
        let queue = queue();
        queue
            .schedule(
                ScheduleRequest::new(b"x".to_vec(), Utc::now())
                    .with_owner("3")
                    .with_type("red"),
            )
            .await
            .unwrap();

        queue.claim(None).await.unwrap().unwrap();
        assert_eq!(queue.num_users().await.unwrap(), 0);
        assert_eq!(queue.size_by_type("red").await.unwrap(), 0);
        assert!(queue.scheduled_for("3", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_deletes_payload_once() {
        let queue = queue();
        let id = queue
            .schedule(ScheduleRequest::new(b"x".to_vec(), Utc::now()))
            .await
            .unwrap();
        let claim = queue.claim(None).await.unwrap().unwrap();

        assert!(queue.acknowledge(claim.descriptor()).await.unwrap());
        assert_eq!(queue.item(id).await.unwrap(), None);
        assert_eq!(queue.processing_set_size().await.unwrap(), 0);
        assert!(!queue.acknowledge(claim.descriptor()).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_payload_leaves_entry_queued() {
        let queue = queue();
        let id = queue
            .schedule(ScheduleRequest::new(b"x".to_vec(), Utc::now()))
            .await
            .unwrap();
        let tx = queue.store().watch(&[]).await.unwrap();
        tx.commit(vec![WriteOp::HDel {
            key: queue.keys().payloads.clone(),
            field: id.field(),
        }])
        .await
        .unwrap();

        let err = queue.claim(None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingPayload);
        assert_eq!(queue.size().await.unwrap(), 1);
        assert_eq!(queue.processing_set_size().await.unwrap(), 0);
    }
}
