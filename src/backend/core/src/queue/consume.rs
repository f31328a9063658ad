//! Consumption loop.

use std::future::Future;
use tracing::{error, instrument, warn};

use super::claim::Claim;
use super::entry::Delivery;
use super::ScheduledQueue;
use crate::error::QueueError;
use crate::telemetry::QueueMetrics;

impl ScheduledQueue {
    /// Claim due entries and hand each one to `handler`.
    ///
    /// A successful handler acknowledges its entry. A failing handler gets its
    /// entry put back on the Time Index at the original ready time, and its
    /// error ends the loop. When nothing is due the loop returns in
    /// nonblocking mode and sleeps `poll_interval` in blocking mode, so a
    /// blocking consumer only returns on error.
    #[instrument(skip(self, handler), fields(namespace = %self.config().namespace, blocking = self.config().blocking))]
    pub async fn each<F, Fut, E>(&self, tag: Option<&str>, mut handler: F) -> Result<(), E>
    where
        F: FnMut(Delivery) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<QueueError>,
    {
        loop {
            let Some(claim) = self.claim(tag).await.inspect_err(QueueError::log)? else {
                if self.config().blocking {
                    tokio::time::sleep(self.config().poll_interval).await;
                    continue;
                }
                return Ok(());
            };

            match handler(claim.delivery()).await {
                Ok(()) => {
                    self.acknowledge(claim.descriptor())
                        .await
                        .inspect_err(QueueError::log)?;
                }
                Err(e) => {
                    self.redeliver(&claim).await;
                    return Err(e);
                }
            }
        }
    }

    /// Return a failed claim to the Time Index with unchanged identity.
    async fn redeliver(&self, claim: &Claim) {
        match self.recover(claim.descriptor(), claim.ready_at()).await {
            Ok(true) => {
                QueueMetrics::redelivered(&self.config().namespace);
                warn!(job_id = %claim.job_id(), "Handler failed, entry redelivered");
            }
            Ok(false) => {
                warn!(job_id = %claim.job_id(), "Handler failed and claim was already gone");
            }
            Err(e) => {
                e.log();
                error!(job_id = %claim.job_id(), "Failed to redeliver entry");
            }
        }
    }
}
