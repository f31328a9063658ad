//! Debug pagination view over the Time Index.
//!
//! Pages are plain range reads with no watch, so concurrent schedules, claims
//! or removals can shift page boundaries under a running scan and make it skip
//! or repeat entries. Use it for inspection, never for consumption.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use std::collections::VecDeque;

use super::entry::{time_of, EntryKey, JobId};
use super::ScheduledQueue;
use crate::error::{QueueError, Result};

/// One scheduled entry as seen by the pagination view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledItem {
    pub job_id: JobId,
    pub payload: Vec<u8>,
    pub ready_at: DateTime<Utc>,
}

/// Lazy, restartable cursor over the Time Index in ready-time order.
pub struct Items<'q> {
    queue: &'q ScheduledQueue,
    page_size: usize,
    /// Time Index offset of the next page to fetch.
    next_offset: usize,
    buffer: VecDeque<(usize, ScheduledItem)>,
    exhausted: bool,
}

impl<'q> Items<'q> {
    fn new(queue: &'q ScheduledQueue) -> Self {
        Self {
            queue,
            page_size: queue.config().page_size,
            next_offset: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Time Index offset of the item the next call to [`Items::next`] returns.
    pub fn position(&self) -> usize {
        self.buffer
            .front()
            .map(|(offset, _)| *offset)
            .unwrap_or(self.next_offset)
    }

    pub async fn next(&mut self) -> Result<Option<ScheduledItem>> {
        while self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        Ok(self.buffer.pop_front().map(|(_, item)| item))
    }

    /// Read the item at `offset` without moving the cursor.
    pub async fn get(&self, offset: usize) -> Result<Option<ScheduledItem>> {
        let mut page = self.queue.scheduled_range(offset, offset).await?;
        Ok(page.pop().map(|(_, item)| item))
    }

    /// Continue the scan from `offset`.
    pub fn seek(&mut self, offset: usize) {
        self.next_offset = offset;
        self.buffer.clear();
        self.exhausted = false;
    }

    pub fn restart(&mut self) {
        self.seek(0);
    }

    /// Current Time Index size; may change between calls.
    pub async fn len(&self) -> Result<u64> {
        self.queue.size().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<ScheduledItem>> + 'q {
        stream::try_unfold(self, |mut items| async move {
            Ok::<_, QueueError>(items.next().await?.map(|item| (item, items)))
        })
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let start = self.next_offset;
        let stop = start.saturating_add(self.page_size - 1);
        let (fetched, page) = self.queue.scheduled_range_counted(start, stop).await?;

        if fetched < self.page_size {
            self.exhausted = true;
        }
        self.next_offset = start + fetched;
        self.buffer.extend(page);
        Ok(())
    }
}

impl ScheduledQueue {
    /// Page through scheduled entries in ready-time order.
    pub fn items(&self) -> Items<'_> {
        Items::new(self)
    }

    async fn scheduled_range(&self, start: usize, stop: usize) -> Result<Vec<(usize, ScheduledItem)>> {
        Ok(self.scheduled_range_counted(start, stop).await?.1)
    }

    /// Items in `[start, stop]` plus the number of Time Index members read.
    /// Members whose payload vanished mid-scan are skipped.
    async fn scheduled_range_counted(
        &self,
        start: usize,
        stop: usize,
    ) -> Result<(usize, Vec<(usize, ScheduledItem)>)> {
        let members = self
            .store()
            .zrange_with_scores(&self.keys().queue, start, stop)
            .await?;
        let entries = members
            .iter()
            .map(|(member, score)| Ok((EntryKey::decode(member)?, time_of(*score)?)))
            .collect::<Result<Vec<_>>>()?;

        let fields: Vec<String> = entries.iter().map(|(entry, _)| entry.job_id.field()).collect();
        let payloads = self.store().hmget(&self.keys().payloads, &fields).await?;

        let items = entries
            .into_iter()
            .zip(payloads)
            .enumerate()
            .filter_map(|(i, ((entry, ready_at), payload))| {
                payload.map(|payload| {
                    (
                        start + i,
                        ScheduledItem {
                            job_id: entry.job_id,
                            payload,
                            ready_at,
                        },
                    )
                })
            })
            .collect();
        Ok((members.len(), items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::ScheduleRequest;
    use chrono::Duration;
    use futures::TryStreamExt;

    async fn queue_with(n: i64, page_size: usize) -> ScheduledQueue {
        let queue =
            ScheduledQueue::in_memory(QueueConfig::default().with_page_size(page_size)).unwrap();
        let base = Utc::now();
        for i in 0..n {
            queue
                .schedule(ScheduleRequest::new(
                    format!("p{}", i).into_bytes(),
                    base + Duration::seconds(i),
                ))
                .await
                .unwrap();
        }
        queue
    }

    #[tokio::test]
    async fn test_scan_crosses_page_boundaries() {
        let queue = queue_with(5, 2).await;
        let payloads: Vec<Vec<u8>> = queue
            .items()
            .into_stream()
            .map_ok(|item| item.payload)
            .try_collect()
            .await
            .unwrap();
        let expected: Vec<Vec<u8>> = (0..5).map(|i| format!("p{}", i).into_bytes()).collect();
        assert_eq!(payloads, expected);
    }

    #[tokio::test]
    async fn test_seek_get_and_restart() {
        let queue = queue_with(4, 3).await;
        let mut items = queue.items();

        assert_eq!(items.get(2).await.unwrap().unwrap().payload, b"p2".to_vec());
        assert_eq!(items.position(), 0);

        items.seek(3);
        assert_eq!(items.next().await.unwrap().unwrap().payload, b"p3".to_vec());
        assert!(items.next().await.unwrap().is_none());

        items.restart();
        assert_eq!(items.next().await.unwrap().unwrap().payload, b"p0".to_vec());
        assert_eq!(items.position(), 1);
        assert_eq!(items.len().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_unbounded_page_after_seek() {
        let queue = queue_with(3, usize::MAX).await;
        let mut items = queue.items();
        items.seek(1);
        assert_eq!(items.next().await.unwrap().unwrap().payload, b"p1".to_vec());
        assert_eq!(items.next().await.unwrap().unwrap().payload, b"p2".to_vec());
        assert!(items.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let queue = queue_with(0, 10).await;
        assert!(queue.items().next().await.unwrap().is_none());
        assert!(queue.items().get(0).await.unwrap().is_none());
    }
}
