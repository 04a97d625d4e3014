//! Bounded, durable offline queue for undelivered segments.
//!
//! The [`OfflineQueue`] holds finalized segments that could not be
//! dispatched (connectivity loss, quota exhaustion, conflict exhaustion)
//! until the next drain cycle. Contents are persisted through the
//! [`StateStore`] as a single whole record on every mutation, so the queue
//! survives a process restart. Capacity is a hard bound: at 80% depth a
//! watermark warning is surfaced once, at 100% `enqueue` fails fast with
//! [`QueueError::Full`] rather than blocking the producer.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::segment::{epoch_millis, DeadLetter, IncrementalSegment, QueueItem};
use crate::storage::traits::{StateError, StateStore};

/// Queue-depth classification relative to the configured watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    Normal,
    /// Depth at or above the warning ratio (default 80%)
    Warning,
    /// Depth at capacity; enqueues fail fast
    Full,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("offline queue is full ({capacity} items)")]
    Full { capacity: usize },
    #[error(transparent)]
    State(#[from] StateError),
}

/// Bounded persistent FIFO of undelivered segments.
///
/// Single-writer: owned by the orchestrator's run loop; persistence happens
/// after the in-memory mutation so the durable record always reflects a
/// consistent whole.
pub struct OfflineQueue {
    store: std::sync::Arc<dyn StateStore>,
    queue_key: String,
    dead_key: String,
    capacity: usize,
    warn_ratio: f64,
    retry_limit: u32,
    items: VecDeque<QueueItem>,
    dead: Vec<DeadLetter>,
    /// Edge detection for watermark events
    last_reported: Watermark,
}

impl OfflineQueue {
    /// Open the queue for a document, loading any persisted contents from a
    /// previous run.
    pub async fn open(
        store: std::sync::Arc<dyn StateStore>,
        document_id: &str,
        capacity: usize,
        warn_ratio: f64,
        retry_limit: u32,
    ) -> Result<Self, StateError> {
        let queue_key = format!("queue/{document_id}");
        let dead_key = format!("dead/{document_id}");

        let items: VecDeque<QueueItem> = match store.load(&queue_key).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| StateError::Corrupt {
                key: queue_key.clone(),
                reason: e.to_string(),
            })?,
            None => VecDeque::new(),
        };
        let dead: Vec<DeadLetter> = match store.load(&dead_key).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| StateError::Corrupt {
                key: dead_key.clone(),
                reason: e.to_string(),
            })?,
            None => Vec::new(),
        };

        if !items.is_empty() {
            info!(
                document_id = %document_id,
                depth = items.len(),
                "Offline queue has items from previous run"
            );
        }

        Ok(Self {
            store,
            queue_key,
            dead_key,
            capacity,
            warn_ratio,
            retry_limit,
            items,
            dead,
            last_reported: Watermark::Normal,
        })
    }

    /// Append a fresh segment. Fails fast with [`QueueError::Full`] at
    /// capacity; the queue never exceeds its configured bound.
    pub async fn enqueue(&mut self, segment: IncrementalSegment) -> Result<(), QueueError> {
        self.enqueue_item(QueueItem::new(segment)).await
    }

    /// Append an existing queue item (used when spilling pending coalesced
    /// segments on shutdown).
    pub async fn enqueue_item(&mut self, item: QueueItem) -> Result<(), QueueError> {
        if self.items.len() >= self.capacity {
            warn!(
                capacity = self.capacity,
                sequence_id = item.segment.sequence_id,
                "Offline queue full, rejecting segment"
            );
            return Err(QueueError::Full { capacity: self.capacity });
        }

        self.items.push_back(item);
        self.persist_queue().await?;
        crate::metrics::set_queue_depth(self.items.len());
        Ok(())
    }

    /// Oldest-first view of up to `max_items` items whose combined text
    /// stays under `max_chars`. Always returns at least one item when the
    /// queue is non-empty, so an oversized segment cannot wedge the drain.
    /// The batch never spans a session change or a sequence discontinuity;
    /// a joined write of the returned items is always one contiguous run.
    #[must_use]
    pub fn peek_batch(&self, max_items: usize, max_chars: usize) -> Vec<QueueItem> {
        let mut out: Vec<QueueItem> = Vec::new();
        let mut chars = 0usize;
        for item in &self.items {
            let len = item.segment.char_len();
            if let Some(prev) = out.last() {
                let contiguous = prev.segment.session_id == item.segment.session_id
                    && item.segment.sequence_id == prev.segment.sequence_id + 1;
                if !contiguous || out.len() >= max_items || chars + len > max_chars {
                    break;
                }
            }
            chars += len;
            out.push(item.clone());
            if out.len() >= max_items {
                break;
            }
        }
        out
    }

    /// Oldest-first iterator over the queued items, without removing them.
    pub fn iter(&self) -> impl Iterator<Item = &QueueItem> {
        self.items.iter()
    }

    /// Remove delivered items by segment id. Idempotent: unknown ids are
    /// ignored, so a retried ack after a crash is harmless.
    pub async fn ack(&mut self, session_id: &str, sequence_ids: &[u64]) -> Result<usize, StateError> {
        let before = self.items.len();
        self.items.retain(|item| {
            !(item.segment.session_id == session_id
                && sequence_ids.contains(&item.segment.sequence_id))
        });
        let removed = before - self.items.len();
        if removed > 0 {
            self.persist_queue().await?;
            crate::metrics::set_queue_depth(self.items.len());
            debug!(removed, depth = self.items.len(), "Acked delivered items");
        }
        Ok(removed)
    }

    /// Return a failed batch to the front of the queue in original order,
    /// bumping retry counts. Items that exhausted their retries are moved
    /// to the dead-letter list instead; the moved dead letters are returned
    /// so the caller can surface them.
    pub async fn requeue_failed(
        &mut self,
        items: Vec<QueueItem>,
        error: &str,
    ) -> Result<Vec<DeadLetter>, StateError> {
        let mut newly_dead = Vec::new();

        // push_front in reverse keeps the batch's original order at the head
        for mut item in items.into_iter().rev() {
            item.retry_count += 1;
            item.last_error = Some(error.to_string());

            if item.retry_count > self.retry_limit {
                newly_dead.push(DeadLetter {
                    attempts: item.retry_count,
                    error: error.to_string(),
                    failed_at: epoch_millis(),
                    segment: item.segment,
                });
            } else {
                self.items.push_front(item);
            }
        }

        if !newly_dead.is_empty() {
            newly_dead.reverse();
            warn!(
                count = newly_dead.len(),
                retry_limit = self.retry_limit,
                "Items exhausted retries, moved to dead-letter list"
            );
            for _ in &newly_dead {
                crate::metrics::record_dead_letter();
            }
            self.dead.extend(newly_dead.iter().cloned());
            self.persist_dead().await?;
        }
        self.persist_queue().await?;
        crate::metrics::set_queue_depth(self.items.len());

        Ok(newly_dead)
    }

    /// Move a terminally failed item straight to the dead-letter list.
    pub async fn dead_letter(&mut self, item: QueueItem, error: &str) -> Result<(), StateError> {
        warn!(
            sequence_id = item.segment.sequence_id,
            error = %error,
            "Item failed terminally, dead-lettered"
        );
        crate::metrics::record_dead_letter();
        self.dead.push(DeadLetter {
            attempts: item.retry_count + 1,
            error: error.to_string(),
            failed_at: epoch_millis(),
            segment: item.segment,
        });
        self.persist_dead().await
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Dead letters surfaced to the operator.
    #[must_use]
    pub fn dead_letters(&self) -> &[DeadLetter] {
        &self.dead
    }

    /// Current depth classification.
    #[must_use]
    pub fn watermark(&self) -> Watermark {
        let depth = self.items.len();
        if depth >= self.capacity {
            Watermark::Full
        } else if depth as f64 >= self.capacity as f64 * self.warn_ratio {
            Watermark::Warning
        } else {
            Watermark::Normal
        }
    }

    /// Watermark transition since the last poll, if any. `Warning` is
    /// reported exactly once until depth drops back below the threshold.
    pub fn poll_watermark(&mut self) -> Option<Watermark> {
        let current = self.watermark();
        if current == self.last_reported {
            return None;
        }
        self.last_reported = current;
        Some(current)
    }

    async fn persist_queue(&self) -> Result<(), StateError> {
        let raw = serde_json::to_string(&self.items).map_err(|e| StateError::Backend(e.to_string()))?;
        self.store.replace(&self.queue_key, &raw).await
    }

    async fn persist_dead(&self) -> Result<(), StateError> {
        let raw = serde_json::to_string(&self.dead).map_err(|e| StateError::Backend(e.to_string()))?;
        self.store.replace(&self.dead_key, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStateStore;
    use std::sync::Arc;

    fn seg(seq: u64, text: &str) -> IncrementalSegment {
        IncrementalSegment::finalized("s", seq, text)
    }

    async fn queue(capacity: usize) -> OfflineQueue {
        OfflineQueue::open(Arc::new(MemoryStateStore::new()), "doc", capacity, 0.8, 3)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_and_depth() {
        let mut q = queue(10).await;
        q.enqueue(seg(1, "a")).await.unwrap();
        q.enqueue(seg(2, "b")).await.unwrap();

        assert_eq!(q.depth(), 2);
        assert!(!q.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_past_capacity_fails_fast() {
        let mut q = queue(2).await;
        q.enqueue(seg(1, "a")).await.unwrap();
        q.enqueue(seg(2, "b")).await.unwrap();

        let err = q.enqueue(seg(3, "c")).await.unwrap_err();
        assert!(matches!(err, QueueError::Full { capacity: 2 }));
        // Never grows past the bound
        assert_eq!(q.depth(), 2);
    }

    #[tokio::test]
    async fn test_peek_batch_oldest_first() {
        let mut q = queue(10).await;
        for i in 1..=5 {
            q.enqueue(seg(i, "x")).await.unwrap();
        }

        let batch = q.peek_batch(3, 10_000);
        let seqs: Vec<u64> = batch.iter().map(|i| i.segment.sequence_id).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        // Peek does not remove
        assert_eq!(q.depth(), 5);
    }

    #[tokio::test]
    async fn test_peek_batch_respects_char_budget() {
        let mut q = queue(10).await;
        q.enqueue(seg(1, "aaaa")).await.unwrap();
        q.enqueue(seg(2, "bbbb")).await.unwrap();
        q.enqueue(seg(3, "cccc")).await.unwrap();

        let batch = q.peek_batch(10, 8);
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_peek_batch_returns_oversized_head() {
        let mut q = queue(10).await;
        q.enqueue(seg(1, "a very long segment indeed")).await.unwrap();

        // Char budget smaller than the head item still yields it
        let batch = q.peek_batch(10, 5);
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_peek_batch_stops_at_sequence_gap() {
        let mut q = queue(10).await;
        q.enqueue(seg(1, "a")).await.unwrap();
        q.enqueue(seg(2, "b")).await.unwrap();
        q.enqueue(seg(5, "c")).await.unwrap();

        // First batch ends at the discontinuity; the gapped item waits
        let batch = q.peek_batch(10, 10_000);
        let seqs: Vec<u64> = batch.iter().map(|i| i.segment.sequence_id).collect();
        assert_eq!(seqs, vec![1, 2]);

        q.ack("s", &[1, 2]).await.unwrap();
        let batch = q.peek_batch(10, 10_000);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].segment.sequence_id, 5);
    }

    #[tokio::test]
    async fn test_peek_batch_stops_at_session_change() {
        let mut q = queue(10).await;
        q.enqueue(IncrementalSegment::finalized("s1", 1, "a")).await.unwrap();
        q.enqueue(IncrementalSegment::finalized("s1", 2, "b")).await.unwrap();
        q.enqueue(IncrementalSegment::finalized("s2", 1, "c")).await.unwrap();

        let batch = q.peek_batch(10, 10_000);
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|i| i.segment.session_id == "s1"));
    }

    #[tokio::test]
    async fn test_ack_removes_by_id_and_is_idempotent() {
        let mut q = queue(10).await;
        for i in 1..=3 {
            q.enqueue(seg(i, "x")).await.unwrap();
        }

        assert_eq!(q.ack("s", &[1, 2]).await.unwrap(), 2);
        assert_eq!(q.depth(), 1);

        // Second ack of the same ids is a no-op
        assert_eq!(q.ack("s", &[1, 2]).await.unwrap(), 0);
        // Wrong session matches nothing
        assert_eq!(q.ack("other", &[3]).await.unwrap(), 0);
        assert_eq!(q.depth(), 1);
    }

    #[tokio::test]
    async fn test_requeue_failed_preserves_order() {
        let mut q = queue(10).await;
        q.enqueue(seg(3, "c")).await.unwrap();

        let batch = vec![
            QueueItem::new(seg(1, "a")),
            QueueItem::new(seg(2, "b")),
        ];
        let dead = q.requeue_failed(batch, "store unreachable").await.unwrap();
        assert!(dead.is_empty());

        let head = q.peek_batch(3, 10_000);
        let seqs: Vec<u64> = head.iter().map(|i| i.segment.sequence_id).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(head[0].retry_count, 1);
        assert_eq!(head[0].last_error.as_deref(), Some("store unreachable"));
    }

    #[tokio::test]
    async fn test_requeue_dead_letters_after_retry_limit() {
        let mut q = queue(10).await;

        let mut item = QueueItem::new(seg(1, "a"));
        item.retry_count = 3; // at the limit; next failure kills it

        let dead = q.requeue_failed(vec![item], "still failing").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 4);
        assert_eq!(q.depth(), 0);
        assert_eq!(q.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_watermark_levels() {
        let mut q = queue(10).await;
        assert_eq!(q.watermark(), Watermark::Normal);

        for i in 1..=8 {
            q.enqueue(seg(i, "x")).await.unwrap();
        }
        assert_eq!(q.watermark(), Watermark::Warning);

        for i in 9..=10 {
            q.enqueue(seg(i, "x")).await.unwrap();
        }
        assert_eq!(q.watermark(), Watermark::Full);
    }

    #[tokio::test]
    async fn test_poll_watermark_edge_triggered() {
        let mut q = queue(10).await;
        assert!(q.poll_watermark().is_none());

        for i in 1..=8 {
            q.enqueue(seg(i, "x")).await.unwrap();
        }
        assert_eq!(q.poll_watermark(), Some(Watermark::Warning));
        // Reported exactly once while above threshold
        assert!(q.poll_watermark().is_none());

        q.ack("s", &[1, 2, 3]).await.unwrap();
        assert_eq!(q.poll_watermark(), Some(Watermark::Normal));
        assert!(q.poll_watermark().is_none());
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let store: Arc<MemoryStateStore> = Arc::new(MemoryStateStore::new());

        {
            let mut q = OfflineQueue::open(store.clone(), "doc", 10, 0.8, 3)
                .await
                .unwrap();
            q.enqueue(seg(1, "persisted")).await.unwrap();
            q.enqueue(seg(2, "also persisted")).await.unwrap();
        }

        let q = OfflineQueue::open(store, "doc", 10, 0.8, 3).await.unwrap();
        assert_eq!(q.depth(), 2);
        let batch = q.peek_batch(10, 10_000);
        assert_eq!(batch[0].segment.text, "persisted");
    }

    #[tokio::test]
    async fn test_dead_letter_terminal_item() {
        let mut q = queue(10).await;
        q.dead_letter(QueueItem::new(seg(1, "x")), "document not found")
            .await
            .unwrap();

        assert_eq!(q.dead_letters().len(), 1);
        assert_eq!(q.dead_letters()[0].error, "document not found");
    }
}
