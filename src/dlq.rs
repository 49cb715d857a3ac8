//! DLQ Manager (C8, §4.8).
//!
//! Three operations callable by the external control surface: `list`,
//! `reprocess`, `purge`. All operate on the `DLQ:<queue>` list convention
//! from §6.1.

use crate::cache::VConCache;
use crate::queue::QueueClient;

const LIST_BOUND: isize = 1000;

pub struct DlqManager {
    queue: QueueClient,
    cache: VConCacheHandle,
}

/// The cache is only needed to restore normal TTL on reprocess; kept as a
/// thin handle rather than a full dependency so `DlqManager` stays usable
/// without a cache in tests that only exercise queue mechanics.
pub enum VConCacheHandle {
    Attached(std::sync::Arc<VConCache>),
    None,
}

impl DlqManager {
    pub fn new(queue: QueueClient, cache: std::sync::Arc<VConCache>) -> Self {
        Self {
            queue,
            cache: VConCacheHandle::Attached(cache),
        }
    }

    pub fn without_cache(queue: QueueClient) -> Self {
        Self {
            queue,
            cache: VConCacheHandle::None,
        }
    }

    fn dlq_name(queue: &str) -> String {
        format!("DLQ:{queue}")
    }

    /// `list(queue) -> uuids[]`: a bounded read of current DLQ contents.
    pub async fn list(&self, queue: &str) -> anyhow::Result<Vec<String>> {
        self.queue
            .list_range(&Self::dlq_name(queue), 0, LIST_BOUND - 1)
            .await
    }

    /// `reprocess(queue) -> count`: atomically move each UUID from
    /// `DLQ:<queue>` back to the tail of `<queue>`, restoring normal TTL.
    pub async fn reprocess(&self, queue: &str) -> anyhow::Result<usize> {
        let dlq = Self::dlq_name(queue);
        let pending = self.queue.list_len(&dlq).await?;
        let moved = self.queue.move_tail_to_tail(&dlq, queue, pending).await?;

        if let VConCacheHandle::Attached(cache) = &self.cache {
            // Restoring TTL is best-effort per-item; a failure here doesn't
            // block the item from being reprocessed, it just leaves the
            // DLQ-length TTL in place until the item is next written.
            let items = self.queue.list_range(queue, 0, LIST_BOUND - 1).await?;
            for uuid in items {
                let _ = cache.restore_normal_ttl(&uuid).await;
            }
        }
        Ok(moved)
    }

    /// `purge(queue, uuid)`: remove a specific item from the DLQ.
    pub async fn purge(&self, queue: &str, uuid: &str) -> anyhow::Result<usize> {
        self.queue.list_remove(&Self::dlq_name(queue), uuid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_queue() -> Option<QueueClient> {
        let url = std::env::var("VCON_PIPE_TEST_REDIS_URL").ok()?;
        QueueClient::connect(&url).await.ok()
    }

    #[tokio::test]
    async fn reprocess_moves_items_from_dlq_to_tail_of_queue() {
        let Some(queue) = test_queue().await else {
            return;
        };
        let uuid = format!("dlq-test-{}", uuid::Uuid::new_v4());
        queue.push_right("DLQ:q_dlq_test", &uuid).await.unwrap();

        let manager = DlqManager::without_cache(queue.clone());
        let moved = manager.reprocess("q_dlq_test").await.unwrap();
        assert_eq!(moved, 1);

        let dlq_contents = manager.list("q_dlq_test").await.unwrap();
        assert!(!dlq_contents.contains(&uuid));

        let queue_contents = queue.list_range("q_dlq_test", 0, -1).await.unwrap();
        assert!(queue_contents.contains(&uuid));
    }

    #[tokio::test]
    async fn purge_removes_a_specific_item() {
        let Some(queue) = test_queue().await else {
            return;
        };
        let uuid = format!("purge-test-{}", uuid::Uuid::new_v4());
        queue.push_right("DLQ:q_purge_test", &uuid).await.unwrap();
        let manager = DlqManager::without_cache(queue.clone());
        let removed = manager.purge("q_purge_test", &uuid).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!manager.list("q_purge_test").await.unwrap().contains(&uuid));
    }
}
