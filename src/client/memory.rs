//! In-memory device store for tests and ephemeral clients.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::event::now_millis;
use crate::payload::ResourceKind;
use crate::storage::traits::StorageError;
use super::traits::{
    Checkpoint, LocalQueueItem, NewQueueItem, OutboxStore, SnapshotRow, SnapshotStore,
};

pub struct MemoryLocalStore {
    inner: Mutex<Inner>,
}

struct Inner {
    next_local_id: i64,
    queue: BTreeMap<i64, LocalQueueItem>,
    snapshots: HashMap<(ResourceKind, String), SnapshotRow>,
    checkpoint: Checkpoint,
}

impl MemoryLocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_local_id: 1,
                queue: BTreeMap::new(),
                snapshots: HashMap::new(),
                checkpoint: Checkpoint::default(),
            }),
        }
    }
}

impl Default for MemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for MemoryLocalStore {
    async fn enqueue(&self, item: NewQueueItem) -> Result<LocalQueueItem, StorageError> {
        let mut inner = self.inner.lock();
        let local_id = inner.next_local_id;
        inner.next_local_id += 1;

        let queued = LocalQueueItem {
            local_id,
            idempotency_token: Uuid::new_v4().to_string(),
            event_type: item.event_type,
            resource_kind: item.resource_kind,
            resource_id: item.resource_id,
            payload: item.payload,
            created_at_local: now_millis(),
            retry_count: 0,
            dead: false,
        };
        inner.queue.insert(local_id, queued.clone());
        Ok(queued)
    }

    async fn peek_batch(&self, limit: usize) -> Result<Vec<LocalQueueItem>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .queue
            .values()
            .filter(|i| !i.dead)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ack(&self, local_id: i64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.queue.remove(&local_id).ok_or(StorageError::NotFound)?;
        Ok(())
    }

    async fn bump_retry(&self, local_id: i64) -> Result<u32, StorageError> {
        let mut inner = self.inner.lock();
        let item = inner.queue.get_mut(&local_id).ok_or(StorageError::NotFound)?;
        item.retry_count += 1;
        Ok(item.retry_count)
    }

    async fn mark_dead(&self, local_id: i64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let item = inner.queue.get_mut(&local_id).ok_or(StorageError::NotFound)?;
        item.dead = true;
        Ok(())
    }

    async fn dead_items(&self, limit: usize) -> Result<Vec<LocalQueueItem>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .queue
            .values()
            .rev()
            .filter(|i| i.dead)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn requeue(&self, local_id: i64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let item = inner.queue.get_mut(&local_id).ok_or(StorageError::NotFound)?;
        item.dead = false;
        item.retry_count = 0;
        Ok(())
    }

    async fn queue_depth(&self) -> Result<usize, StorageError> {
        let inner = self.inner.lock();
        Ok(inner.queue.values().filter(|i| !i.dead).count())
    }
}

#[async_trait]
impl SnapshotStore for MemoryLocalStore {
    async fn get(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<Option<SnapshotRow>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner.snapshots.get(&(kind, resource_id.to_string())).cloned())
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<SnapshotRow>, StorageError> {
        let inner = self.inner.lock();
        let mut rows: Vec<SnapshotRow> = inner
            .snapshots
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        Ok(rows)
    }

    async fn upsert(&self, kind: ResourceKind, row: SnapshotRow) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.snapshots.insert((kind, row.resource_id.clone()), row);
        Ok(())
    }

    async fn remove(&self, kind: ResourceKind, resource_id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.snapshots.remove(&(kind, resource_id.to_string()));
        Ok(())
    }

    async fn replace_all(
        &self,
        snapshot: Vec<(ResourceKind, Vec<SnapshotRow>)>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        // Single lock hold makes the swap atomic to all readers
        for (kind, _) in &snapshot {
            inner.snapshots.retain(|(k, _), _| k != kind);
        }
        for (kind, rows) in snapshot {
            for row in rows {
                inner.snapshots.insert((kind, row.resource_id.clone()), row);
            }
        }
        Ok(())
    }

    async fn checkpoint(&self) -> Result<Checkpoint, StorageError> {
        Ok(self.inner.lock().checkpoint)
    }

    async fn set_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StorageError> {
        self.inner.lock().checkpoint = checkpoint;
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.snapshots.clear();
        inner.checkpoint = Checkpoint::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;

    fn item(resource_id: &str) -> NewQueueItem {
        NewQueueItem {
            event_type: EventType::Create,
            resource_kind: ResourceKind::Product,
            resource_id: resource_id.to_string(),
            payload: json!({"sku": resource_id}),
        }
    }

    #[tokio::test]
    async fn test_enqueue_assigns_token_and_order() {
        let store = MemoryLocalStore::new();
        let a = store.enqueue(item("p1")).await.unwrap();
        let b = store.enqueue(item("p2")).await.unwrap();

        assert!(b.local_id > a.local_id);
        assert_ne!(a.idempotency_token, b.idempotency_token);
        assert!(!a.idempotency_token.is_empty());

        let batch = store.peek_batch(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].resource_id, "p1");
    }

    #[tokio::test]
    async fn test_token_survives_retries() {
        let store = MemoryLocalStore::new();
        let queued = store.enqueue(item("p1")).await.unwrap();

        store.bump_retry(queued.local_id).await.unwrap();
        let after = store.peek_batch(1).await.unwrap();
        assert_eq!(after[0].idempotency_token, queued.idempotency_token);
        assert_eq!(after[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_dead_items_excluded_from_batches() {
        let store = MemoryLocalStore::new();
        let a = store.enqueue(item("p1")).await.unwrap();
        store.enqueue(item("p2")).await.unwrap();

        store.mark_dead(a.local_id).await.unwrap();

        let batch = store.peek_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].resource_id, "p2");
        assert_eq!(store.queue_depth().await.unwrap(), 1);

        let dead = store.dead_items(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].resource_id, "p1");
    }

    #[tokio::test]
    async fn test_requeue_resets_retry_budget() {
        let store = MemoryLocalStore::new();
        let a = store.enqueue(item("p1")).await.unwrap();
        store.bump_retry(a.local_id).await.unwrap();
        store.bump_retry(a.local_id).await.unwrap();
        store.mark_dead(a.local_id).await.unwrap();

        store.requeue(a.local_id).await.unwrap();
        let batch = store.peek_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].retry_count, 0);
        assert!(!batch[0].dead);
    }

    #[tokio::test]
    async fn test_snapshot_upsert_and_replace_all() {
        let store = MemoryLocalStore::new();
        store
            .upsert(
                ResourceKind::Product,
                SnapshotRow {
                    resource_id: "p1".to_string(),
                    version: 1,
                    data: json!({"sku": "A"}),
                    updated_at: 1,
                },
            )
            .await
            .unwrap();

        let row = store.get(ResourceKind::Product, "p1").await.unwrap().unwrap();
        assert_eq!(row.version, 1);

        store
            .replace_all(vec![(
                ResourceKind::Product,
                vec![SnapshotRow {
                    resource_id: "p2".to_string(),
                    version: 5,
                    data: json!({"sku": "B"}),
                    updated_at: 2,
                }],
            )])
            .await
            .unwrap();

        // Old rows of the replaced kind are gone
        assert!(store.get(ResourceKind::Product, "p1").await.unwrap().is_none());
        assert!(store.get(ResourceKind::Product, "p2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_all_wipes_everything() {
        let store = MemoryLocalStore::new();
        store.enqueue(item("p1")).await.unwrap();
        store
            .set_checkpoint(Checkpoint {
                last_seen_event_id: 9,
                last_sync: Some(1),
            })
            .await
            .unwrap();

        store.clear_all().await.unwrap();

        assert_eq!(store.queue_depth().await.unwrap(), 0);
        assert_eq!(store.checkpoint().await.unwrap(), Checkpoint::default());
    }
}
