//! Durable local state for an offline-capable device.
//!
//! Two concerns, usually backed by the same database file:
//! - the **outbox**: mutations made while offline, queued in creation order
//!   until a sync cycle pushes them to the server
//! - the **snapshot**: the device's local copy of server state, merged from
//!   the catch-up feed, plus the sync checkpoint

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::EventType;
use crate::payload::ResourceKind;
use crate::storage::traits::StorageError;

/// A queued local mutation awaiting push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalQueueItem {
    /// Device-local ordering key; never leaves the device
    pub local_id: i64,
    /// Generated once at enqueue and reused across retries, so the server
    /// de-duplicates resubmissions
    pub idempotency_token: String,
    pub event_type: EventType,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub payload: Value,
    pub created_at_local: i64,
    /// Failed push attempts so far
    pub retry_count: u32,
    /// Dead-lettered: exceeded the retry ceiling, excluded from cycles
    pub dead: bool,
}

/// A mutation as handed to the outbox by application code.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub event_type: EventType,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub payload: Value,
}

/// One resource in the device's local snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub resource_id: String,
    /// Server version token, echoed back as `expected_version` on updates
    pub version: i64,
    pub data: Value,
    pub updated_at: i64,
}

/// Where this device stands relative to the server's event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Highest server event id merged into the snapshot
    pub last_seen_event_id: i64,
    /// Epoch millis of the last successful cycle, if any
    pub last_sync: Option<i64>,
}

/// Durable outbox of local mutations.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a new mutation, assigning its local id and idempotency token.
    async fn enqueue(&self, item: NewQueueItem) -> Result<LocalQueueItem, StorageError>;

    /// Oldest live (non-dead) items, up to `limit`, in creation order.
    async fn peek_batch(&self, limit: usize) -> Result<Vec<LocalQueueItem>, StorageError>;

    /// Remove an item whose outcome is settled (synced or conflicted).
    async fn ack(&self, local_id: i64) -> Result<(), StorageError>;

    /// Increment an item's retry counter; returns the new count.
    async fn bump_retry(&self, local_id: i64) -> Result<u32, StorageError>;

    /// Move an item to the dead letter set.
    async fn mark_dead(&self, local_id: i64) -> Result<(), StorageError>;

    /// Dead-lettered items, newest first.
    async fn dead_items(&self, limit: usize) -> Result<Vec<LocalQueueItem>, StorageError>;

    /// Return a dead item to the live queue with a fresh retry budget.
    async fn requeue(&self, local_id: i64) -> Result<(), StorageError>;

    /// Live (non-dead) queue depth.
    async fn queue_depth(&self) -> Result<usize, StorageError>;
}

/// Device-local snapshot of server state plus the sync checkpoint.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<Option<SnapshotRow>, StorageError>;

    /// All rows of one kind, in resource id order.
    async fn list(&self, kind: ResourceKind) -> Result<Vec<SnapshotRow>, StorageError>;

    async fn upsert(&self, kind: ResourceKind, row: SnapshotRow) -> Result<(), StorageError>;

    async fn remove(&self, kind: ResourceKind, resource_id: &str) -> Result<(), StorageError>;

    /// Replace the entire snapshot atomically: either every kind is swapped
    /// to the new rows or the old snapshot stays intact.
    async fn replace_all(
        &self,
        snapshot: Vec<(ResourceKind, Vec<SnapshotRow>)>,
    ) -> Result<(), StorageError>;

    async fn checkpoint(&self) -> Result<Checkpoint, StorageError>;

    async fn set_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StorageError>;

    /// Wipe snapshot, checkpoint and outbox (device reset / logout).
    async fn clear_all(&self) -> Result<(), StorageError>;
}

/// Combined device storage: one database backing both concerns.
pub trait LocalStore: OutboxStore + SnapshotStore {}

impl<T: OutboxStore + SnapshotStore> LocalStore for T {}
