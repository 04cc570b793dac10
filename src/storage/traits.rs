// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::event::{EventScope, EventType, SyncEvent, SyncStatus};
use crate::payload::ResourceKind;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: SyncStatus, to: SyncStatus },
}

/// A not-yet-persisted event, as accepted at the protocol boundary.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub scope: EventScope,
    pub idempotency_token: String,
    pub event_type: EventType,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub payload: Value,
}

/// Result of an idempotent insert.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// First time this idempotency token was seen; a fresh `Pending` event
    Inserted(SyncEvent),
    /// Token already resolved to an event; the stored record is returned
    /// unchanged and no new event is created
    Duplicate(SyncEvent),
}

impl InsertOutcome {
    #[must_use]
    pub fn event(&self) -> &SyncEvent {
        match self {
            Self::Inserted(e) | Self::Duplicate(e) => e,
        }
    }
}

/// Durable, tenant-scoped, ordered record of every accepted mutation.
///
/// Implementations must assign monotonically increasing event ids within a
/// backend instance: the id ordering is what the catch-up feed exposes to
/// devices, so it must reflect server acceptance order.
#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Insert a new event, de-duplicating on `(tenant_id, idempotency_token)`.
    async fn insert(&self, event: NewEvent) -> Result<InsertOutcome, StorageError>;

    /// Fetch a single event by id.
    async fn get(&self, event_id: i64) -> Result<Option<SyncEvent>, StorageError>;

    /// Atomically claim a `Pending` event for processing
    /// (`Pending → InProgress`). Returns `false` if the event was not in
    /// `Pending`; the caller must then treat evaluation as a no-op.
    async fn claim(&self, event_id: i64) -> Result<bool, StorageError>;

    /// `InProgress → Completed`: record `synced_at` and replace the stored
    /// payload with the canonical applied state so catch-up consumers merge
    /// server truth rather than the client's proposal.
    async fn complete(
        &self,
        event_id: i64,
        synced_at: i64,
        canonical_payload: &Value,
    ) -> Result<(), StorageError>;

    /// `InProgress → Failed`: record the structured error message and
    /// increment the server-side retry counter.
    async fn fail(&self, event_id: i64, error_message: &str) -> Result<(), StorageError>;

    /// Tenant's `Pending` events, oldest first, optionally filtered by user.
    async fn pending(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncEvent>, StorageError>;

    /// Tenant's `Failed` events, newest first.
    async fn failed(&self, tenant_id: &str, limit: usize) -> Result<Vec<SyncEvent>, StorageError>;

    /// Reset up to `limit` of the tenant's `Failed` events (with nonzero
    /// retry count) back to `Pending`, zeroing their retry counters.
    /// Returns the number of events reset.
    async fn retry_failed(&self, tenant_id: &str, limit: usize) -> Result<u64, StorageError>;

    /// `Failed → Pending` for one event, keeping its retry count as the
    /// record of attempts so far. Returns `false` if the event was not in
    /// `Failed`. Used when a resubmission re-attempts a transiently failed
    /// apply.
    async fn reset_failed(&self, event_id: i64) -> Result<bool, StorageError>;

    /// Catch-up feed: the tenant's `Completed` events with `id > after_id`,
    /// ascending id order, capped at `limit`.
    async fn completed_since(
        &self,
        tenant_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<SyncEvent>, StorageError>;

    /// Count the tenant's events in a given status.
    async fn count_by_status(
        &self,
        tenant_id: &str,
        status: SyncStatus,
    ) -> Result<u64, StorageError>;
}
