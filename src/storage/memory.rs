use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::event::{now_millis, SyncEvent, SyncStatus};
use super::traits::{EventLogStore, InsertOutcome, NewEvent, StorageError};

/// In-memory event log for tests and single-process deployments.
///
/// Ids are assigned from a process-local counter; the `BTreeMap` keeps
/// events in id (acceptance) order, which the catch-up queries rely on.
pub struct InMemoryEventLog {
    inner: Mutex<Inner>,
}

struct Inner {
    next_id: i64,
    events: BTreeMap<i64, SyncEvent>,
    /// `(tenant_id, idempotency_token) → event id`
    tokens: HashMap<(String, String), i64>,
}

impl InMemoryEventLog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                events: BTreeMap::new(),
                tokens: HashMap::new(),
            }),
        }
    }

    /// Total events across all tenants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventLogStore for InMemoryEventLog {
    async fn insert(&self, event: NewEvent) -> Result<InsertOutcome, StorageError> {
        let mut inner = self.inner.lock();

        let token_key = (event.scope.tenant_id.clone(), event.idempotency_token.clone());
        if let Some(existing_id) = inner.tokens.get(&token_key) {
            let existing = inner
                .events
                .get(existing_id)
                .cloned()
                .ok_or(StorageError::NotFound)?;
            return Ok(InsertOutcome::Duplicate(existing));
        }

        let id = inner.next_id;
        inner.next_id += 1;

        let stored = SyncEvent {
            id,
            tenant_id: event.scope.tenant_id,
            user_id: event.scope.user_id,
            device_id: event.scope.device_id,
            idempotency_token: event.idempotency_token,
            event_type: event.event_type,
            resource_kind: event.resource_kind,
            resource_id: event.resource_id,
            payload: event.payload,
            status: SyncStatus::Pending,
            retry_count: 0,
            error_message: None,
            synced_at: None,
            created_at: now_millis(),
        };
        inner.tokens.insert(token_key, id);
        inner.events.insert(id, stored.clone());
        Ok(InsertOutcome::Inserted(stored))
    }

    async fn get(&self, event_id: i64) -> Result<Option<SyncEvent>, StorageError> {
        Ok(self.inner.lock().events.get(&event_id).cloned())
    }

    async fn claim(&self, event_id: i64) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        match inner.events.get_mut(&event_id) {
            Some(event) if event.status == SyncStatus::Pending => {
                event.status = SyncStatus::InProgress;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound),
        }
    }

    async fn complete(
        &self,
        event_id: i64,
        synced_at: i64,
        canonical_payload: &Value,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let event = inner.events.get_mut(&event_id).ok_or(StorageError::NotFound)?;
        if event.status != SyncStatus::InProgress {
            return Err(StorageError::InvalidTransition {
                from: event.status,
                to: SyncStatus::Completed,
            });
        }
        event.status = SyncStatus::Completed;
        event.synced_at = Some(synced_at);
        event.error_message = None;
        event.payload = canonical_payload.clone();
        Ok(())
    }

    async fn fail(&self, event_id: i64, error_message: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let event = inner.events.get_mut(&event_id).ok_or(StorageError::NotFound)?;
        if event.status != SyncStatus::InProgress {
            return Err(StorageError::InvalidTransition {
                from: event.status,
                to: SyncStatus::Failed,
            });
        }
        event.status = SyncStatus::Failed;
        event.error_message = Some(error_message.to_string());
        event.retry_count += 1;
        Ok(())
    }

    async fn pending(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncEvent>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .values()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.status == SyncStatus::Pending
                    && user_id.is_none_or(|u| e.user_id == u)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn failed(&self, tenant_id: &str, limit: usize) -> Result<Vec<SyncEvent>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .values()
            .rev()
            .filter(|e| e.tenant_id == tenant_id && e.status == SyncStatus::Failed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn retry_failed(&self, tenant_id: &str, limit: usize) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock();
        let ids: Vec<i64> = inner
            .events
            .values()
            .filter(|e| {
                e.tenant_id == tenant_id && e.status == SyncStatus::Failed && e.retry_count > 0
            })
            .take(limit)
            .map(|e| e.id)
            .collect();
        for id in &ids {
            if let Some(event) = inner.events.get_mut(id) {
                event.status = SyncStatus::Pending;
                event.retry_count = 0;
            }
        }
        Ok(ids.len() as u64)
    }

    async fn reset_failed(&self, event_id: i64) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        match inner.events.get_mut(&event_id) {
            Some(event) if event.status == SyncStatus::Failed => {
                event.status = SyncStatus::Pending;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound),
        }
    }

    async fn completed_since(
        &self,
        tenant_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<SyncEvent>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .range(after_id + 1..)
            .map(|(_, e)| e)
            .filter(|e| e.tenant_id == tenant_id && e.status == SyncStatus::Completed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_by_status(
        &self,
        tenant_id: &str,
        status: SyncStatus,
    ) -> Result<u64, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .values()
            .filter(|e| e.tenant_id == tenant_id && e.status == status)
            .count() as u64)
    }
}
