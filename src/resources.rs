//! The server's system of record for synchronized resources.
//!
//! Each resource carries a monotonically increasing version token that the
//! conflict detector compares against the client's `expected_version`. The
//! token advances by exactly one on every applied mutation, so a stale
//! client can never silently overwrite a newer write.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{entity_key, now_millis};
use crate::payload::ResourceKind;
use crate::storage::traits::StorageError;

/// Current server-side state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub resource_id: String,
    /// Version token; starts at 1 on create, +1 per applied mutation
    pub version: i64,
    pub data: Value,
    /// Epoch millis of the last applied mutation
    pub updated_at: i64,
}

/// Tenant-scoped store of current resource state.
///
/// Mutation methods assume the conflict detector has already validated the
/// version token; they only maintain the version counter.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(
        &self,
        tenant_id: &str,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<Option<ResourceRecord>, StorageError>;

    /// Insert a new resource at version 1.
    async fn apply_create(
        &self,
        tenant_id: &str,
        kind: ResourceKind,
        resource_id: &str,
        data: Value,
    ) -> Result<ResourceRecord, StorageError>;

    /// Overwrite the resource, advancing its version.
    async fn apply_update(
        &self,
        tenant_id: &str,
        kind: ResourceKind,
        resource_id: &str,
        data: Value,
    ) -> Result<ResourceRecord, StorageError>;

    /// Remove the resource. Returns the record as it was, if present.
    async fn apply_delete(
        &self,
        tenant_id: &str,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<Option<ResourceRecord>, StorageError>;
}

/// In-memory resource store keyed by `tenant/kind/id`.
pub struct InMemoryResources {
    records: DashMap<String, ResourceRecord>,
}

impl InMemoryResources {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for InMemoryResources {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for InMemoryResources {
    async fn get(
        &self,
        tenant_id: &str,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<Option<ResourceRecord>, StorageError> {
        let key = entity_key(tenant_id, kind, resource_id);
        Ok(self.records.get(&key).map(|r| r.clone()))
    }

    async fn apply_create(
        &self,
        tenant_id: &str,
        kind: ResourceKind,
        resource_id: &str,
        data: Value,
    ) -> Result<ResourceRecord, StorageError> {
        let key = entity_key(tenant_id, kind, resource_id);
        let record = ResourceRecord {
            kind,
            resource_id: resource_id.to_string(),
            version: 1,
            data,
            updated_at: now_millis(),
        };
        self.records.insert(key, record.clone());
        Ok(record)
    }

    async fn apply_update(
        &self,
        tenant_id: &str,
        kind: ResourceKind,
        resource_id: &str,
        data: Value,
    ) -> Result<ResourceRecord, StorageError> {
        let key = entity_key(tenant_id, kind, resource_id);
        let mut entry = self.records.get_mut(&key).ok_or(StorageError::NotFound)?;
        entry.version += 1;
        entry.data = data;
        entry.updated_at = now_millis();
        Ok(entry.clone())
    }

    async fn apply_delete(
        &self,
        tenant_id: &str,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<Option<ResourceRecord>, StorageError> {
        let key = entity_key(tenant_id, kind, resource_id);
        Ok(self.records.remove(&key).map(|(_, r)| r))
    }
}
