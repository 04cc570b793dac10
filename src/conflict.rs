// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Version-token conflict detection.
//!
//! Every applied mutation advances the resource's version by one. A client
//! mutation carries the version the client last saw (`expected_version`);
//! if the server has moved past it, the mutation lost a race with another
//! device and is rejected rather than silently overwriting newer state
//! (last-write-wins by wall clock is explicitly not wanted here: POS device
//! clocks drift).
//!
//! Rules, per event type:
//! - `create`: resource must not exist, otherwise `duplicate_create`
//! - `update`: resource must exist (`not_found`) and the token must match
//!   the current version exactly (`stale_version`)
//! - `delete`: missing resource is a no-op success (the outcome the client
//!   wanted already holds); a stale token is still `stale_version`

use std::sync::Arc;

use serde_json::{json, Value};

use crate::event::{EventType, SyncEvent};
use crate::payload::ResourcePayload;
use crate::resources::{ResourceRecord, ResourceStore};
use crate::storage::traits::StorageError;

/// Why a mutation was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// `create` for a resource id that already exists
    DuplicateCreate,
    /// Version token does not match the server's current version
    StaleVersion,
    /// `update` for a resource the server has never seen (or has deleted)
    NotFound,
}

impl ConflictKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DuplicateCreate => "duplicate_create",
            Self::StaleVersion => "stale_version",
            Self::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected mutation, with the server's current state attached so the
/// client can reconcile without a second round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictInfo {
    pub kind: ConflictKind,
    pub message: String,
    /// Server's current record, when one exists
    pub current: Option<ResourceRecord>,
}

impl ConflictInfo {
    fn new(kind: ConflictKind, message: impl Into<String>, current: Option<ResourceRecord>) -> Self {
        Self {
            kind,
            message: message.into(),
            current,
        }
    }

    /// Structured form stored in the event's `error_message` column.
    #[must_use]
    pub fn to_error_json(&self) -> String {
        let current = self
            .current
            .as_ref()
            .and_then(|r| serde_json::to_value(r).ok())
            .unwrap_or(Value::Null);
        json!({
            "kind": self.kind.as_str(),
            "message": self.message,
            "current": current,
        })
        .to_string()
    }

    /// Parse a stored `error_message` back into `(kind, message, current)`.
    /// Non-JSON messages (apply errors, timeouts) yield `None`.
    #[must_use]
    pub fn parse_error_json(raw: &str) -> Option<(String, String, Value)> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let kind = value.get("kind")?.as_str()?.to_string();
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let current = value.get("current").cloned().unwrap_or(Value::Null);
        Some((kind, message, current))
    }
}

/// Outcome of evaluating one event against the system of record.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// Mutation applied; carries the resulting record (`None` for deletes)
    Applied(Option<ResourceRecord>),
    /// Mutation rejected; nothing was written
    Conflict(ConflictInfo),
}

pub struct ConflictDetector {
    resources: Arc<dyn ResourceStore>,
}

impl ConflictDetector {
    pub fn new(resources: Arc<dyn ResourceStore>) -> Self {
        Self { resources }
    }

    pub fn resources(&self) -> &Arc<dyn ResourceStore> {
        &self.resources
    }

    /// Evaluate one claimed event, applying it if the version check passes.
    ///
    /// The caller holds the entity lock for this event's resource, so the
    /// read-check-write here is race-free.
    pub async fn evaluate(&self, event: &SyncEvent) -> Result<Evaluation, StorageError> {
        match event.event_type {
            EventType::Create => self.evaluate_create(event).await,
            EventType::Update => self.evaluate_update(event).await,
            EventType::Delete => self.evaluate_delete(event).await,
        }
    }

    async fn evaluate_create(&self, event: &SyncEvent) -> Result<Evaluation, StorageError> {
        let current = self
            .resources
            .get(&event.tenant_id, event.resource_kind, &event.resource_id)
            .await?;
        if let Some(existing) = current {
            return Ok(Evaluation::Conflict(ConflictInfo::new(
                ConflictKind::DuplicateCreate,
                format!(
                    "{} '{}' already exists at version {}",
                    event.resource_kind, event.resource_id, existing.version
                ),
                Some(existing),
            )));
        }

        let data = self.clean_data(event)?;
        let record = self
            .resources
            .apply_create(&event.tenant_id, event.resource_kind, &event.resource_id, data)
            .await?;
        Ok(Evaluation::Applied(Some(record)))
    }

    async fn evaluate_update(&self, event: &SyncEvent) -> Result<Evaluation, StorageError> {
        let current = self
            .resources
            .get(&event.tenant_id, event.resource_kind, &event.resource_id)
            .await?;
        let Some(existing) = current else {
            return Ok(Evaluation::Conflict(ConflictInfo::new(
                ConflictKind::NotFound,
                format!(
                    "{} '{}' does not exist on the server",
                    event.resource_kind, event.resource_id
                ),
                None,
            )));
        };

        let expected = expected_version(&event.payload);
        match expected {
            Some(v) if v == existing.version => {}
            Some(v) => {
                return Ok(Evaluation::Conflict(ConflictInfo::new(
                    ConflictKind::StaleVersion,
                    format!(
                        "expected version {} but server is at {}",
                        v, existing.version
                    ),
                    Some(existing),
                )));
            }
            None => {
                return Ok(Evaluation::Conflict(ConflictInfo::new(
                    ConflictKind::StaleVersion,
                    "update carried no expected_version".to_string(),
                    Some(existing),
                )));
            }
        }

        let data = self.clean_data(event)?;
        let record = self
            .resources
            .apply_update(&event.tenant_id, event.resource_kind, &event.resource_id, data)
            .await?;
        Ok(Evaluation::Applied(Some(record)))
    }

    async fn evaluate_delete(&self, event: &SyncEvent) -> Result<Evaluation, StorageError> {
        let current = self
            .resources
            .get(&event.tenant_id, event.resource_kind, &event.resource_id)
            .await?;
        let Some(existing) = current else {
            // Already gone; the delete's intent holds
            return Ok(Evaluation::Applied(None));
        };

        if let Some(v) = expected_version(&event.payload) {
            if v != existing.version {
                return Ok(Evaluation::Conflict(ConflictInfo::new(
                    ConflictKind::StaleVersion,
                    format!(
                        "expected version {} but server is at {}",
                        v, existing.version
                    ),
                    Some(existing),
                )));
            }
        }

        self.resources
            .apply_delete(&event.tenant_id, event.resource_kind, &event.resource_id)
            .await?;
        Ok(Evaluation::Applied(None))
    }

    /// Payload as stored in the system of record: schema-checked, version
    /// token stripped.
    fn clean_data(&self, event: &SyncEvent) -> Result<Value, StorageError> {
        let payload = ResourcePayload::decode(event.resource_kind, &event.payload)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(payload.to_value())
    }
}

/// The version token riding on a raw payload, if any.
#[must_use]
pub fn expected_version(payload: &Value) -> Option<i64> {
    payload.get("expected_version").and_then(Value::as_i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{now_millis, SyncStatus};
    use crate::payload::ResourceKind;
    use crate::resources::InMemoryResources;
    use serde_json::json;

    fn detector() -> ConflictDetector {
        ConflictDetector::new(Arc::new(InMemoryResources::new()))
    }

    fn event(event_type: EventType, resource_id: &str, payload: Value) -> SyncEvent {
        SyncEvent {
            id: 1,
            tenant_id: "t1".to_string(),
            user_id: "u1".to_string(),
            device_id: "d1".to_string(),
            idempotency_token: "tok".to_string(),
            event_type,
            resource_kind: ResourceKind::Product,
            resource_id: resource_id.to_string(),
            payload,
            status: SyncStatus::InProgress,
            retry_count: 0,
            error_message: None,
            synced_at: None,
            created_at: now_millis(),
        }
    }

    fn product_payload(version: Option<i64>) -> Value {
        let mut payload = json!({"sku": "S", "name": "Espresso", "price_cents": 350});
        if let Some(v) = version {
            payload["expected_version"] = json!(v);
        }
        payload
    }

    #[tokio::test]
    async fn test_create_applies_at_version_one() {
        let det = detector();
        let result = det
            .evaluate(&event(EventType::Create, "p1", product_payload(None)))
            .await
            .unwrap();
        match result {
            Evaluation::Applied(Some(record)) => {
                assert_eq!(record.version, 1);
                // Token never leaks into stored state
                assert!(record.data.get("expected_version").is_none());
            }
            other => panic!("expected applied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_on_existing_is_duplicate() {
        let det = detector();
        det.evaluate(&event(EventType::Create, "p1", product_payload(None)))
            .await
            .unwrap();

        let result = det
            .evaluate(&event(EventType::Create, "p1", product_payload(None)))
            .await
            .unwrap();
        match result {
            Evaluation::Conflict(info) => {
                assert_eq!(info.kind, ConflictKind::DuplicateCreate);
                assert_eq!(info.current.unwrap().version, 1);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_with_matching_token_applies() {
        let det = detector();
        det.evaluate(&event(EventType::Create, "p1", product_payload(None)))
            .await
            .unwrap();

        let result = det
            .evaluate(&event(EventType::Update, "p1", product_payload(Some(1))))
            .await
            .unwrap();
        match result {
            Evaluation::Applied(Some(record)) => assert_eq!(record.version, 2),
            other => panic!("expected applied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_with_stale_token_conflicts() {
        let det = detector();
        det.evaluate(&event(EventType::Create, "p1", product_payload(None)))
            .await
            .unwrap();
        det.evaluate(&event(EventType::Update, "p1", product_payload(Some(1))))
            .await
            .unwrap();

        // Token 1 again, but the server moved to 2
        let result = det
            .evaluate(&event(EventType::Update, "p1", product_payload(Some(1))))
            .await
            .unwrap();
        match result {
            Evaluation::Conflict(info) => {
                assert_eq!(info.kind, ConflictKind::StaleVersion);
                assert_eq!(info.current.unwrap().version, 2);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_without_token_conflicts() {
        let det = detector();
        det.evaluate(&event(EventType::Create, "p1", product_payload(None)))
            .await
            .unwrap();

        let result = det
            .evaluate(&event(EventType::Update, "p1", product_payload(None)))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Evaluation::Conflict(ConflictInfo { kind: ConflictKind::StaleVersion, .. })
        ));
    }

    #[tokio::test]
    async fn test_update_missing_resource_is_not_found() {
        let det = detector();
        let result = det
            .evaluate(&event(EventType::Update, "ghost", product_payload(Some(1))))
            .await
            .unwrap();
        match result {
            Evaluation::Conflict(info) => {
                assert_eq!(info.kind, ConflictKind::NotFound);
                assert!(info.current.is_none());
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_missing_is_noop_success() {
        let det = detector();
        let result = det
            .evaluate(&event(EventType::Delete, "ghost", json!({})))
            .await
            .unwrap();
        assert_eq!(result, Evaluation::Applied(None));
    }

    #[tokio::test]
    async fn test_delete_with_stale_token_conflicts() {
        let det = detector();
        det.evaluate(&event(EventType::Create, "p1", product_payload(None)))
            .await
            .unwrap();
        det.evaluate(&event(EventType::Update, "p1", product_payload(Some(1))))
            .await
            .unwrap();

        let result = det
            .evaluate(&event(EventType::Delete, "p1", json!({"expected_version": 1})))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Evaluation::Conflict(ConflictInfo { kind: ConflictKind::StaleVersion, .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_without_token_applies() {
        let det = detector();
        det.evaluate(&event(EventType::Create, "p1", product_payload(None)))
            .await
            .unwrap();

        let result = det
            .evaluate(&event(EventType::Delete, "p1", json!({})))
            .await
            .unwrap();
        assert_eq!(result, Evaluation::Applied(None));
        assert!(det
            .resources()
            .get("t1", ResourceKind::Product, "p1")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_error_json_round_trip() {
        let info = ConflictInfo::new(
            ConflictKind::StaleVersion,
            "expected version 1 but server is at 3",
            Some(ResourceRecord {
                kind: ResourceKind::Product,
                resource_id: "p1".to_string(),
                version: 3,
                data: json!({"sku": "S"}),
                updated_at: 42,
            }),
        );
        let raw = info.to_error_json();
        let (kind, message, current) = ConflictInfo::parse_error_json(&raw).unwrap();
        assert_eq!(kind, "stale_version");
        assert!(message.contains("server is at 3"));
        assert_eq!(current["version"], 3);
    }

    #[test]
    fn test_parse_error_json_rejects_plain_text() {
        assert!(ConflictInfo::parse_error_json("apply timed out").is_none());
    }
}
