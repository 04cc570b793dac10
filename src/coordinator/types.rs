//! Wire types for the sync protocol surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{EventType, SyncEvent};
use crate::payload::{ResourceKind, ResourcePayload};

/// Pending events returned by a status query are capped; the full backlog
/// stays queryable through the store.
pub const PENDING_LIST_CAP: usize = 50;
/// Conflicts returned by a status or conflicts query.
pub const CONFLICT_LIST_CAP: usize = 20;
/// Failed events reset per retry-failed call.
pub const RETRY_FAILED_CAP: usize = 10;

/// One client mutation as submitted over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEvent {
    pub idempotency_token: String,
    pub event_type: String,
    pub resource_type: String,
    pub resource_id: String,
    #[serde(default)]
    pub payload: Value,
}

/// A [`ClientEvent`] that passed boundary validation.
#[derive(Debug, Clone)]
pub struct ValidEvent {
    pub idempotency_token: String,
    pub event_type: EventType,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub payload: Value,
}

impl ClientEvent {
    /// Validate the wire shape into the closed internal types.
    ///
    /// Rejected events are never inserted into the log; the error string
    /// goes back in the push response so the client can drop the item.
    pub fn validate(self) -> Result<ValidEvent, String> {
        if self.idempotency_token.trim().is_empty() {
            return Err("idempotency_token must not be empty".to_string());
        }
        if self.resource_id.trim().is_empty() {
            return Err(format!(
                "event '{}': resource_id must not be empty",
                self.idempotency_token
            ));
        }

        let event_type = EventType::parse(&self.event_type).ok_or_else(|| {
            format!(
                "event '{}': unknown event_type '{}'",
                self.idempotency_token, self.event_type
            )
        })?;
        let resource_kind = ResourceKind::parse(&self.resource_type).ok_or_else(|| {
            format!(
                "event '{}': unknown resource_type '{}'",
                self.idempotency_token, self.resource_type
            )
        })?;

        // Deletes carry at most a version token, no full schema
        if event_type != EventType::Delete {
            let decoded = ResourcePayload::decode(resource_kind, &self.payload)
                .map_err(|e| format!("event '{}': {}", self.idempotency_token, e))?;
            if event_type == EventType::Update && decoded.expected_version().is_none() {
                return Err(format!(
                    "event '{}': update requires expected_version",
                    self.idempotency_token
                ));
            }
        }

        Ok(ValidEvent {
            idempotency_token: self.idempotency_token,
            event_type,
            resource_kind,
            resource_id: self.resource_id,
            payload: self.payload,
        })
    }
}

/// A rejected mutation as reported back to the submitting device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictReport {
    pub event_id: i64,
    pub idempotency_token: String,
    pub resource_type: String,
    pub resource_id: String,
    /// Business conflicts are `duplicate_create`, `stale_version` or
    /// `not_found`; transient apply failures (backend errors, timeouts)
    /// carry kind `error` and are worth resubmitting
    pub kind: String,
    pub message: String,
    /// Server's current record, `null` when the resource does not exist
    pub current: Value,
}

/// Response to a push: per-event outcomes plus the catch-up slice the
/// device asked for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    /// Events applied during this push
    pub synced_count: usize,
    pub conflicts: Vec<ConflictReport>,
    /// Completed events newer than the device's cursor
    pub server_events: Vec<SyncEvent>,
    /// Validation rejections; these events were never accepted
    pub errors: Vec<String>,
    /// Tokens whose outcome is still unresolved (claimed by another
    /// in-flight push); resubmit unchanged next cycle
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryFailedResponse {
    pub retried_count: u64,
}

/// Tenant-level queue overview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSummary {
    pub pending_count: u64,
    pub conflict_count: u64,
    /// Oldest pending events, capped at [`PENDING_LIST_CAP`]
    pub pending_events: Vec<SyncEvent>,
    /// Most recent conflicts, capped at [`CONFLICT_LIST_CAP`]
    pub conflicts: Vec<ConflictReport>,
}
