// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync event model and status state machine.
//!
//! A [`SyncEvent`] is the server-side durable record of one client mutation.
//! Events are tenant-scoped, ordered by their server-assigned `id`, and move
//! through a small state machine:
//!
//! ```text
//! Pending ──▶ InProgress ──▶ Completed
//!    ▲             │
//!    │             ▼
//!    └───────── Failed   (reset only via the explicit retry-failed op)
//! ```
//!
//! Events are never deleted; the log doubles as an audit trail.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::payload::ResourceKind;

/// Kind of mutation carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    /// Parse the wire representation. Unknown values are a validation
    /// error at the protocol boundary, never a panic.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing status of a [`SyncEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Accepted, not yet evaluated
    Pending,
    /// Claimed by a processing attempt
    InProgress,
    /// Applied to the system of record; terminal
    Completed,
    /// Conflict or apply error; terminal per attempt, resettable via
    /// the retry-failed operation
    Failed,
}

impl SyncStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the state machine permits `self → next`.
    ///
    /// `Failed → Pending` is only reachable through the explicit
    /// retry-failed operation; the claim path never takes it.
    #[must_use]
    pub fn can_transition_to(self, next: SyncStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::Failed, Self::Pending)
        )
    }

    /// Terminal states return their stored outcome on re-submission
    /// instead of being re-processed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller identity attached to every protocol operation.
///
/// Populated by the external auth layer; the engine only threads it through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventScope {
    pub tenant_id: String,
    pub user_id: String,
    pub device_id: String,
}

impl EventScope {
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}

/// One durable entry in the server-side sync event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Server-assigned, monotonically increasing. Defines catch-up order.
    pub id: i64,
    pub tenant_id: String,
    pub user_id: String,
    pub device_id: String,
    /// Client-generated de-duplication key, unique per tenant
    pub idempotency_token: String,
    pub event_type: EventType,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    /// The mutation body on acceptance; replaced by the canonical applied
    /// state on completion so catch-up consumers merge server truth
    pub payload: Value,
    pub status: SyncStatus,
    /// Failed apply attempts for this event (server-side counter,
    /// independent of any client-side retry counter)
    pub retry_count: u32,
    /// Structured conflict/error description, set only when `Failed`
    pub error_message: Option<String>,
    /// Epoch millis, set only when `Completed`
    pub synced_at: Option<i64>,
    /// Epoch millis at insertion; secondary ordering key
    pub created_at: i64,
}

impl SyncEvent {
    /// Entity key used to serialize processing of events that target the
    /// same business resource.
    #[must_use]
    pub fn entity_key(&self) -> String {
        entity_key(&self.tenant_id, self.resource_kind, &self.resource_id)
    }
}

/// Key identifying one business entity within one tenant.
#[must_use]
pub fn entity_key(tenant_id: &str, kind: ResourceKind, resource_id: &str) -> String {
    format!("{}/{}/{}", tenant_id, kind.as_str(), resource_id)
}

/// Current time as epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
