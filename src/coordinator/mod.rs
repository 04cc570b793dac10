// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server-side sync coordinator.
//!
//! The [`SyncCoordinator`] is the protocol surface devices talk to:
//! - **push**: accept a batch of mutations, de-duplicate, evaluate, and
//!   return per-event outcomes plus a catch-up slice
//! - **catch-up**: completed events after a device's cursor, in acceptance
//!   order
//! - **status / conflicts**: tenant queue overview for back-office UIs
//! - **retry-failed**: reset failed events to pending and reprocess them
//!
//! Every accepted mutation becomes a durable [`SyncEvent`](crate::event::SyncEvent)
//! moving through `Pending → InProgress → Completed | Failed`. Events that
//! target the same business entity are processed one at a time; events for
//! different entities proceed concurrently.

mod feed;
mod types;

pub use types::{
    ClientEvent, ConflictReport, PushResponse, RetryFailedResponse, StatusSummary, ValidEvent,
    CONFLICT_LIST_CAP, PENDING_LIST_CAP, RETRY_FAILED_CAP,
};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::conflict::{ConflictDetector, ConflictInfo, Evaluation};
use crate::event::{now_millis, EventScope, SyncEvent, SyncStatus};
use crate::metrics;
use crate::resources::ResourceStore;
use crate::storage::traits::{EventLogStore, InsertOutcome, NewEvent, StorageError};

/// Outcome of processing one accepted event.
#[derive(Debug)]
enum EventOutcome {
    Completed,
    Conflict(ConflictReport),
    /// Still held by a concurrent processor; the client resubmits later
    Skipped,
}

pub struct SyncCoordinator {
    log: Arc<dyn EventLogStore>,
    detector: ConflictDetector,
    /// One lock per business entity; serializes read-check-write on the
    /// system of record
    entity_locks: DashMap<String, Arc<Mutex<()>>>,
    config: SyncConfig,
}

impl SyncCoordinator {
    pub fn new(
        log: Arc<dyn EventLogStore>,
        resources: Arc<dyn ResourceStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            log,
            detector: ConflictDetector::new(resources),
            entity_locks: DashMap::new(),
            config,
        }
    }

    pub fn log(&self) -> &Arc<dyn EventLogStore> {
        &self.log
    }

    pub fn resources(&self) -> &Arc<dyn ResourceStore> {
        self.detector.resources()
    }

    /// Accept a batch of mutations from one device.
    ///
    /// Events that fail validation are reported in `errors` and never enter
    /// the log. Accepted events are evaluated immediately; resubmissions of
    /// already-resolved tokens return their stored outcome without touching
    /// the system of record. When `after_id` is given the response also
    /// carries the catch-up slice past that cursor, so one round trip serves
    /// both directions of a sync cycle.
    #[tracing::instrument(skip(self, events), fields(tenant = %scope.tenant_id, device = %scope.device_id, batch = events.len()))]
    pub async fn push_events(
        &self,
        scope: &EventScope,
        events: Vec<ClientEvent>,
        after_id: Option<i64>,
    ) -> Result<PushResponse, StorageError> {
        let batch_size = events.len();
        let mut synced_count = 0usize;
        let mut conflicts = Vec::new();
        let mut errors = Vec::new();
        let mut skipped = Vec::new();

        for client_event in events {
            let valid = match client_event.validate() {
                Ok(v) => v,
                Err(reason) => {
                    debug!(reason = %reason, "Rejected event at validation");
                    errors.push(reason);
                    continue;
                }
            };

            let token = valid.idempotency_token.clone();
            match self.accept_event(scope, valid).await? {
                EventOutcome::Completed => synced_count += 1,
                EventOutcome::Conflict(report) => conflicts.push(report),
                EventOutcome::Skipped => skipped.push(token),
            }
        }

        metrics::record_push(batch_size, errors.len());
        if !conflicts.is_empty() {
            info!(
                conflicts = conflicts.len(),
                synced = synced_count,
                "Push finished with conflicts"
            );
        }

        let server_events = match after_id {
            Some(cursor) => self.events_since(&scope.tenant_id, cursor, None).await?,
            None => Vec::new(),
        };

        Ok(PushResponse {
            synced_count,
            conflicts,
            server_events,
            errors,
            skipped,
        })
    }

    /// Accept a single validated mutation outside a batch.
    ///
    /// Same acceptance path as [`push_events`](Self::push_events), without
    /// the catch-up slice.
    pub async fn submit_event(
        &self,
        scope: &EventScope,
        event: ClientEvent,
    ) -> Result<Option<ConflictReport>, StorageError> {
        let valid = event
            .validate()
            .map_err(StorageError::Backend)?;
        match self.accept_event(scope, valid).await? {
            EventOutcome::Conflict(report) => Ok(Some(report)),
            _ => Ok(None),
        }
    }

    /// Insert-or-resolve one validated event, then process it.
    async fn accept_event(
        &self,
        scope: &EventScope,
        valid: ValidEvent,
    ) -> Result<EventOutcome, StorageError> {
        let outcome = self
            .log
            .insert(NewEvent {
                scope: scope.clone(),
                idempotency_token: valid.idempotency_token,
                event_type: valid.event_type,
                resource_kind: valid.resource_kind,
                resource_id: valid.resource_id,
                payload: valid.payload,
            })
            .await?;

        match outcome {
            InsertOutcome::Inserted(event) => self.process_event(event).await,
            InsertOutcome::Duplicate(event) => match event.status {
                // Token already resolved; return the stored outcome
                SyncStatus::Completed => {
                    debug!(event_id = event.id, "Duplicate of completed event");
                    Ok(EventOutcome::Completed)
                }
                SyncStatus::Failed => self.retry_duplicate_failed(event).await,
                // Accepted earlier but never resolved (e.g. crash between
                // insert and claim); process it now
                SyncStatus::Pending => self.process_event(event).await,
                // Held by a concurrent processor; waiting on the entity
                // lock inside process_event yields the winner's outcome
                SyncStatus::InProgress => self.process_event(event).await,
            },
        }
    }

    /// Resolve a resubmission whose stored event is `Failed`.
    ///
    /// A structured conflict is a settled outcome: the client must resolve
    /// the discrepancy, so the stored report comes back unchanged. A
    /// plain-text failure (backend error, apply timeout) is only the record
    /// of a failed attempt; the resubmission gets a fresh one.
    async fn retry_duplicate_failed(&self, event: SyncEvent) -> Result<EventOutcome, StorageError> {
        let is_conflict = event
            .error_message
            .as_deref()
            .and_then(ConflictInfo::parse_error_json)
            .is_some();
        if is_conflict {
            return Ok(EventOutcome::Conflict(Self::report_from_event(&event)));
        }

        debug!(event_id = event.id, "Re-attempting transiently failed event");
        self.log.reset_failed(event.id).await?;
        // Re-fetch: if another resubmission raced the reset, process_event
        // resolves against whatever state won
        let refreshed = self
            .log
            .get(event.id)
            .await?
            .ok_or(StorageError::NotFound)?;
        self.process_event(refreshed).await
    }

    /// Claim and evaluate one event under its entity lock.
    async fn process_event(&self, event: SyncEvent) -> Result<EventOutcome, StorageError> {
        let key = event.entity_key();
        let lock = self
            .entity_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock().await;
        let outcome = self.claim_and_evaluate(event).await;
        drop(guard);
        drop(lock);
        // Drop the map entry once no one else holds it; a concurrent
        // entry() call keeps its own clone, so the count stays above one
        // and the entry survives
        self.entity_locks
            .remove_if(&key, |_, l| Arc::strong_count(l) == 1);
        outcome
    }

    async fn claim_and_evaluate(&self, event: SyncEvent) -> Result<EventOutcome, StorageError> {
        if !self.log.claim(event.id).await? {
            // Lost the claim race; report whatever the winner decided
            return match self.log.get(event.id).await? {
                Some(stored) if stored.status == SyncStatus::Completed => {
                    Ok(EventOutcome::Completed)
                }
                Some(stored) if stored.status == SyncStatus::Failed => {
                    Ok(EventOutcome::Conflict(Self::report_from_event(&stored)))
                }
                _ => Ok(EventOutcome::Skipped),
            };
        }

        let timeout = Duration::from_millis(self.config.event_timeout_ms);
        let evaluation = match tokio::time::timeout(timeout, self.detector.evaluate(&event)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(event_id = event.id, "Event apply timed out");
                Err(StorageError::Backend(format!(
                    "apply timed out after {}ms",
                    self.config.event_timeout_ms
                )))
            }
        };

        match evaluation {
            Ok(Evaluation::Applied(record)) => {
                let canonical = record
                    .as_ref()
                    .and_then(|r| serde_json::to_value(r).ok())
                    .unwrap_or(serde_json::Value::Null);
                self.log.complete(event.id, now_millis(), &canonical).await?;
                metrics::record_event_outcome(event.resource_kind.as_str(), "completed");
                debug!(event_id = event.id, resource = %event.resource_id, "Event applied");
                Ok(EventOutcome::Completed)
            }
            Ok(Evaluation::Conflict(info)) => {
                self.log.fail(event.id, &info.to_error_json()).await?;
                metrics::record_event_outcome(event.resource_kind.as_str(), "conflict");
                metrics::record_conflict(event.resource_kind.as_str(), info.kind.as_str());
                info!(
                    event_id = event.id,
                    resource = %event.resource_id,
                    kind = %info.kind,
                    "Conflict detected"
                );
                Ok(EventOutcome::Conflict(Self::report(&event, &info)))
            }
            Err(e) => {
                // Apply error, not a version conflict; stored as plain text
                self.log.fail(event.id, &e.to_string()).await?;
                metrics::record_event_outcome(event.resource_kind.as_str(), "failed");
                warn!(event_id = event.id, error = %e, "Event apply failed");
                let mut failed = event;
                failed.error_message = Some(e.to_string());
                Ok(EventOutcome::Conflict(Self::report_from_event(&failed)))
            }
        }
    }

    fn report(event: &SyncEvent, info: &ConflictInfo) -> ConflictReport {
        ConflictReport {
            event_id: event.id,
            idempotency_token: event.idempotency_token.clone(),
            resource_type: event.resource_kind.as_str().to_string(),
            resource_id: event.resource_id.clone(),
            kind: info.kind.as_str().to_string(),
            message: info.message.clone(),
            current: info
                .current
                .as_ref()
                .and_then(|r| serde_json::to_value(r).ok())
                .unwrap_or(serde_json::Value::Null),
        }
    }

    /// Rebuild a report from a stored failed event. Plain-text messages
    /// (apply errors, timeouts) map to kind `error`.
    fn report_from_event(event: &SyncEvent) -> ConflictReport {
        let raw = event.error_message.as_deref().unwrap_or_default();
        let (kind, message, current) = ConflictInfo::parse_error_json(raw)
            .unwrap_or_else(|| ("error".to_string(), raw.to_string(), serde_json::Value::Null));
        ConflictReport {
            event_id: event.id,
            idempotency_token: event.idempotency_token.clone(),
            resource_type: event.resource_kind.as_str().to_string(),
            resource_id: event.resource_id.clone(),
            kind,
            message,
            current,
        }
    }

    /// Oldest pending events for a tenant, optionally scoped to one user.
    pub async fn pending_events(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<SyncEvent>, StorageError> {
        self.log.pending(tenant_id, user_id, PENDING_LIST_CAP).await
    }

    /// Most recent failed events for a tenant, as conflict reports.
    pub async fn conflicts(&self, tenant_id: &str) -> Result<Vec<ConflictReport>, StorageError> {
        let failed = self.log.failed(tenant_id, CONFLICT_LIST_CAP).await?;
        Ok(failed.iter().map(Self::report_from_event).collect())
    }

    /// Reset failed events to pending and reprocess them immediately.
    ///
    /// `Failed → Pending` is only reachable through here; claim ordering
    /// never resurrects a failed event on its own.
    #[tracing::instrument(skip(self))]
    pub async fn retry_failed(&self, tenant_id: &str) -> Result<RetryFailedResponse, StorageError> {
        let reset = self.log.retry_failed(tenant_id, RETRY_FAILED_CAP).await?;
        metrics::record_retry_failed(reset);
        if reset > 0 {
            info!(reset, "Reset failed events for reprocessing");
            self.process_pending(tenant_id, reset as usize).await?;
        }
        Ok(RetryFailedResponse { retried_count: reset })
    }

    /// Claim and evaluate up to `limit` pending events for a tenant.
    pub async fn process_pending(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<usize, StorageError> {
        let pending = self.log.pending(tenant_id, None, limit).await?;
        let mut processed = 0;
        for event in pending {
            if !matches!(self.process_event(event).await?, EventOutcome::Skipped) {
                processed += 1;
            }
        }
        Ok(processed)
    }

    /// Tenant queue overview: counts plus capped previews of the pending
    /// backlog and recent conflicts.
    pub async fn status(&self, tenant_id: &str) -> Result<StatusSummary, StorageError> {
        let pending_count = self.log.count_by_status(tenant_id, SyncStatus::Pending).await?;
        let conflict_count = self.log.count_by_status(tenant_id, SyncStatus::Failed).await?;
        let pending_events = self.pending_events(tenant_id, None).await?;
        let conflicts = self.conflicts(tenant_id).await?;
        Ok(StatusSummary {
            pending_count,
            conflict_count,
            pending_events,
            conflicts,
        })
    }
}
