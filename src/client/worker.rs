// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background sync worker for one device.
//!
//! Runs one cycle at a time (single-flight): on a timer, on demand via
//! [`SyncWorker::trigger`], and immediately when connectivity returns.
//! A cycle:
//!
//! 1. peek the oldest live outbox items (bounded batch)
//! 2. push them with the device's catch-up cursor
//! 3. settle each item from the response: synced and conflicted items leave
//!    the queue (conflicts are surfaced to the UI); items the server failed
//!    transiently burn one retry and dead-letter past the ceiling; items
//!    rejected at validation dead-letter at once, since resubmitting the
//!    same malformed event can never succeed
//! 4. merge the returned server events into the local snapshot, paging
//!    until the feed is drained
//! 5. persist the advanced checkpoint
//!
//! If the transport is unreachable the cycle aborts before step 3: the
//! outbox is untouched and the same batch is pushed next time, relying on
//! server-side idempotency tokens to keep resubmission safe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::coordinator::{ClientEvent, ConflictReport, PushResponse};
use crate::event::{now_millis, EventScope, EventType, SyncEvent};
use crate::metrics;
use crate::resources::ResourceRecord;
use crate::storage::traits::StorageError;
use super::traits::{Checkpoint, LocalQueueItem, LocalStore, SnapshotRow};
use super::transport::{SyncTransport, TransportError};

/// What the worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Syncing,
    /// Last cycle could not reach the server
    Offline,
}

/// How one cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Pushed and merged; counts of settled outbox items and merged events
    Completed { settled: usize, merged: usize },
    /// Device is offline; nothing attempted
    Offline,
    /// Push did not reach the server; outbox untouched
    TransportFailed,
    /// Another cycle was already in flight
    Skipped,
}

pub struct SyncWorker {
    store: Arc<dyn LocalStore>,
    transport: Arc<dyn SyncTransport>,
    scope: EventScope,
    config: SyncConfig,
    state: watch::Sender<WorkerState>,
    online_rx: watch::Receiver<bool>,
    shutdown: Notify,
    /// Single-flight guard: `trigger()` is a no-op while a cycle runs
    cycle_lock: Mutex<()>,
    /// Conflicts awaiting pickup by the UI
    conflicts: parking_lot::Mutex<Vec<ConflictReport>>,
}

impl SyncWorker {
    pub fn new(
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn SyncTransport>,
        scope: EventScope,
        config: SyncConfig,
        online_rx: watch::Receiver<bool>,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            store,
            transport,
            scope,
            config,
            state,
            online_rx,
            shutdown: Notify::new(),
            cycle_lock: Mutex::new(()),
            conflicts: parking_lot::Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Subscribe to state changes (for UI indicators).
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Conflicts collected since the last drain.
    #[must_use]
    pub fn drain_conflicts(&self) -> Vec<ConflictReport> {
        std::mem::take(&mut *self.conflicts.lock())
    }

    /// Stop the run loop after the in-flight cycle, if any, finishes.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until [`shutdown`](Self::shutdown): periodic cycles, plus an
    /// immediate cycle whenever connectivity comes back.
    pub async fn run(&self) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.sync_interval_secs));
        // Skip, don't burst: overlapping work is pointless after a stall
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut online_rx = self.online_rx.clone();

        info!(
            device = %self.scope.device_id,
            interval_secs = self.config.sync_interval_secs,
            "Sync worker started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.trigger().await {
                        warn!(error = %e, "Sync cycle failed");
                    }
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        // Connectivity sender dropped; timer keeps us going
                        continue;
                    }
                    if *online_rx.borrow() {
                        debug!("Connectivity restored, syncing now");
                        if let Err(e) = self.trigger().await {
                            warn!(error = %e, "Sync cycle failed");
                        }
                    } else {
                        let _ = self.state.send(WorkerState::Offline);
                    }
                }
                _ = self.shutdown.notified() => {
                    let _ = self.state.send(WorkerState::Idle);
                    info!(device = %self.scope.device_id, "Sync worker stopped");
                    break;
                }
            }
        }
    }

    /// Run one cycle now, unless one is already in flight.
    pub async fn trigger(&self) -> Result<CycleOutcome, StorageError> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            return Ok(CycleOutcome::Skipped);
        };
        self.sync_cycle().await
    }

    async fn sync_cycle(&self) -> Result<CycleOutcome, StorageError> {
        if !*self.online_rx.borrow() {
            let _ = self.state.send(WorkerState::Offline);
            return Ok(CycleOutcome::Offline);
        }

        let _ = self.state.send(WorkerState::Syncing);
        let started = Instant::now();

        let batch = self.store.peek_batch(self.config.push_batch_size).await?;
        let checkpoint = self.store.checkpoint().await?;

        let events: Vec<ClientEvent> = batch
            .iter()
            .map(|item| ClientEvent {
                idempotency_token: item.idempotency_token.clone(),
                event_type: item.event_type.as_str().to_string(),
                resource_type: item.resource_kind.as_str().to_string(),
                resource_id: item.resource_id.clone(),
                payload: item.payload.clone(),
            })
            .collect();

        let response = match self
            .transport
            .push_events(&self.scope, events, Some(checkpoint.last_seen_event_id))
            .await
        {
            Ok(response) => response,
            Err(TransportError::Unavailable(reason)) => {
                // Nothing reached the server; leave the outbox exactly as is
                warn!(reason = %reason, "Server unreachable, cycle aborted");
                metrics::record_transport_error();
                metrics::record_cycle("transport_failed", started.elapsed());
                let _ = self.state.send(WorkerState::Offline);
                return Ok(CycleOutcome::TransportFailed);
            }
            Err(TransportError::Server(reason)) => {
                warn!(reason = %reason, "Server rejected push, cycle aborted");
                metrics::record_transport_error();
                metrics::record_cycle("transport_failed", started.elapsed());
                let _ = self.state.send(WorkerState::Idle);
                return Ok(CycleOutcome::TransportFailed);
            }
        };

        let settled = self.settle_batch(&batch, &response).await?;

        // Merge the slice from the push, then page until the feed drains
        let mut cursor = checkpoint.last_seen_event_id;
        let mut merged = 0usize;
        let mut page = response.server_events;
        loop {
            if page.is_empty() {
                break;
            }
            for event in &page {
                self.merge_event(event).await?;
                cursor = cursor.max(event.id);
                merged += 1;
            }
            page = match self.transport.events_since(&self.scope.tenant_id, cursor).await {
                Ok(page) => page,
                Err(e) => {
                    // Checkpoint only advances past what was merged, so the
                    // next cycle resumes from here
                    warn!(error = %e, "Catch-up paging interrupted");
                    break;
                }
            };
        }

        self.store
            .set_checkpoint(Checkpoint {
                last_seen_event_id: cursor,
                last_sync: Some(now_millis()),
            })
            .await?;

        metrics::set_queue_depth(self.store.queue_depth().await?);
        metrics::record_cycle("completed", started.elapsed());
        let _ = self.state.send(WorkerState::Idle);

        debug!(settled, merged, cursor, "Sync cycle completed");
        Ok(CycleOutcome::Completed { settled, merged })
    }

    /// Settle each pushed item against the server's per-event outcomes.
    async fn settle_batch(
        &self,
        batch: &[LocalQueueItem],
        response: &PushResponse,
    ) -> Result<usize, StorageError> {
        let mut settled = 0usize;

        for item in batch {
            if let Some(report) = response
                .conflicts
                .iter()
                .find(|c| c.idempotency_token == item.idempotency_token)
            {
                if report.kind == "error" {
                    // Transient server-side failure (backend error, apply
                    // timeout): the token stays queued and resubmitting it
                    // re-attempts the apply, so burn one retry
                    let retries = self.store.bump_retry(item.local_id).await?;
                    if retries > self.config.max_retries {
                        warn!(
                            local_id = item.local_id,
                            resource = %item.resource_id,
                            retries,
                            "Outbox item dead-lettered"
                        );
                        self.store.mark_dead(item.local_id).await?;
                        metrics::record_dead_letter();
                    }
                } else {
                    // Business conflict: resubmission would fail the same
                    // way. The server keeps the failed event for audit;
                    // locally the item is finished and the conflict goes to
                    // the UI
                    self.store.ack(item.local_id).await?;
                    self.conflicts.lock().push(report.clone());
                    settled += 1;
                }
                continue;
            }

            let rejected = response
                .errors
                .iter()
                .any(|e| e.contains(&format!("'{}'", item.idempotency_token)));
            if rejected {
                // Validation rejection: no retry can fix a malformed event
                warn!(
                    local_id = item.local_id,
                    resource = %item.resource_id,
                    "Outbox item rejected at validation, dead-lettered"
                );
                self.store.mark_dead(item.local_id).await?;
                metrics::record_dead_letter();
                continue;
            }

            if response.skipped.contains(&item.idempotency_token) {
                // Outcome unknown (another push holds the event); leave the
                // item queued untouched and let the next cycle observe the
                // resolved outcome
                continue;
            }

            // Accepted and applied
            self.store.ack(item.local_id).await?;
            settled += 1;
        }

        Ok(settled)
    }

    /// Fold one completed server event into the local snapshot.
    ///
    /// Completed events carry the canonical applied record (`null` for
    /// deletes), so merging is a plain overwrite keyed by resource id;
    /// replay of already-merged events is harmless.
    async fn merge_event(&self, event: &SyncEvent) -> Result<(), StorageError> {
        if event.event_type == EventType::Delete || event.payload.is_null() {
            return self.store.remove(event.resource_kind, &event.resource_id).await;
        }

        match serde_json::from_value::<ResourceRecord>(event.payload.clone()) {
            Ok(record) => {
                self.store
                    .upsert(
                        event.resource_kind,
                        SnapshotRow {
                            resource_id: event.resource_id.clone(),
                            version: record.version,
                            data: record.data,
                            updated_at: record.updated_at,
                        },
                    )
                    .await
            }
            Err(e) => {
                warn!(event_id = event.id, error = %e, "Unreadable feed payload, skipped");
                Ok(())
            }
        }
    }
}
