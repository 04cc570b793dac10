// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the sync subsystem.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `pos_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `outcome`: completed, conflict, failed
//! - `resource_kind`: product, inventory_item, sale
//! - `conflict_kind`: duplicate_create, stale_version, not_found

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one push batch accepted at the protocol boundary
pub fn record_push(batch_size: usize, rejected: usize) {
    counter!("pos_sync_push_events_total").increment(batch_size as u64);
    if rejected > 0 {
        counter!("pos_sync_push_rejected_total").increment(rejected as u64);
    }
    histogram!("pos_sync_push_batch_size").record(batch_size as f64);
}

/// Record the outcome of processing one event
pub fn record_event_outcome(resource_kind: &str, outcome: &str) {
    counter!(
        "pos_sync_events_total",
        "resource_kind" => resource_kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a detected conflict by kind
pub fn record_conflict(resource_kind: &str, conflict_kind: &str) {
    counter!(
        "pos_sync_conflicts_total",
        "resource_kind" => resource_kind.to_string(),
        "conflict_kind" => conflict_kind.to_string()
    )
    .increment(1);
}

/// Record one catch-up feed query
pub fn record_catchup(returned: usize) {
    counter!("pos_sync_catchup_queries_total").increment(1);
    histogram!("pos_sync_catchup_batch_size").record(returned as f64);
}

/// Record events reset by the retry-failed operation
pub fn record_retry_failed(reset: u64) {
    counter!("pos_sync_retry_failed_total").increment(reset);
}

/// Record one client sync cycle and its duration
pub fn record_cycle(outcome: &str, duration: Duration) {
    counter!(
        "pos_sync_cycles_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("pos_sync_cycle_seconds").record(duration.as_secs_f64());
}

/// Set current client outbox depth
pub fn set_queue_depth(depth: usize) {
    gauge!("pos_sync_queue_depth").set(depth as f64);
}

/// Record an outbox item moved to the dead letter set
pub fn record_dead_letter() {
    counter!("pos_sync_dead_letter_total").increment(1);
}

/// Record a transport failure observed by the client worker
pub fn record_transport_error() {
    counter!("pos_sync_transport_errors_total").increment(1);
}
