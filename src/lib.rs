//! # POS Sync
//!
//! Offline-first synchronization for point-of-sale deployments: devices keep
//! selling through network outages and reconcile with the server when
//! connectivity returns.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Device (client::*)                     │
//! │  • Outbox: durable queue of offline mutations               │
//! │  • Snapshot: local copy of server state + checkpoint        │
//! │  • SyncWorker: single-flight cycles on timer/demand/online  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                     (SyncTransport: push + catch-up)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                SyncCoordinator (coordinator::*)              │
//! │  • Validates wire events into closed types                  │
//! │  • De-duplicates on (tenant, idempotency_token)             │
//! │  • Serializes per-entity processing                         │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                              │
//!                 ▼                              ▼
//! ┌───────────────────────────┐  ┌──────────────────────────────┐
//! │  Event log (storage::*)   │  │  System of record            │
//! │  • Pending → InProgress   │  │  (resources::*)              │
//! │    → Completed | Failed   │  │  • Version token per         │
//! │  • Ordered catch-up feed  │  │    resource (conflict::*)    │
//! └───────────────────────────┘  └──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pos_sync::{
//!     InMemoryEventLog, InMemoryResources, InProcessTransport, MemoryLocalStore,
//!     NewQueueItem, SyncConfig, SyncCoordinator, SyncWorker,
//! };
//! use pos_sync::event::{EventScope, EventType};
//! use pos_sync::payload::ResourceKind;
//! use pos_sync::client::OutboxStore;
//! use serde_json::json;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let coordinator = Arc::new(SyncCoordinator::new(
//!         Arc::new(InMemoryEventLog::new()),
//!         Arc::new(InMemoryResources::new()),
//!         SyncConfig::default(),
//!     ));
//!
//!     let store = Arc::new(MemoryLocalStore::new());
//!     let (online_tx, online_rx) = watch::channel(true);
//!     let worker = SyncWorker::new(
//!         store.clone(),
//!         Arc::new(InProcessTransport::new(coordinator)),
//!         EventScope::new("tenant-1", "user-1", "till-1"),
//!         SyncConfig::default(),
//!         online_rx,
//!     );
//!
//!     // Record a sale while (possibly) offline
//!     store.enqueue(NewQueueItem {
//!         event_type: EventType::Create,
//!         resource_kind: ResourceKind::Sale,
//!         resource_id: "sale-1".into(),
//!         payload: json!({
//!             "location_id": "shop-1",
//!             "lines": [{"product_id": "p1", "quantity": 2, "unit_price_cents": 350}],
//!             "total_cents": 700,
//!         }),
//!     }).await.unwrap();
//!
//!     // Push now instead of waiting for the timer
//!     worker.trigger().await.unwrap();
//!     drop(online_tx);
//! }
//! ```
//!
//! ## Guarantees
//!
//! - **Durable offline queue**: mutations survive restarts and are pushed
//!   in creation order with stable idempotency tokens
//! - **Exactly-once apply**: resubmitted tokens never re-apply a settled
//!   mutation; only transiently failed attempts get another try
//! - **No lost updates**: version-token conflict detection instead of
//!   wall-clock last-write-wins
//! - **Deterministic catch-up**: completed events in acceptance order,
//!   pageable by event id
//!
//! ## Modules
//!
//! - [`coordinator`]: server-side protocol surface
//! - [`client`]: device-side outbox, snapshot, transport and worker
//! - [`storage`]: event log backends (memory, SQLite/MySQL)
//! - [`resources`]: versioned system of record
//! - [`conflict`]: version-token conflict detection
//! - [`resilience`]: retry policies

pub mod client;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod event;
pub mod metrics;
pub mod payload;
pub mod resilience;
pub mod resources;
pub mod storage;

pub use client::{
    Checkpoint, CycleOutcome, InProcessTransport, LocalQueueItem, MemoryLocalStore, NewQueueItem,
    SnapshotRow, SqliteLocalStore, SyncTransport, SyncWorker, TransportError, WorkerState,
};
pub use config::SyncConfig;
pub use conflict::{ConflictDetector, ConflictInfo, ConflictKind, Evaluation};
pub use coordinator::{
    ClientEvent, ConflictReport, PushResponse, RetryFailedResponse, StatusSummary, SyncCoordinator,
};
pub use event::{EventScope, EventType, SyncEvent, SyncStatus};
pub use payload::{ResourceKind, ResourcePayload};
pub use resilience::retry::RetryConfig;
pub use resources::{InMemoryResources, ResourceRecord, ResourceStore};
pub use storage::memory::InMemoryEventLog;
pub use storage::sql::SqlEventLog;
pub use storage::traits::{EventLogStore, InsertOutcome, NewEvent, StorageError};
