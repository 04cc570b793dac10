//! Device-side half of the sync subsystem: durable outbox, local snapshot,
//! transport, and the background worker that ties them together.

pub mod memory;
pub mod sqlite;
pub mod traits;
pub mod transport;
pub mod worker;

pub use memory::MemoryLocalStore;
pub use sqlite::SqliteLocalStore;
pub use traits::{
    Checkpoint, LocalQueueItem, LocalStore, NewQueueItem, OutboxStore, SnapshotRow, SnapshotStore,
};
pub use transport::{InProcessTransport, SyncTransport, TransportError};
pub use worker::{CycleOutcome, SyncWorker, WorkerState};
