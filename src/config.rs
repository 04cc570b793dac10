//! Configuration for the sync engine.
//!
//! # Example
//!
//! ```
//! use pos_sync::SyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert_eq!(config.sync_interval_secs, 30);
//!
//! // Full config
//! let config = SyncConfig {
//!     sync_interval_secs: 10,
//!     push_batch_size: 50,
//!     max_retries: 5,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

/// Configuration shared by the client-side worker and the server-side
/// coordinator.
///
/// All fields default to values suited to in-store terminals (30s sync
/// interval, 3 automatic retries).
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Seconds between automatic sync cycles while the device is online
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Maximum queue items pushed per sync cycle
    #[serde(default = "default_push_batch_size")]
    pub push_batch_size: usize,

    /// Client-side automatic retry ceiling before an item is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Server-side bound on per-event processing time (milliseconds).
    /// An event that exceeds it is failed transiently, not left blocking
    /// the rest of the batch.
    #[serde(default = "default_event_timeout_ms")]
    pub event_timeout_ms: u64,

    /// Maximum events pulled per catch-up request
    #[serde(default = "default_catchup_limit")]
    pub catchup_limit: usize,
}

fn default_sync_interval_secs() -> u64 { 30 }
fn default_push_batch_size() -> usize { 100 }
fn default_max_retries() -> u32 { 3 }
fn default_event_timeout_ms() -> u64 { 5000 }
fn default_catchup_limit() -> usize { 200 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval_secs(),
            push_batch_size: default_push_batch_size(),
            max_retries: default_max_retries(),
            event_timeout_ms: default_event_timeout_ms(),
            catchup_limit: default_catchup_limit(),
        }
    }
}
