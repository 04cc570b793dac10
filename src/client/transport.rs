//! Transport between a device and the sync coordinator.
//!
//! The worker only sees this trait; whether the coordinator lives in the
//! same process or behind an HTTP layer is the embedder's choice. The error
//! split matters: [`TransportError::Unavailable`] means "try again later,
//! touch nothing", while outcomes that did reach the server come back in
//! the [`PushResponse`] itself.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::coordinator::{ClientEvent, PushResponse, SyncCoordinator};
use crate::event::{EventScope, SyncEvent};

#[derive(Error, Debug)]
pub enum TransportError {
    /// Network down or server unreachable; the cycle aborts without
    /// mutating the outbox
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
    /// The server answered with a failure
    #[error("Server error: {0}")]
    Server(String),
}

#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Push a batch and fetch the catch-up slice past `after_id` in one
    /// round trip.
    async fn push_events(
        &self,
        scope: &EventScope,
        events: Vec<ClientEvent>,
        after_id: Option<i64>,
    ) -> Result<PushResponse, TransportError>;

    /// Catch-up page for paging beyond the slice in a push response.
    async fn events_since(
        &self,
        tenant_id: &str,
        after_id: i64,
    ) -> Result<Vec<SyncEvent>, TransportError>;
}

/// Transport for a coordinator living in the same process.
pub struct InProcessTransport {
    coordinator: Arc<SyncCoordinator>,
}

impl InProcessTransport {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl SyncTransport for InProcessTransport {
    async fn push_events(
        &self,
        scope: &EventScope,
        events: Vec<ClientEvent>,
        after_id: Option<i64>,
    ) -> Result<PushResponse, TransportError> {
        self.coordinator
            .push_events(scope, events, after_id)
            .await
            .map_err(|e| TransportError::Server(e.to_string()))
    }

    async fn events_since(
        &self,
        tenant_id: &str,
        after_id: i64,
    ) -> Result<Vec<SyncEvent>, TransportError> {
        self.coordinator
            .events_since(tenant_id, after_id, None)
            .await
            .map_err(|e| TransportError::Server(e.to_string()))
    }
}
