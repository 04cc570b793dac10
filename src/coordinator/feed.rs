//! Catch-up feed.
//!
//! Devices track the highest event id they have merged and ask for
//! everything completed after it. Ids are assigned in server acceptance
//! order and events are immutable once completed, so two devices paging
//! from the same cursor always see the same sequence.

use tracing::debug;

use crate::event::SyncEvent;
use crate::metrics;
use crate::storage::traits::StorageError;

use super::SyncCoordinator;

impl SyncCoordinator {
    /// Completed events for a tenant with `id > after_id`, ascending.
    ///
    /// `limit` defaults to the configured catch-up page size and is capped
    /// by it. A full page means the device should page again with the last
    /// returned id as its new cursor.
    #[tracing::instrument(skip(self))]
    pub async fn events_since(
        &self,
        tenant_id: &str,
        after_id: i64,
        limit: Option<usize>,
    ) -> Result<Vec<SyncEvent>, StorageError> {
        let cap = self.config.catchup_limit;
        let limit = limit.map_or(cap, |l| l.min(cap));
        let events = self.log.completed_since(tenant_id, after_id, limit).await?;
        metrics::record_catchup(events.len());
        debug!(returned = events.len(), "Catch-up feed served");
        Ok(events)
    }
}
