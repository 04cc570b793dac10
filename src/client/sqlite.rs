// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite device store: one database file holding the outbox, the local
//! snapshot tables and the sync checkpoint.
//!
//! ```sql
//! CREATE TABLE sync_queue (
//!   local_id          INTEGER PRIMARY KEY,  -- creation order
//!   idempotency_token TEXT NOT NULL UNIQUE,
//!   event_type        TEXT NOT NULL,
//!   resource_kind     TEXT NOT NULL,
//!   resource_id       TEXT NOT NULL,
//!   payload           TEXT,
//!   created_at_local  INTEGER NOT NULL,
//!   retry_count       INTEGER NOT NULL,
//!   dead              INTEGER NOT NULL
//! )
//! -- plus products / inventory_items / sales snapshot tables and a
//! -- metadata key-value table for the checkpoint
//! ```
//!
//! Everything on this device goes through the one SQLite file, so a sync
//! cycle interrupted by power loss resumes cleanly: queued mutations and
//! the checkpoint always agree.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::time::Duration;
use uuid::Uuid;

use crate::event::{now_millis, EventType};
use crate::payload::ResourceKind;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::StorageError;
use super::traits::{
    Checkpoint, LocalQueueItem, NewQueueItem, OutboxStore, SnapshotRow, SnapshotStore,
};

const CHECKPOINT_KEY: &str = "checkpoint";

fn snapshot_table(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Product => "products",
        ResourceKind::InventoryItem => "inventory_items",
        ResourceKind::Sale => "sales",
    }
}

pub struct SqliteLocalStore {
    pool: AnyPool,
}

impl SqliteLocalStore {
    /// Open (or create) the device database.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        crate::storage::sql::install_drivers();

        let pool = retry("client_db_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(4)
                .acquire_timeout(Duration::from_secs(10))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut statements = vec![
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                local_id INTEGER PRIMARY KEY AUTOINCREMENT,
                idempotency_token TEXT NOT NULL UNIQUE,
                event_type TEXT NOT NULL,
                resource_kind TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                payload TEXT,
                created_at_local INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                dead INTEGER NOT NULL DEFAULT 0
            )
            "#
            .to_string(),
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#
            .to_string(),
        ];
        for kind in ResourceKind::all() {
            statements.push(format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    resource_id TEXT PRIMARY KEY,
                    version INTEGER NOT NULL,
                    data TEXT,
                    updated_at INTEGER NOT NULL
                )
                "#,
                snapshot_table(kind)
            ));
        }

        for sql in &statements {
            retry("client_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }
        Ok(())
    }

    fn text_column(row: &sqlx::any::AnyRow, name: &str) -> Option<String> {
        row.try_get::<String, _>(name).ok().or_else(|| {
            row.try_get::<Vec<u8>, _>(name)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }

    fn row_to_queue_item(row: &sqlx::any::AnyRow) -> Result<LocalQueueItem, StorageError> {
        let text = |name: &str| {
            Self::text_column(row, name)
                .ok_or_else(|| StorageError::Backend(format!("missing column '{}'", name)))
        };

        let event_type_raw = text("event_type")?;
        let event_type = EventType::parse(&event_type_raw).ok_or_else(|| {
            StorageError::Backend(format!("unknown event_type '{}'", event_type_raw))
        })?;
        let kind_raw = text("resource_kind")?;
        let resource_kind = ResourceKind::parse(&kind_raw).ok_or_else(|| {
            StorageError::Backend(format!("unknown resource_kind '{}'", kind_raw))
        })?;

        Ok(LocalQueueItem {
            local_id: row
                .try_get("local_id")
                .map_err(|e| StorageError::Backend(e.to_string()))?,
            idempotency_token: text("idempotency_token")?,
            event_type,
            resource_kind,
            resource_id: text("resource_id")?,
            payload: Self::text_column(row, "payload")
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(Value::Null),
            created_at_local: row.try_get("created_at_local").unwrap_or(0),
            retry_count: row.try_get::<i64, _>("retry_count").unwrap_or(0).max(0) as u32,
            dead: row.try_get::<i64, _>("dead").unwrap_or(0) != 0,
        })
    }

    fn row_to_snapshot(row: &sqlx::any::AnyRow) -> Result<SnapshotRow, StorageError> {
        Ok(SnapshotRow {
            resource_id: Self::text_column(row, "resource_id")
                .ok_or_else(|| StorageError::Backend("missing resource_id".to_string()))?,
            version: row
                .try_get("version")
                .map_err(|e| StorageError::Backend(e.to_string()))?,
            data: Self::text_column(row, "data")
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(Value::Null),
            updated_at: row.try_get("updated_at").unwrap_or(0),
        })
    }
}

#[async_trait]
impl OutboxStore for SqliteLocalStore {
    async fn enqueue(&self, item: NewQueueItem) -> Result<LocalQueueItem, StorageError> {
        let token = Uuid::new_v4().to_string();
        let created_at = now_millis();
        let payload_json = serde_json::to_string(&item.payload)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let result = retry("client_enqueue", &RetryConfig::query(), || async {
            sqlx::query(
                "INSERT INTO sync_queue \
                 (idempotency_token, event_type, resource_kind, resource_id, \
                  payload, created_at_local, retry_count, dead) \
                 VALUES (?, ?, ?, ?, ?, ?, 0, 0)",
            )
            .bind(&token)
            .bind(item.event_type.as_str())
            .bind(item.resource_kind.as_str())
            .bind(&item.resource_id)
            .bind(&payload_json)
            .bind(created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let local_id = result.last_insert_id().unwrap_or_default();
        Ok(LocalQueueItem {
            local_id,
            idempotency_token: token,
            event_type: item.event_type,
            resource_kind: item.resource_kind,
            resource_id: item.resource_id,
            payload: item.payload,
            created_at_local: created_at,
            retry_count: 0,
            dead: false,
        })
    }

    async fn peek_batch(&self, limit: usize) -> Result<Vec<LocalQueueItem>, StorageError> {
        retry("client_peek_batch", &RetryConfig::query(), || async {
            let rows = sqlx::query(
                "SELECT local_id, idempotency_token, event_type, resource_kind, \
                 resource_id, payload, created_at_local, retry_count, dead \
                 FROM sync_queue WHERE dead = 0 ORDER BY local_id ASC LIMIT ?",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
            rows.iter().map(Self::row_to_queue_item).collect()
        })
        .await
    }

    async fn ack(&self, local_id: i64) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE local_id = ?")
            .bind(local_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn bump_retry(&self, local_id: i64) -> Result<u32, StorageError> {
        let result =
            sqlx::query("UPDATE sync_queue SET retry_count = retry_count + 1 WHERE local_id = ?")
                .bind(local_id)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }

        let row = sqlx::query("SELECT retry_count FROM sync_queue WHERE local_id = ?")
            .bind(local_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let count: i64 = row
            .try_get("retry_count")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(count.max(0) as u32)
    }

    async fn mark_dead(&self, local_id: i64) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE sync_queue SET dead = 1 WHERE local_id = ?")
            .bind(local_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn dead_items(&self, limit: usize) -> Result<Vec<LocalQueueItem>, StorageError> {
        let rows = sqlx::query(
            "SELECT local_id, idempotency_token, event_type, resource_kind, \
             resource_id, payload, created_at_local, retry_count, dead \
             FROM sync_queue WHERE dead = 1 ORDER BY local_id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.iter().map(Self::row_to_queue_item).collect()
    }

    async fn requeue(&self, local_id: i64) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE sync_queue SET dead = 0, retry_count = 0 WHERE local_id = ? AND dead = 1",
        )
        .bind(local_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn queue_depth(&self) -> Result<usize, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM sync_queue WHERE dead = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let count: i64 = row
            .try_get("cnt")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(count.max(0) as usize)
    }
}

#[async_trait]
impl SnapshotStore for SqliteLocalStore {
    async fn get(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<Option<SnapshotRow>, StorageError> {
        let sql = format!(
            "SELECT resource_id, version, data, updated_at FROM {} WHERE resource_id = ?",
            snapshot_table(kind)
        );
        let row = sqlx::query(&sql)
            .bind(resource_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.as_ref().map(Self::row_to_snapshot).transpose()
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<SnapshotRow>, StorageError> {
        let sql = format!(
            "SELECT resource_id, version, data, updated_at FROM {} ORDER BY resource_id",
            snapshot_table(kind)
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.iter().map(Self::row_to_snapshot).collect()
    }

    async fn upsert(&self, kind: ResourceKind, row: SnapshotRow) -> Result<(), StorageError> {
        let data_json = serde_json::to_string(&row.data)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let sql = format!(
            "INSERT INTO {} (resource_id, version, data, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(resource_id) DO UPDATE SET \
               version = excluded.version, \
               data = excluded.data, \
               updated_at = excluded.updated_at",
            snapshot_table(kind)
        );
        sqlx::query(&sql)
            .bind(&row.resource_id)
            .bind(row.version)
            .bind(&data_json)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, kind: ResourceKind, resource_id: &str) -> Result<(), StorageError> {
        let sql = format!("DELETE FROM {} WHERE resource_id = ?", snapshot_table(kind));
        sqlx::query(&sql)
            .bind(resource_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn replace_all(
        &self,
        snapshot: Vec<(ResourceKind, Vec<SnapshotRow>)>,
    ) -> Result<(), StorageError> {
        // One transaction: readers see either the old snapshot or the new,
        // never a half-swapped mix
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        for (kind, rows) in &snapshot {
            let delete_sql = format!("DELETE FROM {}", snapshot_table(*kind));
            sqlx::query(&delete_sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            let insert_sql = format!(
                "INSERT INTO {} (resource_id, version, data, updated_at) VALUES (?, ?, ?, ?)",
                snapshot_table(*kind)
            );
            for row in rows {
                let data_json = serde_json::to_string(&row.data)
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                sqlx::query(&insert_sql)
                    .bind(&row.resource_id)
                    .bind(row.version)
                    .bind(&data_json)
                    .bind(row.updated_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn checkpoint(&self) -> Result<Checkpoint, StorageError> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = ?")
            .bind(CHECKPOINT_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(row
            .as_ref()
            .and_then(|r| Self::text_column(r, "value"))
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default())
    }

    async fn set_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StorageError> {
        let value = serde_json::to_string(&checkpoint)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        sqlx::query(
            "INSERT INTO metadata (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(CHECKPOINT_KEY)
        .bind(&value)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut tables = vec!["sync_queue".to_string(), "metadata".to_string()];
        tables.extend(ResourceKind::all().map(|k| snapshot_table(k).to_string()));
        for table in &tables {
            let sql = format!("DELETE FROM {}", table);
            sqlx::query(&sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        PathBuf::from("temp").join(format!("client_test_{}.db", name))
    }

    fn cleanup_db(path: &PathBuf) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(format!("{}-wal", path.display()));
        let _ = std::fs::remove_file(format!("{}-shm", path.display()));
    }

    async fn open_store(path: &PathBuf) -> SqliteLocalStore {
        let _ = std::fs::create_dir_all("temp");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        SqliteLocalStore::new(&url).await.unwrap()
    }

    fn item(resource_id: &str) -> NewQueueItem {
        NewQueueItem {
            event_type: EventType::Create,
            resource_kind: ResourceKind::Product,
            resource_id: resource_id.to_string(),
            payload: json!({"sku": resource_id, "name": "N", "price_cents": 1}),
        }
    }

    #[tokio::test]
    async fn test_outbox_survives_reopen() {
        let db_path = temp_db_path("outbox_reopen");
        cleanup_db(&db_path);

        let token = {
            let store = open_store(&db_path).await;
            store.enqueue(item("p1")).await.unwrap().idempotency_token
        };

        // Simulated restart: same file, fresh pool
        let store = open_store(&db_path).await;
        let batch = store.peek_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].idempotency_token, token);

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_ack_and_retry_lifecycle() {
        let db_path = temp_db_path("lifecycle");
        cleanup_db(&db_path);
        let store = open_store(&db_path).await;

        let a = store.enqueue(item("p1")).await.unwrap();
        let b = store.enqueue(item("p2")).await.unwrap();

        assert_eq!(store.bump_retry(a.local_id).await.unwrap(), 1);
        assert_eq!(store.bump_retry(a.local_id).await.unwrap(), 2);
        store.mark_dead(a.local_id).await.unwrap();
        store.ack(b.local_id).await.unwrap();

        assert_eq!(store.queue_depth().await.unwrap(), 0);
        let dead = store.dead_items(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 2);

        store.requeue(a.local_id).await.unwrap();
        assert_eq!(store.queue_depth().await.unwrap(), 1);

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_snapshot_tables_are_separate() {
        let db_path = temp_db_path("snapshot_tables");
        cleanup_db(&db_path);
        let store = open_store(&db_path).await;

        store
            .upsert(
                ResourceKind::Product,
                SnapshotRow {
                    resource_id: "x1".to_string(),
                    version: 1,
                    data: json!({"sku": "A"}),
                    updated_at: 1,
                },
            )
            .await
            .unwrap();
        store
            .upsert(
                ResourceKind::Sale,
                SnapshotRow {
                    resource_id: "x1".to_string(),
                    version: 3,
                    data: json!({"total_cents": 500}),
                    updated_at: 2,
                },
            )
            .await
            .unwrap();

        // Same id, different kinds, different tables
        assert_eq!(store.get(ResourceKind::Product, "x1").await.unwrap().unwrap().version, 1);
        assert_eq!(store.get(ResourceKind::Sale, "x1").await.unwrap().unwrap().version, 3);
        assert!(store.get(ResourceKind::InventoryItem, "x1").await.unwrap().is_none());

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_replace_all_swaps_atomically() {
        let db_path = temp_db_path("replace_all");
        cleanup_db(&db_path);
        let store = open_store(&db_path).await;

        for id in ["a", "b"] {
            store
                .upsert(
                    ResourceKind::Product,
                    SnapshotRow {
                        resource_id: id.to_string(),
                        version: 1,
                        data: json!({}),
                        updated_at: 1,
                    },
                )
                .await
                .unwrap();
        }

        store
            .replace_all(vec![(
                ResourceKind::Product,
                vec![SnapshotRow {
                    resource_id: "c".to_string(),
                    version: 7,
                    data: json!({"sku": "C"}),
                    updated_at: 9,
                }],
            )])
            .await
            .unwrap();

        let rows = store.list(ResourceKind::Product).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].resource_id, "c");

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let db_path = temp_db_path("checkpoint");
        cleanup_db(&db_path);
        let store = open_store(&db_path).await;

        assert_eq!(store.checkpoint().await.unwrap(), Checkpoint::default());

        let checkpoint = Checkpoint {
            last_seen_event_id: 42,
            last_sync: Some(1_700_000_000_000),
        };
        store.set_checkpoint(checkpoint).await.unwrap();
        assert_eq!(store.checkpoint().await.unwrap(), checkpoint);

        store.clear_all().await.unwrap();
        assert_eq!(store.checkpoint().await.unwrap(), Checkpoint::default());

        cleanup_db(&db_path);
    }
}
