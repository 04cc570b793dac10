// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for the sync event log.
//!
//! Works against SQLite and MySQL through sqlx's `Any` driver:
//! ```sql
//! CREATE TABLE sync_events (
//!   id                INTEGER PRIMARY KEY,  -- server acceptance order
//!   tenant_id         TEXT NOT NULL,
//!   user_id           TEXT NOT NULL,
//!   device_id         TEXT NOT NULL,
//!   idempotency_token TEXT NOT NULL,        -- UNIQUE per tenant
//!   event_type        TEXT NOT NULL,
//!   resource_kind     TEXT NOT NULL,
//!   resource_id       TEXT NOT NULL,
//!   payload           TEXT,                 -- JSON as text (Any driver limitation)
//!   status            TEXT NOT NULL,
//!   retry_count       INTEGER NOT NULL,
//!   error_message     TEXT,
//!   synced_at         INTEGER,
//!   created_at        INTEGER NOT NULL
//! )
//! ```
//!
//! The unique index on `(tenant_id, idempotency_token)` is what makes insert
//! idempotent under concurrent submission: the losing writer re-selects the
//! stored row instead of creating a second event.
//!
//! ## sqlx Any Driver Quirks
//!
//! TEXT columns come back as BLOB on MySQL, so every text read tries
//! `String` first and falls back to `Vec<u8>` + UTF-8 conversion.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};

use crate::event::{now_millis, EventType, SyncEvent, SyncStatus};
use crate::payload::ResourceKind;
use crate::resilience::retry::{retry, RetryConfig};
use super::traits::{EventLogStore, InsertOutcome, NewEvent, StorageError};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlEventLog {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlEventLog {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Clone of the connection pool for sharing with other stores.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// WAL mode: concurrent reads during writes, single fsync per commit.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        // WAL is safe with NORMAL
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        // TEXT instead of native JSON: sqlx's `Any` driver has no MySQL JSON
        // type mapping. JSON_EXTRACT() still works on valid-JSON TEXT.
        let table_sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS sync_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                idempotency_token TEXT NOT NULL,
                event_type TEXT NOT NULL,
                resource_kind TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                payload TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                synced_at INTEGER,
                created_at INTEGER NOT NULL
            )
            "#
        } else {
            r#"
            CREATE TABLE IF NOT EXISTS sync_events (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                tenant_id VARCHAR(64) NOT NULL,
                user_id VARCHAR(64) NOT NULL,
                device_id VARCHAR(64) NOT NULL,
                idempotency_token VARCHAR(128) NOT NULL,
                event_type VARCHAR(16) NOT NULL,
                resource_kind VARCHAR(32) NOT NULL,
                resource_id VARCHAR(255) NOT NULL,
                payload LONGTEXT,
                status VARCHAR(16) NOT NULL DEFAULT 'pending',
                retry_count BIGINT NOT NULL DEFAULT 0,
                error_message TEXT,
                synced_at BIGINT,
                created_at BIGINT NOT NULL,
                UNIQUE INDEX idx_tenant_token (tenant_id, idempotency_token),
                INDEX idx_tenant_status (tenant_id, status),
                INDEX idx_created_at (created_at)
            )
            "#
        };

        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(table_sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        // SQLite takes indexes as separate statements
        if self.is_sqlite {
            for sql in [
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_tenant_token ON sync_events (tenant_id, idempotency_token)",
                "CREATE INDEX IF NOT EXISTS idx_tenant_status ON sync_events (tenant_id, status)",
                "CREATE INDEX IF NOT EXISTS idx_created_at ON sync_events (created_at)",
            ] {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
            }
        }

        Ok(())
    }

    /// Read a TEXT column as String (SQLite) falling back to bytes (MySQL).
    fn text_column(row: &sqlx::any::AnyRow, name: &str) -> Option<String> {
        row.try_get::<String, _>(name).ok().or_else(|| {
            row.try_get::<Vec<u8>, _>(name)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }

    fn row_to_event(row: &sqlx::any::AnyRow) -> Result<SyncEvent, StorageError> {
        let id: i64 = row
            .try_get("id")
            .map_err(|e| StorageError::Backend(e.to_string()))?;

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

        let status_raw = text("status")?;
        let status = SyncStatus::parse(&status_raw)
            .ok_or_else(|| StorageError::Backend(format!("unknown status '{}'", status_raw)))?;

        let payload = Self::text_column(row, "payload")
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(Value::Null);

        Ok(SyncEvent {
            id,
            tenant_id: text("tenant_id")?,
            user_id: text("user_id")?,
            device_id: text("device_id")?,
            idempotency_token: text("idempotency_token")?,
            event_type,
            resource_kind,
            resource_id: text("resource_id")?,
            payload,
            status,
            retry_count: row.try_get::<i64, _>("retry_count").unwrap_or(0).max(0) as u32,
            error_message: Self::text_column(row, "error_message"),
            synced_at: row.try_get::<i64, _>("synced_at").ok(),
            created_at: row.try_get("created_at").unwrap_or(0),
        })
    }

    const SELECT_COLUMNS: &'static str = "id, tenant_id, user_id, device_id, idempotency_token, \
         event_type, resource_kind, resource_id, payload, status, retry_count, \
         error_message, synced_at, created_at";

    async fn find_by_token(
        &self,
        tenant_id: &str,
        token: &str,
    ) -> Result<Option<SyncEvent>, StorageError> {
        let sql = format!(
            "SELECT {} FROM sync_events WHERE tenant_id = ? AND idempotency_token = ?",
            Self::SELECT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.as_ref().map(Self::row_to_event).transpose()
    }
}

#[async_trait]
impl EventLogStore for SqlEventLog {
    async fn insert(&self, event: NewEvent) -> Result<InsertOutcome, StorageError> {
        // Fast path: token already resolved to an event
        if let Some(existing) = self
            .find_by_token(&event.scope.tenant_id, &event.idempotency_token)
            .await?
        {
            return Ok(InsertOutcome::Duplicate(existing));
        }

        let created_at = now_millis();
        let payload_json = serde_json::to_string(&event.payload)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let result = retry("sql_insert_event", &RetryConfig::query(), || async {
            sqlx::query(
                "INSERT INTO sync_events \
                 (tenant_id, user_id, device_id, idempotency_token, event_type, \
                  resource_kind, resource_id, payload, status, retry_count, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?)",
            )
            .bind(&event.scope.tenant_id)
            .bind(&event.scope.user_id)
            .bind(&event.scope.device_id)
            .bind(&event.idempotency_token)
            .bind(event.event_type.as_str())
            .bind(event.resource_kind.as_str())
            .bind(&event.resource_id)
            .bind(&payload_json)
            .bind(created_at)
            .execute(&self.pool)
            .await
        })
        .await;

        match result {
            Ok(done) => {
                // last_insert_id is available on both sqlite and mysql; if the
                // driver withholds it, the token re-select recovers the row.
                let id = done.last_insert_id();
                let stored = match id {
                    Some(id) if id > 0 => SyncEvent {
                        id,
                        tenant_id: event.scope.tenant_id,
                        user_id: event.scope.user_id,
                        device_id: event.scope.device_id,
                        idempotency_token: event.idempotency_token,
                        event_type: event.event_type,
                        resource_kind: event.resource_kind,
                        resource_id: event.resource_id,
                        payload: event.payload,
                        status: SyncStatus::Pending,
                        retry_count: 0,
                        error_message: None,
                        synced_at: None,
                        created_at,
                    },
                    _ => self
                        .find_by_token(&event.scope.tenant_id, &event.idempotency_token)
                        .await?
                        .ok_or(StorageError::NotFound)?,
                };
                Ok(InsertOutcome::Inserted(stored))
            }
            Err(e) => {
                // A concurrent submission with the same token won the insert
                // race; the unique index rejected ours. Return theirs.
                let msg = e.to_string();
                if msg.contains("UNIQUE") || msg.contains("Duplicate entry") {
                    let existing = self
                        .find_by_token(&event.scope.tenant_id, &event.idempotency_token)
                        .await?
                        .ok_or(StorageError::Backend(msg))?;
                    Ok(InsertOutcome::Duplicate(existing))
                } else {
                    Err(StorageError::Backend(msg))
                }
            }
        }
    }

    async fn get(&self, event_id: i64) -> Result<Option<SyncEvent>, StorageError> {
        retry("sql_get_event", &RetryConfig::query(), || async {
            let sql = format!(
                "SELECT {} FROM sync_events WHERE id = ?",
                Self::SELECT_COLUMNS
            );
            let row = sqlx::query(&sql)
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            row.as_ref().map(Self::row_to_event).transpose()
        })
        .await
    }

    async fn claim(&self, event_id: i64) -> Result<bool, StorageError> {
        // The conditional UPDATE is the claim: exactly one caller can move
        // the row out of 'pending'.
        let result = sqlx::query(
            "UPDATE sync_events SET status = 'in_progress' WHERE id = ? AND status = 'pending'",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // Lost the claim or the id never existed; distinguish the two
        match self.get(event_id).await? {
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound),
        }
    }

    async fn complete(
        &self,
        event_id: i64,
        synced_at: i64,
        canonical_payload: &Value,
    ) -> Result<(), StorageError> {
        let payload_json = serde_json::to_string(canonical_payload)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE sync_events \
             SET status = 'completed', synced_at = ?, payload = ?, error_message = NULL \
             WHERE id = ? AND status = 'in_progress'",
        )
        .bind(synced_at)
        .bind(&payload_json)
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.get(event_id).await? {
            Some(event) => Err(StorageError::InvalidTransition {
                from: event.status,
                to: SyncStatus::Completed,
            }),
            None => Err(StorageError::NotFound),
        }
    }

    async fn fail(&self, event_id: i64, error_message: &str) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE sync_events \
             SET status = 'failed', error_message = ?, retry_count = retry_count + 1 \
             WHERE id = ? AND status = 'in_progress'",
        )
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.get(event_id).await? {
            Some(event) => Err(StorageError::InvalidTransition {
                from: event.status,
                to: SyncStatus::Failed,
            }),
            None => Err(StorageError::NotFound),
        }
    }

    async fn pending(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncEvent>, StorageError> {
        let sql = match user_id {
            Some(_) => format!(
                "SELECT {} FROM sync_events \
                 WHERE tenant_id = ? AND user_id = ? AND status = 'pending' \
                 ORDER BY id ASC LIMIT ?",
                Self::SELECT_COLUMNS
            ),
            None => format!(
                "SELECT {} FROM sync_events \
                 WHERE tenant_id = ? AND status = 'pending' \
                 ORDER BY id ASC LIMIT ?",
                Self::SELECT_COLUMNS
            ),
        };

        retry("sql_pending", &RetryConfig::query(), || async {
            let mut query = sqlx::query(&sql).bind(tenant_id);
            if let Some(user) = user_id {
                query = query.bind(user);
            }
            let rows = query
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            rows.iter().map(Self::row_to_event).collect()
        })
        .await
    }

    async fn failed(&self, tenant_id: &str, limit: usize) -> Result<Vec<SyncEvent>, StorageError> {
        let sql = format!(
            "SELECT {} FROM sync_events \
             WHERE tenant_id = ? AND status = 'failed' \
             ORDER BY id DESC LIMIT ?",
            Self::SELECT_COLUMNS
        );

        retry("sql_failed", &RetryConfig::query(), || async {
            let rows = sqlx::query(&sql)
                .bind(tenant_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            rows.iter().map(Self::row_to_event).collect()
        })
        .await
    }

    async fn retry_failed(&self, tenant_id: &str, limit: usize) -> Result<u64, StorageError> {
        // Two statements: pick the ids first so LIMIT applies portably
        // (MySQL forbids LIMIT inside UPDATE ... IN subqueries).
        let rows = sqlx::query(
            "SELECT id FROM sync_events \
             WHERE tenant_id = ? AND status = 'failed' AND retry_count > 0 \
             ORDER BY id ASC LIMIT ?",
        )
        .bind(tenant_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row
                .try_get("id")
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            ids.push(id);
        }
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders: Vec<&str> = ids.iter().map(|_| "?").collect();
        let sql = format!(
            "UPDATE sync_events SET status = 'pending', retry_count = 0 \
             WHERE status = 'failed' AND id IN ({})",
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for id in &ids {
            query = query.bind(id);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn reset_failed(&self, event_id: i64) -> Result<bool, StorageError> {
        // Conditional UPDATE, same shape as claim: only a 'failed' row moves
        let result = sqlx::query(
            "UPDATE sync_events SET status = 'pending' WHERE id = ? AND status = 'failed'",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get(event_id).await? {
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound),
        }
    }

    async fn completed_since(
        &self,
        tenant_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<SyncEvent>, StorageError> {
        let sql = format!(
            "SELECT {} FROM sync_events \
             WHERE tenant_id = ? AND status = 'completed' AND id > ? \
             ORDER BY id ASC LIMIT ?",
            Self::SELECT_COLUMNS
        );

        retry("sql_completed_since", &RetryConfig::query(), || async {
            let rows = sqlx::query(&sql)
                .bind(tenant_id)
                .bind(after_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            rows.iter().map(Self::row_to_event).collect()
        })
        .await
    }

    async fn count_by_status(
        &self,
        tenant_id: &str,
        status: SyncStatus,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "SELECT COUNT(*) as cnt FROM sync_events WHERE tenant_id = ? AND status = ?",
        )
        .bind(tenant_id)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let count: i64 = result
            .try_get("cnt")
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(count as u64)
    }
}
