//! SQLite checkpoint backend
//!
//! Durable implementation of [`CheckpointBackend`] on top of a pooled SQLite
//! connection. The full domain checkpoint is persisted as JSON in
//! `checkpoint_data`; the remaining columns mirror the fields external
//! consumers query directly. `put` and `put_writes` each run inside a single
//! transaction. Expired checkpoints are purged lazily by the read that
//! discovers them.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, warn};

use checkpoint_core::{
    apply_list_pipeline, Before, ChannelVersions, Checkpoint, CheckpointBackend, CheckpointError,
    Result, Selector, WriteRecord,
};

use crate::db::connection::StoragePool;
use crate::db::schema::init_schema;

/// Pooled SQLite implementation of the storage contract
#[derive(Clone)]
pub struct SqliteBackend {
    pool: StoragePool,
    enable_ttl: bool,
}

fn to_unix_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

fn from_unix_seconds(secs: f64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt((secs * 1000.0) as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

fn map_sqlx(operation: &'static str, err: sqlx::Error) -> CheckpointError {
    match err {
        sqlx::Error::PoolTimedOut => CheckpointError::storage_retryable(
            operation,
            "connection pool acquisition timed out".to_string(),
        ),
        sqlx::Error::PoolClosed => {
            CheckpointError::Connection("connection pool is closed".to_string())
        }
        other => CheckpointError::storage(operation, other.to_string()),
    }
}

fn decode_row(operation: &'static str, row: &SqliteRow) -> Result<Checkpoint> {
    let data: String = row
        .try_get("checkpoint_data")
        .map_err(|e| map_sqlx(operation, e))?;
    serde_json::from_str(&data).map_err(CheckpointError::from)
}

impl SqliteBackend {
    /// Open a backend against `database_url`, applying the schema.
    pub async fn open(database_url: &str) -> Result<Self> {
        Self::open_with_pool_size(database_url, 5).await
    }

    /// Open with a custom pool size. TTL purging is on by default.
    pub async fn open_with_pool_size(database_url: &str, pool_size: u32) -> Result<Self> {
        let pool = StoragePool::with_max_connections(database_url, pool_size)
            .await
            .map_err(|e| map_sqlx("open", e))?;
        Self::with_pool(pool).await
    }

    /// Wrap an already-configured pool, applying the schema.
    pub async fn with_pool(pool: StoragePool) -> Result<Self> {
        let backend = Self {
            pool,
            enable_ttl: true,
        };
        backend.connect().await?;
        Ok(backend)
    }

    /// In-memory database for tests. Uses a single connection because each
    /// SQLite `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        Self::open_with_pool_size("sqlite::memory:", 1).await
    }

    pub fn set_enable_ttl(&mut self, enable_ttl: bool) {
        self.enable_ttl = enable_ttl;
    }

    /// Access to the underlying pool for health checks and statistics.
    pub fn pool(&self) -> &StoragePool {
        &self.pool
    }

    async fn delete_by_id(&self, checkpoint_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM checkpoint_storage WHERE checkpoint_id = ?")
            .bind(checkpoint_id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| map_sqlx("delete", e))?;
        sqlx::query("DELETE FROM thread_checkpoints WHERE checkpoint_id = ?")
            .bind(checkpoint_id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| map_sqlx("delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop expired checkpoints from a fetched batch, deleting their rows.
    async fn purge_expired(&self, checkpoints: Vec<Checkpoint>) -> Result<Vec<Checkpoint>> {
        if !self.enable_ttl {
            return Ok(checkpoints);
        }
        let mut alive = Vec::with_capacity(checkpoints.len());
        for checkpoint in checkpoints {
            if checkpoint.is_expired() {
                debug!(checkpoint_id = %checkpoint.id, "purging expired checkpoint on access");
                self.delete_by_id(&checkpoint.id).await?;
            } else {
                alive.push(checkpoint);
            }
        }
        Ok(alive)
    }
}

#[async_trait]
impl CheckpointBackend for SqliteBackend {
    async fn connect(&self) -> Result<()> {
        init_schema(self.pool.pool())
            .await
            .map_err(|e| map_sqlx("connect", e))
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn get(&self, selector: &Selector) -> Result<Option<Checkpoint>> {
        let rows = match &selector.checkpoint_id {
            Some(id) => sqlx::query(
                "SELECT checkpoint_data FROM checkpoint_storage
                     WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?",
            )
            .bind(&selector.thread_id)
            .bind(&selector.namespace)
            .bind(id)
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| map_sqlx("get", e))?,
            None => sqlx::query(
                "SELECT checkpoint_data FROM checkpoint_storage
                     WHERE thread_id = ? AND checkpoint_ns = ?
                     ORDER BY created_at DESC",
            )
            .bind(&selector.thread_id)
            .bind(&selector.namespace)
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| map_sqlx("get", e))?,
        };

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in &rows {
            checkpoints.push(decode_row("get", row)?);
        }
        let mut alive = self.purge_expired(checkpoints).await?;
        if alive.is_empty() {
            return Ok(None);
        }
        Ok(Some(alive.remove(0)))
    }

    async fn list(
        &self,
        selector: Option<&Selector>,
        filter: Option<&HashMap<String, serde_json::Value>>,
        before: Option<&Before>,
        limit: Option<usize>,
    ) -> Result<Vec<Checkpoint>> {
        let rows = match selector {
            Some(sel) => {
                // Escape the escape character first so namespace backslashes
                // survive the wildcard escaping below.
                let prefix = format!(
                    "{}%",
                    sel.namespace
                        .replace('\\', "\\\\")
                        .replace('%', "\\%")
                        .replace('_', "\\_")
                );
                sqlx::query(
                    "SELECT checkpoint_data FROM checkpoint_storage
                         WHERE thread_id = ? AND checkpoint_ns LIKE ? ESCAPE '\\'
                         ORDER BY created_at DESC",
                )
                .bind(&sel.thread_id)
                .bind(prefix)
                .fetch_all(self.pool.pool())
                .await
                .map_err(|e| map_sqlx("list", e))?
            }
            None => sqlx::query(
                "SELECT checkpoint_data FROM checkpoint_storage ORDER BY created_at DESC",
            )
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| map_sqlx("list", e))?,
        };

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in &rows {
            checkpoints.push(decode_row("list", row)?);
        }
        let alive = self.purge_expired(checkpoints).await?;

        Ok(apply_list_pipeline(alive, filter, before, limit))
    }

    async fn put(
        &self,
        selector: &Selector,
        mut checkpoint: Checkpoint,
        versions: ChannelVersions,
    ) -> Result<Selector> {
        checkpoint.thread_id = selector.thread_id.clone();
        checkpoint.namespace = selector.namespace.clone();
        if let Some(id) = &selector.checkpoint_id {
            checkpoint.id = id.clone();
        }

        let checkpoint_data = serde_json::to_string(&checkpoint)?;
        let channel_values = serde_json::to_string(&checkpoint.state_data)?;
        let metadata = serde_json::to_string(&checkpoint.metadata)?;
        let channel_versions = serde_json::to_string(&versions)?;
        let created_at = to_unix_seconds(checkpoint.created_at);
        let updated_at = to_unix_seconds(checkpoint.updated_at);

        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx("put", e))?;

        sqlx::query(
            "INSERT INTO checkpoint_storage
                 (thread_id, checkpoint_ns, checkpoint_id, checkpoint_data, metadata,
                  channel_values, channel_versions, versions_seen, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, '{}', ?, ?)
                 ON CONFLICT(thread_id, checkpoint_ns, checkpoint_id) DO UPDATE SET
                     checkpoint_data = excluded.checkpoint_data,
                     metadata = excluded.metadata,
                     channel_values = excluded.channel_values,
                     channel_versions = excluded.channel_versions,
                     updated_at = excluded.updated_at",
        )
        .bind(&checkpoint.thread_id)
        .bind(&checkpoint.namespace)
        .bind(&checkpoint.id)
        .bind(&checkpoint_data)
        .bind(&metadata)
        .bind(&channel_values)
        .bind(&channel_versions)
        .bind(created_at)
        .bind(updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx("put", e))?;

        sqlx::query("DELETE FROM thread_checkpoints WHERE checkpoint_id = ?")
            .bind(&checkpoint.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx("put", e))?;
        sqlx::query(
            "INSERT INTO thread_checkpoints
                 (thread_id, checkpoint_id, status, created_at, updated_at, metadata)
                 VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.thread_id)
        .bind(&checkpoint.id)
        .bind(checkpoint.status.as_str())
        .bind(created_at)
        .bind(updated_at)
        .bind(&metadata)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx("put", e))?;

        tx.commit().await.map_err(|e| map_sqlx("put", e))?;

        Ok(Selector {
            thread_id: checkpoint.thread_id,
            namespace: checkpoint.namespace,
            checkpoint_id: Some(checkpoint.id),
        })
    }

    async fn put_writes(
        &self,
        selector: &Selector,
        writes: Vec<(String, serde_json::Value)>,
        task_id: &str,
        task_path: &str,
    ) -> Result<()> {
        let checkpoint_id = selector.checkpoint_id.as_ref().ok_or_else(|| {
            CheckpointError::Validation("put_writes requires a checkpoint_id".to_string())
        })?;

        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx("put_writes", e))?;

        let exists = sqlx::query(
            "SELECT 1 FROM checkpoint_storage
                 WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?",
        )
        .bind(&selector.thread_id)
        .bind(&selector.namespace)
        .bind(checkpoint_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx("put_writes", e))?;
        if exists.is_none() {
            return Err(CheckpointError::not_found(format!(
                "checkpoint {} in thread {}",
                checkpoint_id, selector.thread_id
            )));
        }

        let now = to_unix_seconds(Utc::now());
        for (channel, value) in &writes {
            sqlx::query(
                "INSERT INTO checkpoint_writes
                     (checkpoint_id, task_id, task_path, channel_name, channel_value, created_at)
                     VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(checkpoint_id)
            .bind(task_id)
            .bind(task_path)
            .bind(channel)
            .bind(serde_json::to_string(value)?)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx("put_writes", e))?;
        }

        tx.commit().await.map_err(|e| map_sqlx("put_writes", e))
    }

    async fn get_writes(&self, selector: &Selector) -> Result<Vec<WriteRecord>> {
        let checkpoint_id = selector.checkpoint_id.as_ref().ok_or_else(|| {
            CheckpointError::Validation("get_writes requires a checkpoint_id".to_string())
        })?;

        let rows = sqlx::query(
            "SELECT checkpoint_id, task_id, task_path, channel_name, channel_value, created_at
                 FROM checkpoint_writes WHERE checkpoint_id = ? ORDER BY id",
        )
        .bind(checkpoint_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| map_sqlx("get_writes", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let value: String = row
                .try_get("channel_value")
                .map_err(|e| map_sqlx("get_writes", e))?;
            let created_at: f64 = row
                .try_get("created_at")
                .map_err(|e| map_sqlx("get_writes", e))?;
            records.push(WriteRecord {
                checkpoint_id: row
                    .try_get("checkpoint_id")
                    .map_err(|e| map_sqlx("get_writes", e))?,
                task_id: row
                    .try_get("task_id")
                    .map_err(|e| map_sqlx("get_writes", e))?,
                task_path: row
                    .try_get("task_path")
                    .map_err(|e| map_sqlx("get_writes", e))?,
                channel: row
                    .try_get("channel_name")
                    .map_err(|e| map_sqlx("get_writes", e))?,
                value: serde_json::from_str(&value)?,
                created_at: from_unix_seconds(created_at),
            });
        }
        Ok(records)
    }

    async fn delete(&self, selector: &Selector) -> Result<bool> {
        let checkpoint_id = selector.checkpoint_id.as_ref().ok_or_else(|| {
            CheckpointError::Validation("delete requires a checkpoint_id".to_string())
        })?;

        let result = sqlx::query(
            "DELETE FROM checkpoint_storage
                 WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?",
        )
        .bind(&selector.thread_id)
        .bind(&selector.namespace)
        .bind(checkpoint_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| map_sqlx("delete", e))?;

        if result.rows_affected() > 0 {
            sqlx::query("DELETE FROM thread_checkpoints WHERE checkpoint_id = ?")
                .bind(checkpoint_id)
                .execute(self.pool.pool())
                .await
                .map_err(|e| map_sqlx("delete", e))?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM checkpoint_storage WHERE thread_id = ?")
            .bind(thread_id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| map_sqlx("delete_thread", e))?;
        sqlx::query("DELETE FROM thread_checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| map_sqlx("delete_thread", e))?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            debug!(thread_id = %thread_id, deleted, "deleted thread checkpoints");
        } else {
            warn!(thread_id = %thread_id, "delete_thread matched no checkpoints");
        }
        Ok(deleted)
    }
}
