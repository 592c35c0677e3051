//! SQLite schema for checkpoint storage
//!
//! The backend owns its schema and applies it idempotently on connect.
//! Timestamps are stored as REAL Unix seconds. `checkpoint_storage` rows are
//! unique per `(thread_id, checkpoint_ns, checkpoint_id)`; checkpoint ids are
//! additionally unique on their own, which lets `checkpoint_writes` reference
//! them directly with cascading deletes.

use sqlx::sqlite::SqlitePool;

const CREATE_CHECKPOINT_STORAGE: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoint_storage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id TEXT NOT NULL,
    checkpoint_ns TEXT NOT NULL DEFAULT '',
    checkpoint_id TEXT NOT NULL,
    checkpoint_data TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    channel_values TEXT NOT NULL DEFAULT '{}',
    channel_versions TEXT NOT NULL DEFAULT '{}',
    versions_seen TEXT NOT NULL DEFAULT '{}',
    created_at REAL NOT NULL,
    updated_at REAL NOT NULL,
    UNIQUE(thread_id, checkpoint_ns, checkpoint_id)
)
"#;

const CREATE_CHECKPOINT_WRITES: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoint_writes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    checkpoint_id TEXT NOT NULL
        REFERENCES checkpoint_storage(checkpoint_id) ON DELETE CASCADE,
    task_id TEXT NOT NULL,
    task_path TEXT NOT NULL DEFAULT '',
    channel_name TEXT NOT NULL,
    channel_value TEXT NOT NULL,
    created_at REAL NOT NULL
)
"#;

const CREATE_THREAD_CHECKPOINTS: &str = r#"
CREATE TABLE IF NOT EXISTS thread_checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id TEXT NOT NULL,
    checkpoint_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    created_at REAL NOT NULL,
    updated_at REAL NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
)
"#;

const CREATE_INDEXES: &[&str] = &[
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_storage_checkpoint_id
         ON checkpoint_storage(checkpoint_id)",
    "CREATE INDEX IF NOT EXISTS idx_storage_thread
         ON checkpoint_storage(thread_id, checkpoint_ns)",
    "CREATE INDEX IF NOT EXISTS idx_storage_created_at
         ON checkpoint_storage(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_writes_checkpoint
         ON checkpoint_writes(checkpoint_id)",
    "CREATE INDEX IF NOT EXISTS idx_thread_checkpoints_thread
         ON thread_checkpoints(thread_id)",
];

/// Apply the schema. Safe to call repeatedly.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_CHECKPOINT_STORAGE).execute(pool).await?;
    sqlx::query(CREATE_CHECKPOINT_WRITES).execute(pool).await?;
    sqlx::query(CREATE_THREAD_CHECKPOINTS).execute(pool).await?;
    for index in CREATE_INDEXES {
        sqlx::query(index).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::StoragePool;

    #[tokio::test]
    async fn test_init_schema_is_idempotent() {
        let pool = StoragePool::new("sqlite::memory:").await.unwrap();
        init_schema(pool.pool()).await.unwrap();
        init_schema(pool.pool()).await.unwrap();

        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('checkpoint_storage', 'checkpoint_writes', 'thread_checkpoints')",
        )
        .fetch_one(pool.pool())
        .await
        .unwrap();
        assert_eq!(count.0, 3);
    }
}
