//! Database connection management
//!
//! Provides connection pooling, health checks, and pool statistics for the
//! SQLite backend. The pool is a bounded resource: acquisition waits until a
//! connection frees up or the configured timeout elapses.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Type alias for the database connection pool
pub type StoragePoolInner = SqlitePool;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection pool statistics
#[derive(Debug, Clone)]
pub struct PoolStatistics {
    /// Number of currently idle connections
    pub idle_connections: u32,

    /// Number of currently active connections
    pub active_connections: u32,

    /// Maximum allowed connections
    pub max_connections: u32,

    /// Timestamp of the statistics collection (Unix timestamp in seconds)
    pub collected_at: u64,
}

/// Pooled SQLite connection wrapper
#[derive(Clone)]
pub struct StoragePool {
    pool: Arc<StoragePoolInner>,
    max_connections: u32,
}

impl StoragePool {
    /// Open a pool from a connection string
    ///
    /// # Arguments
    /// * `database_url` - SQLite connection string (e.g., "sqlite:checkpoints.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::with_max_connections(database_url, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Open a pool with a custom size
    pub async fn with_max_connections(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, sqlx::Error> {
        Self::with_options(database_url, max_connections, DEFAULT_ACQUIRE_TIMEOUT).await
    }

    /// Open a pool with explicit size and acquisition timeout
    pub async fn with_options(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool: Arc::new(pool),
            max_connections,
        })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &StoragePoolInner {
        &self.pool
    }

    /// Perform a health check by running a simple query
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").fetch_one(self.pool.as_ref()).await?;

        Ok(())
    }

    /// Get connection pool statistics
    pub fn statistics(&self) -> PoolStatistics {
        let pool_ref = self.pool.as_ref();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let idle = pool_ref.num_idle() as u32;
        let total = pool_ref.size();

        PoolStatistics {
            idle_connections: idle,
            active_connections: total.saturating_sub(idle),
            max_connections: self.max_connections,
            collected_at: now,
        }
    }

    /// True while the pool still has headroom for another acquisition
    pub fn is_healthy(&self) -> bool {
        let stats = self.statistics();
        stats.active_connections < stats.max_connections
    }

    /// Close the connection pool gracefully
    ///
    /// After this is called, the pool cannot be used anymore.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// True once `close` has completed
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_pool() {
        let pool = StoragePool::new("sqlite::memory:").await.unwrap();

        assert!(pool.pool().acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_health_check_success() {
        let pool = StoragePool::new("sqlite::memory:").await.unwrap();

        assert!(pool.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_statistics() {
        let pool = StoragePool::new("sqlite::memory:").await.unwrap();

        let stats = pool.statistics();
        assert_eq!(stats.max_connections, 5);
        assert!(stats.collected_at > 0);
    }

    #[tokio::test]
    async fn test_custom_max_connections() {
        let pool = StoragePool::with_max_connections("sqlite::memory:", 10)
            .await
            .unwrap();

        assert_eq!(pool.statistics().max_connections, 10);
    }

    #[tokio::test]
    async fn test_is_healthy() {
        let pool = StoragePool::new("sqlite::memory:").await.unwrap();

        assert!(pool.is_healthy());
    }

    #[tokio::test]
    async fn test_close_pool() {
        let pool = StoragePool::new("sqlite::memory:").await.unwrap();

        pool.close().await;
        assert!(pool.is_closed());
    }
}
