//! Storage engine configuration
//!
//! Deserialized from whatever configuration source the host application
//! uses; this crate only defines the shape, validates it, and builds the
//! selected backend from it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use checkpoint_core::{
    CheckpointBackend, CheckpointError, MemoryBackend, MemoryBackendOptions, PayloadFormat,
    Result,
};

use crate::analysis::SnapshotCodec;
use crate::db::connection::StoragePool;
use crate::db::sqlite::SqliteBackend;
use crate::service::ServiceConfig;

/// Which physical store to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    /// SQLite, in-memory or file-backed depending on `database_url`
    Sqlite,
}

fn default_database_url() -> String {
    "sqlite:checkpoints.db".to_string()
}

fn default_pool_size() -> u32 {
    5
}

fn default_acquire_timeout_seconds() -> u64 {
    30
}

fn default_enable_ttl() -> bool {
    true
}

fn default_ttl_seconds() -> u64 {
    24 * 60 * 60
}

fn default_max_per_thread() -> usize {
    50
}

fn default_cleanup_interval_seconds() -> u64 {
    60 * 60
}

fn default_compression_threshold() -> u64 {
    1024
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Connection string for the SQLite backend
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Connection pool size for the SQLite backend
    #[serde(default = "default_pool_size")]
    pub connection_pool_size: u32,

    /// How long an operation waits for a pooled connection before failing
    /// with a retryable storage error
    #[serde(default = "default_acquire_timeout_seconds")]
    pub acquire_timeout_seconds: u64,

    /// Hard cap for the memory backend; unbounded when absent
    #[serde(default)]
    pub max_checkpoints: Option<usize>,

    #[serde(default = "default_enable_ttl")]
    pub enable_ttl: bool,

    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,

    #[serde(default)]
    pub enable_compression: bool,

    /// Only payloads larger than this are worth compressing
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: u64,

    #[serde(default = "default_max_per_thread")]
    pub max_checkpoints_per_thread: usize,

    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            database_url: default_database_url(),
            connection_pool_size: default_pool_size(),
            acquire_timeout_seconds: default_acquire_timeout_seconds(),
            max_checkpoints: None,
            enable_ttl: default_enable_ttl(),
            default_ttl_seconds: default_ttl_seconds(),
            enable_compression: false,
            compression_threshold_bytes: default_compression_threshold(),
            max_checkpoints_per_thread: default_max_per_thread(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connection_pool_size == 0 {
            return Err(CheckpointError::Validation(
                "connection_pool_size must be at least 1".to_string(),
            ));
        }
        if self.acquire_timeout_seconds == 0 {
            return Err(CheckpointError::Validation(
                "acquire_timeout_seconds must be at least 1".to_string(),
            ));
        }
        if self.max_checkpoints == Some(0) {
            return Err(CheckpointError::Validation(
                "max_checkpoints must be at least 1 when set".to_string(),
            ));
        }
        if self.max_checkpoints_per_thread == 0 {
            return Err(CheckpointError::Validation(
                "max_checkpoints_per_thread must be at least 1".to_string(),
            ));
        }
        if self.backend == BackendKind::Sqlite && self.database_url.trim().is_empty() {
            return Err(CheckpointError::Validation(
                "database_url must not be empty for the sqlite backend".to_string(),
            ));
        }
        Ok(())
    }

    /// Service tunables derived from this configuration. The TTL is
    /// rounded down to whole hours, with a one hour floor.
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            expiration_hours: (self.default_ttl_seconds as i64 / 3600).max(1),
            max_checkpoints_per_thread: self.max_checkpoints_per_thread,
            cleanup_interval_seconds: self.cleanup_interval_seconds,
            ..ServiceConfig::default()
        }
    }

    /// Snapshot codec honoring the compression settings.
    pub fn snapshot_codec(&self) -> SnapshotCodec {
        if self.enable_compression {
            SnapshotCodec::with_compression(PayloadFormat::Json, self.compression_threshold_bytes)
        } else {
            SnapshotCodec::new(PayloadFormat::Json)
        }
    }

    /// Build the configured backend, connected and ready for use.
    pub async fn build_backend(&self) -> Result<Arc<dyn CheckpointBackend>> {
        self.validate()?;
        match self.backend {
            BackendKind::Memory => {
                info!(max_checkpoints = ?self.max_checkpoints, "building memory backend");
                Ok(Arc::new(MemoryBackend::with_options(MemoryBackendOptions {
                    max_checkpoints: self.max_checkpoints,
                    enable_ttl: self.enable_ttl,
                })))
            }
            BackendKind::Sqlite => {
                info!(database_url = %self.database_url, "building sqlite backend");
                let pool = StoragePool::with_options(
                    &self.database_url,
                    self.connection_pool_size,
                    Duration::from_secs(self.acquire_timeout_seconds),
                )
                .await
                .map_err(|e| {
                    CheckpointError::storage("open", e.to_string())
                })?;
                let mut backend = SqliteBackend::with_pool(pool).await?;
                backend.set_enable_ttl(self.enable_ttl);
                Ok(Arc::new(backend))
            }
        }
    }
}
