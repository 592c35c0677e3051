//! Durable checkpoint storage and lifecycle management
//!
//! Builds on `checkpoint-core` with:
//!
//! - **SQLite backend** ([`db::SqliteBackend`]): pooled, WAL-mode, schema
//!   owned by the backend
//! - **Repository** ([`CheckpointRepository`]): thread index and derived
//!   queries over any backend
//! - **Domain service** ([`CheckpointService`]): validation, restore and
//!   archive lifecycle, backup chains, retention sweeps
//! - **Analysis** ([`analysis`]): compression, integrity hashing, state
//!   diffing, usage patterns and health scoring
//! - **Optimizer** ([`OptimizedRepository`]): read-through caching and
//!   batched writes
//! - **Configuration** ([`StorageConfig`]): backend selection and tuning

pub mod analysis;
pub mod config;
pub mod db;
pub mod optimizer;
pub mod repository;
pub mod service;

pub use config::{BackendKind, StorageConfig};
pub use db::{SqliteBackend, StoragePool};
pub use optimizer::{BatchItemOutcome, BatchReport, CacheMetrics, OptimizedRepository, OptimizerConfig};
pub use repository::CheckpointRepository;
pub use service::{CheckpointService, MaintenanceReport, ServiceConfig, SweepReport};
