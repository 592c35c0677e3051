//! Storage contract implemented by every checkpoint backend
//!
//! [`CheckpointBackend`] is the single abstraction the repository, domain
//! service and protocol adapter are written against. The in-memory backend
//! in this crate and the SQLite backend in `checkpoint-store` implement it
//! identically; backend selection is a configuration concern.
//!
//! All operations are async and safe for concurrent callers. Implementations
//! must be `Send + Sync` and must never expose a torn or partial write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::Result;
use crate::model::{ChannelVersions, Checkpoint, Selector, WriteRecord};

/// Pagination bound for [`CheckpointBackend::list`]
///
/// The two forms are mutually exclusive by construction: `Count(n)` skips
/// the `n` most recent items (an item-count cursor), `Timestamp(t)` keeps
/// only items with `created_at < t`.
#[derive(Debug, Clone, PartialEq)]
pub enum Before {
    Count(usize),
    Timestamp(DateTime<Utc>),
}

/// Storage backend contract
///
/// # Semantics
///
/// - `get` with a `checkpoint_id` returns that exact checkpoint; without one
///   it returns the checkpoint with the greatest `created_at` among all
///   matching `(thread_id, namespace)`. When TTL handling is enabled, an
///   expired checkpoint is purged as a side effect of the read that
///   discovered it, and `None` is returned.
/// - `list` orders by `created_at` descending and applies, in order: the
///   selector scope, the metadata filter (exact key equality, AND-combined),
///   the `before` bound, and the limit.
/// - `put` generates a unique checkpoint id when the selector carries none
///   and upserts under `(thread_id, namespace, checkpoint_id)`.
/// - `put_writes` requires the selector's checkpoint to already exist.
/// - `connect`/`disconnect` are idempotent; `disconnect` releases all
///   backend resources and subsequent operations fail with
///   [`CheckpointError::Connection`](crate::error::CheckpointError::Connection).
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    /// Idempotent lifecycle hook; prepares the backend for use.
    async fn connect(&self) -> Result<()>;

    /// Idempotent lifecycle hook; releases pool/state.
    async fn disconnect(&self) -> Result<()>;

    /// Fetch a checkpoint by exact id, or the latest for the selector scope.
    async fn get(&self, selector: &Selector) -> Result<Option<Checkpoint>>;

    /// Query checkpoints, newest first.
    ///
    /// A `None` selector scans all threads (used by retention sweeps).
    async fn list(
        &self,
        selector: Option<&Selector>,
        filter: Option<&HashMap<String, serde_json::Value>>,
        before: Option<&Before>,
        limit: Option<usize>,
    ) -> Result<Vec<Checkpoint>>;

    /// Upsert a checkpoint; returns the selector with `checkpoint_id` filled.
    async fn put(
        &self,
        selector: &Selector,
        checkpoint: Checkpoint,
        versions: ChannelVersions,
    ) -> Result<Selector>;

    /// Append one write record per `(channel, value)` tuple.
    async fn put_writes(
        &self,
        selector: &Selector,
        writes: Vec<(String, serde_json::Value)>,
        task_id: &str,
        task_path: &str,
    ) -> Result<()>;

    /// Writes attached to the selector's checkpoint, in append order.
    async fn get_writes(&self, selector: &Selector) -> Result<Vec<WriteRecord>>;

    /// Remove a checkpoint and its writes. `Ok(false)` when nothing matched;
    /// sweeps treat that as success.
    async fn delete(&self, selector: &Selector) -> Result<bool>;

    /// Remove every checkpoint and write for a thread; returns the count.
    async fn delete_thread(&self, thread_id: &str) -> Result<u64>;
}

/// Apply the shared `filter`/`before`/`limit` pipeline to already-scoped,
/// newest-first checkpoints. Backends reuse this so the two implementations
/// cannot drift.
pub fn apply_list_pipeline(
    mut checkpoints: Vec<Checkpoint>,
    filter: Option<&HashMap<String, serde_json::Value>>,
    before: Option<&Before>,
    limit: Option<usize>,
) -> Vec<Checkpoint> {
    checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    if let Some(filter) = filter {
        checkpoints.retain(|cp| {
            filter
                .iter()
                .all(|(key, value)| cp.metadata.get(key) == Some(value))
        });
    }

    match before {
        Some(Before::Count(n)) => {
            checkpoints = checkpoints.into_iter().skip(*n).collect();
        }
        Some(Before::Timestamp(t)) => {
            checkpoints.retain(|cp| cp.created_at < *t);
        }
        None => {}
    }

    if let Some(limit) = limit {
        checkpoints.truncate(limit);
    }

    checkpoints
}
