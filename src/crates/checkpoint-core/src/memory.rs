//! In-memory checkpoint backend
//!
//! Reference implementation of [`CheckpointBackend`] for development,
//! testing and single-process deployments. All state lives behind one
//! `tokio::sync::RwLock`, so concurrent callers never observe a torn write;
//! everything is lost on drop or [`disconnect`](CheckpointBackend::disconnect).
//!
//! Two knobs distinguish it from the SQL backend: an optional hard capacity
//! (`max_checkpoints`) enforced by evicting the single oldest-by-`created_at`
//! entry on write, and lazy TTL purging performed by the read that discovers
//! a checkpoint expired.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::backend::{apply_list_pipeline, Before, CheckpointBackend};
use crate::error::{CheckpointError, Result};
use crate::model::{ChannelVersions, Checkpoint, CheckpointId, Selector, WriteRecord};

/// Tuning for [`MemoryBackend`]
#[derive(Debug, Clone)]
pub struct MemoryBackendOptions {
    /// Hard cap on stored checkpoints; `None` means unbounded
    pub max_checkpoints: Option<usize>,
    /// When false, expired checkpoints are kept and served
    pub enable_ttl: bool,
}

impl Default for MemoryBackendOptions {
    fn default() -> Self {
        Self {
            max_checkpoints: None,
            enable_ttl: true,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    checkpoint: Checkpoint,
    #[allow(dead_code)]
    versions: ChannelVersions,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Composite storage key -> record
    records: HashMap<String, StoredRecord>,
    /// thread_id -> storage keys, most recently written first
    by_thread: HashMap<String, Vec<String>>,
    /// checkpoint_id -> append-only write records
    writes: HashMap<CheckpointId, Vec<WriteRecord>>,
    disconnected: bool,
}

impl MemoryState {
    fn remove_key(&mut self, key: &str) -> Option<StoredRecord> {
        let record = self.records.remove(key)?;
        if let Some(keys) = self.by_thread.get_mut(&record.checkpoint.thread_id) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.by_thread.remove(&record.checkpoint.thread_id);
            }
        }
        self.writes.remove(&record.checkpoint.id);
        Some(record)
    }
}

/// Thread-safe in-memory checkpoint storage
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryState>>,
    options: MemoryBackendOptions,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_options(MemoryBackendOptions::default())
    }

    pub fn with_options(options: MemoryBackendOptions) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            options,
        }
    }

    /// Total checkpoints currently stored
    pub async fn checkpoint_count(&self) -> usize {
        self.state.read().await.records.len()
    }

    /// Distinct threads currently tracked
    pub async fn thread_count(&self) -> usize {
        self.state.read().await.by_thread.len()
    }

    /// Drop all state (useful for test isolation)
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.records.clear();
        state.by_thread.clear();
        state.writes.clear();
    }

    fn key_for(checkpoint: &Checkpoint) -> String {
        format!(
            "{}\u{1}{}\u{1}{}",
            checkpoint.thread_id, checkpoint.namespace, checkpoint.id
        )
    }

    fn ensure_connected(state: &MemoryState) -> Result<()> {
        if state.disconnected {
            return Err(CheckpointError::Connection(
                "memory backend is disconnected".to_string(),
            ));
        }
        Ok(())
    }

    /// Purge expired records among `keys`; returns the surviving keys.
    fn purge_expired(state: &mut MemoryState, keys: Vec<String>, enable_ttl: bool) -> Vec<String> {
        if !enable_ttl {
            return keys;
        }
        let mut alive = Vec::with_capacity(keys.len());
        for key in keys {
            let expired = state
                .records
                .get(&key)
                .map(|r| r.checkpoint.is_expired())
                .unwrap_or(false);
            if expired {
                debug!(key = %key, "purging expired checkpoint on access");
                state.remove_key(&key);
            } else {
                alive.push(key);
            }
        }
        alive
    }

    /// Evict the single globally oldest entry by `created_at`.
    fn evict_oldest(state: &mut MemoryState) {
        let oldest = state
            .records
            .iter()
            .min_by_key(|(_, r)| r.checkpoint.created_at)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            debug!(key = %key, "capacity reached, evicting oldest checkpoint");
            state.remove_key(&key);
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointBackend for MemoryBackend {
    async fn connect(&self) -> Result<()> {
        self.state.write().await.disconnected = false;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.records.clear();
        state.by_thread.clear();
        state.writes.clear();
        state.disconnected = true;
        Ok(())
    }

    async fn get(&self, selector: &Selector) -> Result<Option<Checkpoint>> {
        let mut state = self.state.write().await;
        Self::ensure_connected(&state)?;

        if let Some(key) = selector.storage_key() {
            let alive = Self::purge_expired(&mut state, vec![key], self.options.enable_ttl);
            return Ok(alive
                .first()
                .and_then(|k| state.records.get(k))
                .map(|r| r.checkpoint.clone()));
        }

        // Latest for (thread_id, namespace)
        let matching: Vec<String> = state
            .by_thread
            .get(&selector.thread_id)
            .map(|keys| {
                keys.iter()
                    .filter(|k| {
                        state
                            .records
                            .get(*k)
                            .map(|r| r.checkpoint.namespace == selector.namespace)
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let alive = Self::purge_expired(&mut state, matching, self.options.enable_ttl);
        let latest = alive
            .iter()
            .filter_map(|k| state.records.get(k))
            .max_by_key(|r| r.checkpoint.created_at)
            .map(|r| r.checkpoint.clone());
        Ok(latest)
    }

    async fn list(
        &self,
        selector: Option<&Selector>,
        filter: Option<&HashMap<String, serde_json::Value>>,
        before: Option<&Before>,
        limit: Option<usize>,
    ) -> Result<Vec<Checkpoint>> {
        let mut state = self.state.write().await;
        Self::ensure_connected(&state)?;

        let scoped: Vec<String> = state
            .records
            .iter()
            .filter(|(_, r)| match selector {
                Some(sel) => {
                    r.checkpoint.thread_id == sel.thread_id
                        && r.checkpoint.namespace.starts_with(&sel.namespace)
                }
                None => true,
            })
            .map(|(k, _)| k.clone())
            .collect();

        let alive = Self::purge_expired(&mut state, scoped, self.options.enable_ttl);
        let checkpoints: Vec<Checkpoint> = alive
            .iter()
            .filter_map(|k| state.records.get(k))
            .map(|r| r.checkpoint.clone())
            .collect();

        Ok(apply_list_pipeline(checkpoints, filter, before, limit))
    }

    async fn put(
        &self,
        selector: &Selector,
        mut checkpoint: Checkpoint,
        versions: ChannelVersions,
    ) -> Result<Selector> {
        let mut state = self.state.write().await;
        Self::ensure_connected(&state)?;

        checkpoint.thread_id = selector.thread_id.clone();
        checkpoint.namespace = selector.namespace.clone();
        if let Some(id) = &selector.checkpoint_id {
            checkpoint.id = id.clone();
        }

        let key = Self::key_for(&checkpoint);
        let is_new = !state.records.contains_key(&key);

        if is_new {
            if let Some(cap) = self.options.max_checkpoints {
                if state.records.len() >= cap {
                    Self::evict_oldest(&mut state);
                }
            }
        }

        let result = Selector {
            thread_id: checkpoint.thread_id.clone(),
            namespace: checkpoint.namespace.clone(),
            checkpoint_id: Some(checkpoint.id.clone()),
        };

        let thread_id = checkpoint.thread_id.clone();
        state.records.insert(key.clone(), StoredRecord { checkpoint, versions });
        let keys = state.by_thread.entry(thread_id).or_default();
        keys.retain(|k| k != &key);
        keys.insert(0, key);

        Ok(result)
    }

    async fn put_writes(
        &self,
        selector: &Selector,
        writes: Vec<(String, serde_json::Value)>,
        task_id: &str,
        task_path: &str,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        Self::ensure_connected(&state)?;

        let key = selector.storage_key().ok_or_else(|| {
            CheckpointError::Validation("put_writes requires a checkpoint_id".to_string())
        })?;
        let checkpoint_id = match state.records.get(&key) {
            Some(record) => record.checkpoint.id.clone(),
            None => {
                return Err(CheckpointError::not_found(format!(
                    "checkpoint {} in thread {}",
                    selector.checkpoint_id.as_deref().unwrap_or(""),
                    selector.thread_id
                )))
            }
        };

        let now = chrono::Utc::now();
        let records = state.writes.entry(checkpoint_id.clone()).or_default();
        for (channel, value) in writes {
            records.push(WriteRecord {
                checkpoint_id: checkpoint_id.clone(),
                task_id: task_id.to_string(),
                task_path: task_path.to_string(),
                channel,
                value,
                created_at: now,
            });
        }
        Ok(())
    }

    async fn get_writes(&self, selector: &Selector) -> Result<Vec<WriteRecord>> {
        let state = self.state.read().await;
        Self::ensure_connected(&state)?;

        let id = selector.checkpoint_id.as_ref().ok_or_else(|| {
            CheckpointError::Validation("get_writes requires a checkpoint_id".to_string())
        })?;
        Ok(state.writes.get(id).cloned().unwrap_or_default())
    }

    async fn delete(&self, selector: &Selector) -> Result<bool> {
        let mut state = self.state.write().await;
        Self::ensure_connected(&state)?;

        match selector.storage_key() {
            Some(key) => Ok(state.remove_key(&key).is_some()),
            None => Err(CheckpointError::Validation(
                "delete requires a checkpoint_id".to_string(),
            )),
        }
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<u64> {
        let mut state = self.state.write().await;
        Self::ensure_connected(&state)?;

        let keys: Vec<String> = state
            .by_thread
            .get(thread_id)
            .cloned()
            .unwrap_or_default();
        let count = keys.len() as u64;
        for key in keys {
            state.remove_key(&key);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CheckpointType;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn checkpoint(thread: &str, ns: &str) -> Checkpoint {
        let mut state = HashMap::new();
        state.insert("x".to_string(), json!(1));
        Checkpoint::new(thread, ns, CheckpointType::Auto, state)
    }

    #[tokio::test]
    async fn test_put_then_get_latest_round_trip() {
        let backend = MemoryBackend::new();
        let saved = backend
            .put(&Selector::new("t1"), checkpoint("t1", ""), HashMap::new())
            .await
            .unwrap();
        assert!(saved.checkpoint_id.is_some());

        let loaded = backend.get(&Selector::new("t1")).await.unwrap().unwrap();
        assert_eq!(Some(loaded.id), saved.checkpoint_id);
        assert_eq!(loaded.state_data.get("x"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_generated_ids_are_distinct() {
        let backend = MemoryBackend::new();
        let a = backend
            .put(&Selector::new("t1"), checkpoint("t1", ""), HashMap::new())
            .await
            .unwrap();
        let b = backend
            .put(&Selector::new("t1"), checkpoint("t1", ""), HashMap::new())
            .await
            .unwrap();
        assert_ne!(a.checkpoint_id, b.checkpoint_id);
        assert_eq!(backend.checkpoint_count().await, 2);
    }

    #[tokio::test]
    async fn test_expired_checkpoint_is_purged_on_get() {
        let backend = MemoryBackend::new();
        let mut cp = checkpoint("t1", "");
        cp.expires_at = Some(Utc::now() - Duration::seconds(1));
        backend
            .put(&Selector::new("t1"), cp, HashMap::new())
            .await
            .unwrap();

        assert!(backend.get(&Selector::new("t1")).await.unwrap().is_none());
        // The read that discovered expiry removed the record.
        assert_eq!(backend.checkpoint_count().await, 0);
    }

    #[tokio::test]
    async fn test_ttl_disabled_serves_expired() {
        let backend = MemoryBackend::with_options(MemoryBackendOptions {
            max_checkpoints: None,
            enable_ttl: false,
        });
        let mut cp = checkpoint("t1", "");
        cp.expires_at = Some(Utc::now() - Duration::seconds(1));
        backend
            .put(&Selector::new("t1"), cp, HashMap::new())
            .await
            .unwrap();
        assert!(backend.get(&Selector::new("t1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_capacity_evicts_single_oldest() {
        let backend = MemoryBackend::with_options(MemoryBackendOptions {
            max_checkpoints: Some(2),
            enable_ttl: true,
        });

        let mut oldest = checkpoint("t1", "");
        oldest.created_at = Utc::now() - Duration::hours(2);
        let oldest_id = oldest.id.clone();
        let mut middle = checkpoint("t1", "");
        middle.created_at = Utc::now() - Duration::hours(1);
        let middle_id = middle.id.clone();

        backend.put(&Selector::new("t1"), oldest, HashMap::new()).await.unwrap();
        backend.put(&Selector::new("t1"), middle, HashMap::new()).await.unwrap();
        backend.put(&Selector::new("t2"), checkpoint("t2", ""), HashMap::new()).await.unwrap();

        assert_eq!(backend.checkpoint_count().await, 2);
        let gone = backend
            .get(&Selector::new("t1").with_checkpoint_id(oldest_id))
            .await
            .unwrap();
        assert!(gone.is_none());
        let kept = backend
            .get(&Selector::new("t1").with_checkpoint_id(middle_id))
            .await
            .unwrap();
        assert!(kept.is_some());
    }

    #[tokio::test]
    async fn test_list_filters_and_limit() {
        let backend = MemoryBackend::new();
        for i in 0..3 {
            let mut cp = checkpoint("t1", "");
            cp.metadata.insert("tag".to_string(), json!(i % 2 == 0));
            cp.created_at = Utc::now() - Duration::minutes(i);
            backend.put(&Selector::new("t1"), cp, HashMap::new()).await.unwrap();
        }

        let filter: HashMap<String, serde_json::Value> =
            [("tag".to_string(), json!(true))].into_iter().collect();
        let filtered = backend
            .list(Some(&Selector::new("t1")), Some(&filter), None, None)
            .await
            .unwrap();
        assert_eq!(filtered.len(), 2);

        let limited = backend
            .list(Some(&Selector::new("t1")), None, None, Some(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_list_namespace_prefix() {
        let backend = MemoryBackend::new();
        backend
            .put(
                &Selector::new("t1").with_namespace("job"),
                checkpoint("t1", "job"),
                HashMap::new(),
            )
            .await
            .unwrap();
        backend
            .put(
                &Selector::new("t1").with_namespace("job:sub"),
                checkpoint("t1", "job:sub"),
                HashMap::new(),
            )
            .await
            .unwrap();

        let both = backend
            .list(Some(&Selector::new("t1").with_namespace("job")), None, None, None)
            .await
            .unwrap();
        assert_eq!(both.len(), 2);

        let one = backend
            .list(
                Some(&Selector::new("t1").with_namespace("job:sub")),
                None,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn test_put_writes_requires_existing_checkpoint() {
        let backend = MemoryBackend::new();
        let missing = Selector::new("t1").with_checkpoint_id("nope");
        let err = backend
            .put_writes(&missing, vec![("c".into(), json!(1))], "task", "")
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let saved = backend
            .put(&Selector::new("t1"), checkpoint("t1", ""), HashMap::new())
            .await
            .unwrap();
        backend
            .put_writes(
                &saved,
                vec![("chan1".into(), json!("v1"))],
                "task1",
                "",
            )
            .await
            .unwrap();

        let writes = backend.get_writes(&saved).await.unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].channel, "chan1");
        assert_eq!(writes[0].value, json!("v1"));
        assert_eq!(writes[0].task_id, "task1");
    }

    #[tokio::test]
    async fn test_disconnect_clears_state_and_blocks_operations() {
        let backend = MemoryBackend::new();
        backend
            .put(&Selector::new("t1"), checkpoint("t1", ""), HashMap::new())
            .await
            .unwrap();

        backend.disconnect().await.unwrap();
        let err = backend.get(&Selector::new("t1")).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Connection(_)));

        backend.connect().await.unwrap();
        assert_eq!(backend.checkpoint_count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_thread() {
        let backend = MemoryBackend::new();
        for _ in 0..3 {
            backend
                .put(&Selector::new("t1"), checkpoint("t1", ""), HashMap::new())
                .await
                .unwrap();
        }
        backend
            .put(&Selector::new("t2"), checkpoint("t2", ""), HashMap::new())
            .await
            .unwrap();

        assert_eq!(backend.delete_thread("t1").await.unwrap(), 3);
        assert_eq!(backend.thread_count().await, 1);
    }
}
