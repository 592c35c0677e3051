//! Backend-agnostic checkpoint repository
//!
//! Wraps any [`CheckpointBackend`] with a recency-ordered secondary index
//! (`thread_id -> [checkpoint_id]`) and the derived queries the domain
//! service needs. The index is an in-process acceleration structure; the
//! backend remains the source of truth and the repository rebuilds its view
//! from backend reads.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use chrono::{DateTime, Utc};
use checkpoint_core::{
    ChannelVersions, Checkpoint, CheckpointBackend, CheckpointId, CheckpointStatistics,
    CheckpointStatus, Result, Selector, WriteRecord,
};

/// Repository over a checkpoint backend
#[derive(Clone)]
pub struct CheckpointRepository {
    backend: Arc<dyn CheckpointBackend>,
    /// thread_id -> checkpoint ids, most recently saved first
    thread_index: Arc<RwLock<HashMap<String, Vec<CheckpointId>>>>,
}

impl CheckpointRepository {
    pub fn new(backend: Arc<dyn CheckpointBackend>) -> Self {
        Self {
            backend,
            thread_index: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn backend(&self) -> &Arc<dyn CheckpointBackend> {
        &self.backend
    }

    fn index_insert(&self, thread_id: &str, checkpoint_id: &str) {
        let mut index = self.thread_index.write();
        let ids = index.entry(thread_id.to_string()).or_default();
        ids.retain(|id| id != checkpoint_id);
        ids.insert(0, checkpoint_id.to_string());
    }

    fn index_remove(&self, thread_id: &str, checkpoint_id: &str) {
        let mut index = self.thread_index.write();
        if let Some(ids) = index.get_mut(thread_id) {
            ids.retain(|id| id != checkpoint_id);
            if ids.is_empty() {
                index.remove(thread_id);
            }
        }
    }

    /// Persist a checkpoint and update the thread index.
    pub async fn save(&self, checkpoint: Checkpoint) -> Result<Checkpoint> {
        self.save_with_versions(checkpoint, ChannelVersions::new())
            .await
    }

    pub async fn save_with_versions(
        &self,
        checkpoint: Checkpoint,
        versions: ChannelVersions,
    ) -> Result<Checkpoint> {
        let selector = checkpoint.selector();
        let thread_id = checkpoint.thread_id.clone();
        let saved = self
            .backend
            .put(&selector, checkpoint.clone(), versions)
            .await?;
        if let Some(id) = &saved.checkpoint_id {
            self.index_insert(&thread_id, id);
        }
        debug!(thread_id = %thread_id, checkpoint_id = %checkpoint.id, "saved checkpoint");
        Ok(checkpoint)
    }

    pub async fn get(&self, selector: &Selector) -> Result<Option<Checkpoint>> {
        self.backend.get(selector).await
    }

    /// Latest checkpoint for a thread's root namespace.
    pub async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        self.backend.get(&Selector::new(thread_id)).await
    }

    pub async fn get_writes(&self, selector: &Selector) -> Result<Vec<WriteRecord>> {
        self.backend.get_writes(selector).await
    }

    pub async fn append_writes(
        &self,
        selector: &Selector,
        writes: Vec<(String, serde_json::Value)>,
        task_id: &str,
        task_path: &str,
    ) -> Result<()> {
        self.backend
            .put_writes(selector, writes, task_id, task_path)
            .await
    }

    pub async fn delete(&self, selector: &Selector) -> Result<bool> {
        let deleted = self.backend.delete(selector).await?;
        if deleted {
            if let Some(id) = &selector.checkpoint_id {
                self.index_remove(&selector.thread_id, id);
            }
        }
        Ok(deleted)
    }

    pub async fn delete_thread(&self, thread_id: &str) -> Result<u64> {
        let deleted = self.backend.delete_thread(thread_id).await?;
        self.thread_index.write().remove(thread_id);
        Ok(deleted)
    }

    /// All checkpoints for a thread, most recent first.
    pub async fn find_by_thread(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        self.backend
            .list(Some(&Selector::new(thread_id)), None, None, None)
            .await
    }

    /// ACTIVE and unexpired checkpoints for a thread.
    pub async fn find_active_by_thread(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = self.find_by_thread(thread_id).await?;
        checkpoints.retain(|cp| cp.status == CheckpointStatus::Active && !cp.is_expired());
        Ok(checkpoints)
    }

    /// Checkpoints past their expiration across all threads.
    ///
    /// Only meaningful when the backend keeps expired rows (TTL purging
    /// disabled); with lazy purging enabled the listing itself removes them.
    pub async fn find_expired(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = self.all_checkpoints().await?;
        checkpoints.retain(|cp| cp.is_expired() || cp.status == CheckpointStatus::Expired);
        Ok(checkpoints)
    }

    /// Checkpoints whose `metadata.tags` array contains every given tag.
    pub async fn find_by_tags(&self, tags: &[String]) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = self.all_checkpoints().await?;
        checkpoints.retain(|cp| {
            let Some(cp_tags) = cp.metadata.get("tags").and_then(|v| v.as_array()) else {
                return false;
            };
            tags.iter().all(|tag| {
                cp_tags
                    .iter()
                    .any(|t| t.as_str().map(|s| s == tag).unwrap_or(false))
            })
        });
        Ok(checkpoints)
    }

    /// Case-insensitive substring match on `metadata.title`.
    pub async fn find_by_title(&self, query: &str) -> Result<Vec<Checkpoint>> {
        let needle = query.to_lowercase();
        let mut checkpoints = self.all_checkpoints().await?;
        checkpoints.retain(|cp| {
            cp.metadata_str("title")
                .map(|title| title.to_lowercase().contains(&needle))
                .unwrap_or(false)
        });
        Ok(checkpoints)
    }

    /// Checkpoints created within `[start, end]`.
    pub async fn find_in_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = self.all_checkpoints().await?;
        checkpoints.retain(|cp| cp.created_at >= start && cp.created_at <= end);
        Ok(checkpoints)
    }

    pub async fn count_by_thread(&self, thread_id: &str) -> Result<usize> {
        Ok(self.find_by_thread(thread_id).await?.len())
    }

    pub async fn all_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        self.backend.list(None, None, None, None).await
    }

    pub async fn get_statistics(&self) -> Result<CheckpointStatistics> {
        let checkpoints = self.all_checkpoints().await?;
        Ok(CheckpointStatistics::from_checkpoints(&checkpoints))
    }

    /// Recency-ordered checkpoint ids for a thread from the secondary index.
    pub fn indexed_ids(&self, thread_id: &str) -> Vec<CheckpointId> {
        self.thread_index
            .read()
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkpoint_core::{CheckpointType, MemoryBackend};
    use chrono::Duration;
    use serde_json::json;

    fn repo() -> CheckpointRepository {
        CheckpointRepository::new(Arc::new(MemoryBackend::new()))
    }

    fn checkpoint(thread: &str, ty: CheckpointType) -> Checkpoint {
        let mut state = HashMap::new();
        state.insert("k".to_string(), json!("v"));
        Checkpoint::new(thread, "", ty, state)
    }

    #[tokio::test]
    async fn test_save_and_get_latest() {
        let repo = repo();
        let saved = repo
            .save(checkpoint("t1", CheckpointType::Auto))
            .await
            .unwrap();

        let latest = repo.get_latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.id, saved.id);
        assert_eq!(repo.indexed_ids("t1"), vec![saved.id]);
    }

    #[tokio::test]
    async fn test_find_active_excludes_archived_and_expired() {
        let repo = repo();
        repo.save(checkpoint("t1", CheckpointType::Auto)).await.unwrap();

        let mut archived = checkpoint("t1", CheckpointType::Auto);
        archived.transition_to(CheckpointStatus::Archived).unwrap();
        repo.save(archived).await.unwrap();

        let active = repo.find_active_by_thread("t1").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, CheckpointStatus::Active);
    }

    #[tokio::test]
    async fn test_find_by_tags_requires_all() {
        let repo = repo();
        let mut tagged = checkpoint("t1", CheckpointType::Manual);
        tagged
            .metadata
            .insert("tags".to_string(), json!(["release", "v2"]));
        repo.save(tagged).await.unwrap();

        let mut other = checkpoint("t1", CheckpointType::Manual);
        other.metadata.insert("tags".to_string(), json!(["release"]));
        repo.save(other).await.unwrap();

        let both = repo
            .find_by_tags(&["release".to_string(), "v2".to_string()])
            .await
            .unwrap();
        assert_eq!(both.len(), 1);

        let one = repo.find_by_tags(&["release".to_string()]).await.unwrap();
        assert_eq!(one.len(), 2);
    }

    #[tokio::test]
    async fn test_find_by_title_case_insensitive() {
        let repo = repo();
        let mut titled = checkpoint("t1", CheckpointType::Manual);
        titled
            .metadata
            .insert("title".to_string(), json!("Before Migration"));
        repo.save(titled).await.unwrap();
        repo.save(checkpoint("t1", CheckpointType::Auto)).await.unwrap();

        let found = repo.find_by_title("migration").await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(repo.find_by_title("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_in_time_range() {
        let repo = repo();
        let mut old = checkpoint("t1", CheckpointType::Auto);
        old.created_at = Utc::now() - Duration::days(3);
        repo.save(old).await.unwrap();
        repo.save(checkpoint("t1", CheckpointType::Auto)).await.unwrap();

        let recent = repo
            .find_in_time_range(Utc::now() - Duration::days(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_updates_index() {
        let repo = repo();
        let saved = repo
            .save(checkpoint("t1", CheckpointType::Auto))
            .await
            .unwrap();

        assert!(repo.delete(&saved.selector()).await.unwrap());
        assert!(repo.indexed_ids("t1").is_empty());
        assert_eq!(repo.count_by_thread("t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_statistics_over_backend() {
        let repo = repo();
        repo.save(checkpoint("t1", CheckpointType::Auto)).await.unwrap();
        repo.save(checkpoint("t2", CheckpointType::Manual)).await.unwrap();

        let stats = repo.get_statistics().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_type.get("auto"), Some(&1));
    }
}
