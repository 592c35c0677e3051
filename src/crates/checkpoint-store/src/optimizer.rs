//! Performance optimizer
//!
//! Read-through caching and batched writes over [`CheckpointRepository`].
//! Two caches with independent TTLs: a checkpoint cache keyed by selector
//! (default 30 min) and a query-result cache for read-mostly aggregates
//! keyed by `(query_type, params hash)` (default 15 min). Both are bounded
//! and evict the oldest entry when full. All cache access is synchronous
//! behind reader-writer locks.

use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tracing::debug;

use checkpoint_core::{Checkpoint, CheckpointError, CheckpointStatistics, Result, Selector};

use crate::repository::CheckpointRepository;

const DEFAULT_CHECKPOINT_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_QUERY_TTL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_CACHE_CAPACITY: usize = 1000;
const DEFAULT_BATCH_SIZE: usize = 50;

/// Hit/miss counters for a cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheMetrics {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

/// Bounded TTL cache with oldest-entry eviction
struct TtlCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    ttl: Duration,
    capacity: usize,
    metrics: CacheMetrics,
}

impl<V: Clone> TtlCache<V> {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            capacity,
            metrics: CacheMetrics::default(),
        }
    }

    fn get(&mut self, key: &str) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.stored_at.elapsed() > self.ttl,
            None => {
                self.metrics.misses += 1;
                return None;
            }
        };
        if expired {
            self.entries.remove(key);
            self.metrics.misses += 1;
            return None;
        }
        self.metrics.hits += 1;
        self.entries.get(key).map(|e| e.value.clone())
    }

    fn insert(&mut self, key: String, value: V) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
                self.metrics.evictions += 1;
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Per-item outcome of a batch save
#[derive(Debug)]
pub enum BatchItemOutcome {
    Saved(Checkpoint),
    Failed {
        checkpoint_id: String,
        error: CheckpointError,
    },
}

/// Summary of a batch save
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<BatchItemOutcome>,
}

/// Optimizer configuration
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub checkpoint_ttl: Duration,
    pub query_ttl: Duration,
    pub cache_capacity: usize,
    pub batch_size: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            checkpoint_ttl: DEFAULT_CHECKPOINT_TTL,
            query_ttl: DEFAULT_QUERY_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Caching, batching wrapper around a repository
pub struct OptimizedRepository {
    repository: CheckpointRepository,
    checkpoint_cache: RwLock<TtlCache<Checkpoint>>,
    query_cache: RwLock<TtlCache<serde_json::Value>>,
    batch_size: usize,
}

fn query_key(query_type: &str, params: &str) -> String {
    let mut hasher = DefaultHasher::new();
    params.hash(&mut hasher);
    format!("{}:{:x}", query_type, hasher.finish())
}

impl OptimizedRepository {
    pub fn new(repository: CheckpointRepository) -> Self {
        Self::with_config(repository, OptimizerConfig::default())
    }

    pub fn with_config(repository: CheckpointRepository, config: OptimizerConfig) -> Self {
        Self {
            repository,
            checkpoint_cache: RwLock::new(TtlCache::new(
                config.checkpoint_ttl,
                config.cache_capacity,
            )),
            query_cache: RwLock::new(TtlCache::new(config.query_ttl, config.cache_capacity)),
            batch_size: config.batch_size.max(1),
        }
    }

    pub fn repository(&self) -> &CheckpointRepository {
        &self.repository
    }

    fn cache_key(selector: &Selector) -> Option<String> {
        selector.storage_key()
    }

    /// Read-through get. Selectors without an id always hit the backend
    /// since "latest" changes with every write.
    pub async fn get(&self, selector: &Selector) -> Result<Option<Checkpoint>> {
        let key = match Self::cache_key(selector) {
            Some(key) => key,
            None => return self.repository.get(selector).await,
        };

        if let Some(hit) = self.checkpoint_cache.write().get(&key) {
            return Ok(Some(hit));
        }

        let fetched = self.repository.get(selector).await?;
        if let Some(checkpoint) = &fetched {
            self.checkpoint_cache
                .write()
                .insert(key, checkpoint.clone());
        }
        Ok(fetched)
    }

    /// Save a checkpoint, updating the checkpoint cache and invalidating
    /// query results.
    pub async fn save(&self, checkpoint: Checkpoint) -> Result<Checkpoint> {
        let saved = self.repository.save(checkpoint).await?;
        if let Some(key) = Self::cache_key(&saved.selector()) {
            self.checkpoint_cache.write().insert(key, saved.clone());
        }
        self.query_cache.write().clear();
        Ok(saved)
    }

    pub async fn delete(&self, selector: &Selector) -> Result<bool> {
        let deleted = self.repository.delete(selector).await?;
        if let Some(key) = Self::cache_key(selector) {
            self.checkpoint_cache.write().remove(&key);
        }
        self.query_cache.write().clear();
        Ok(deleted)
    }

    /// Save checkpoints in fixed-size batches. Items within a batch run
    /// concurrently; one failure never aborts the rest.
    pub async fn batch_save(&self, checkpoints: Vec<Checkpoint>) -> Result<BatchReport> {
        let mut report = BatchReport::default();

        for chunk in checkpoints.chunks(self.batch_size) {
            let futures = chunk
                .iter()
                .cloned()
                .map(|cp| async move {
                    let id = cp.id.clone();
                    (id, self.repository.save(cp).await)
                })
                .collect::<Vec<_>>();

            for (checkpoint_id, result) in join_all(futures).await {
                match result {
                    Ok(saved) => {
                        report.succeeded += 1;
                        report.outcomes.push(BatchItemOutcome::Saved(saved));
                    }
                    Err(error) => {
                        debug!(checkpoint_id = %checkpoint_id, error = %error, "batch item failed");
                        report.failed += 1;
                        report
                            .outcomes
                            .push(BatchItemOutcome::Failed { checkpoint_id, error });
                    }
                }
            }
        }

        self.query_cache.write().clear();
        Ok(report)
    }

    /// Cached listing for a thread.
    pub async fn find_by_thread(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let key = query_key("find_by_thread", thread_id);
        if let Some(hit) = self.query_cache.write().get(&key) {
            return Ok(serde_json::from_value(hit)?);
        }

        let checkpoints = self.repository.find_by_thread(thread_id).await?;
        self.query_cache
            .write()
            .insert(key, serde_json::to_value(&checkpoints)?);
        Ok(checkpoints)
    }

    /// Cached statistics over the whole store.
    pub async fn get_statistics(&self) -> Result<CheckpointStatistics> {
        let key = query_key("statistics", "");
        if let Some(hit) = self.query_cache.write().get(&key) {
            return Ok(serde_json::from_value(hit)?);
        }

        let stats = self.repository.get_statistics().await?;
        self.query_cache
            .write()
            .insert(key, serde_json::to_value(&stats)?);
        Ok(stats)
    }

    pub fn checkpoint_cache_metrics(&self) -> CacheMetrics {
        self.checkpoint_cache.read().metrics
    }

    pub fn query_cache_metrics(&self) -> CacheMetrics {
        self.query_cache.read().metrics
    }

    pub fn cached_checkpoints(&self) -> usize {
        self.checkpoint_cache.read().len()
    }

    pub fn clear_caches(&self) {
        self.checkpoint_cache.write().clear();
        self.query_cache.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkpoint_core::{CheckpointType, MemoryBackend};
    use serde_json::json;
    use std::sync::Arc;

    fn optimized() -> OptimizedRepository {
        OptimizedRepository::new(CheckpointRepository::new(Arc::new(MemoryBackend::new())))
    }

    fn checkpoint(thread: &str) -> Checkpoint {
        let mut state = HashMap::new();
        state.insert("k".to_string(), json!("v"));
        Checkpoint::new(thread, "", CheckpointType::Auto, state)
    }

    #[tokio::test]
    async fn test_get_is_read_through() {
        let repo = optimized();
        let saved = repo.save(checkpoint("t1")).await.unwrap();
        repo.clear_caches();

        // First read misses, second hits.
        repo.get(&saved.selector()).await.unwrap().unwrap();
        repo.get(&saved.selector()).await.unwrap().unwrap();

        let metrics = repo.checkpoint_cache_metrics();
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hits, 1);
        assert!(metrics.hit_ratio() > 0.0);
    }

    #[tokio::test]
    async fn test_ttl_expiry_causes_miss() {
        let backend = Arc::new(MemoryBackend::new());
        let repo = OptimizedRepository::with_config(
            CheckpointRepository::new(backend),
            OptimizerConfig {
                checkpoint_ttl: Duration::from_millis(0),
                ..OptimizerConfig::default()
            },
        );
        let saved = repo.save(checkpoint("t1")).await.unwrap();

        std::thread::sleep(Duration::from_millis(5));
        repo.get(&saved.selector()).await.unwrap().unwrap();
        assert_eq!(repo.checkpoint_cache_metrics().misses, 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let backend = Arc::new(MemoryBackend::new());
        let repo = OptimizedRepository::with_config(
            CheckpointRepository::new(backend),
            OptimizerConfig {
                cache_capacity: 2,
                ..OptimizerConfig::default()
            },
        );

        repo.save(checkpoint("t1")).await.unwrap();
        repo.save(checkpoint("t2")).await.unwrap();
        repo.save(checkpoint("t3")).await.unwrap();

        assert_eq!(repo.cached_checkpoints(), 2);
        assert_eq!(repo.checkpoint_cache_metrics().evictions, 1);
    }

    #[tokio::test]
    async fn test_query_cache_invalidated_on_write() {
        let repo = optimized();
        repo.save(checkpoint("t1")).await.unwrap();

        let first = repo.find_by_thread("t1").await.unwrap();
        assert_eq!(first.len(), 1);

        repo.save(checkpoint("t1")).await.unwrap();
        let second = repo.find_by_thread("t1").await.unwrap();
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_statistics_are_cached() {
        let repo = optimized();
        repo.save(checkpoint("t1")).await.unwrap();

        repo.get_statistics().await.unwrap();
        repo.get_statistics().await.unwrap();
        assert_eq!(repo.query_cache_metrics().hits, 1);
    }

    #[tokio::test]
    async fn test_batch_save_collects_outcomes() {
        let repo = optimized();
        let batch: Vec<Checkpoint> = (0..120).map(|_| checkpoint("t1")).collect();

        let report = repo.batch_save(batch).await.unwrap();
        assert_eq!(report.succeeded, 120);
        assert_eq!(report.failed, 0);
        assert_eq!(report.outcomes.len(), 120);

        let stats = repo.repository().get_statistics().await.unwrap();
        assert_eq!(stats.total, 120);
    }
}
