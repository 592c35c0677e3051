//! Checkpoint domain service
//!
//! Policy layer above [`CheckpointRepository`]: validation, lifecycle
//! transitions, backup chains and the retention sweeps. Policy predicates
//! (`is_cleanup_candidate`, `is_archive_candidate`) are pure functions so
//! they can be tested without a backend.
//!
//! Retention uses two independent knobs: age-based cleanup candidacy
//! (AUTO past `auto_cleanup_age_hours`, ERROR past `error_cleanup_age_hours`)
//! and a per-thread cap (`max_checkpoints_per_thread`) enforced as a
//! separate pass. MANUAL and MILESTONE checkpoints are never deleted by
//! either pass.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use checkpoint_core::{
    Checkpoint, CheckpointError, CheckpointId, CheckpointStatistics, CheckpointStatus,
    CheckpointType, Result, Selector,
};

use crate::repository::CheckpointRepository;

/// Tunables for the domain service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Maximum serialized state size accepted on create
    pub max_size_bytes: u64,
    /// Default lifetime applied to AUTO and ERROR checkpoints
    pub expiration_hours: i64,
    /// AUTO checkpoints older than this are cleanup candidates
    pub auto_cleanup_age_hours: i64,
    /// ERROR checkpoints older than this are cleanup candidates
    pub error_cleanup_age_hours: i64,
    /// Per-thread cap enforced by `enforce_thread_limit`
    pub max_checkpoints_per_thread: usize,
    /// ACTIVE non-MANUAL checkpoints older than this are archive candidates
    pub archive_age_days: i64,
    /// Minimum spacing between runs of `maintenance_if_due`
    pub cleanup_interval_seconds: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 100 * 1024 * 1024,
            expiration_hours: 24,
            auto_cleanup_age_hours: 24,
            error_cleanup_age_hours: 72,
            max_checkpoints_per_thread: 50,
            archive_age_days: 30,
            cleanup_interval_seconds: 60 * 60,
        }
    }
}

/// Outcome of a retention or archival sweep
///
/// Sweeps never abort on a single item's failure; they accumulate counts
/// and keep going. A candidate already deleted by a concurrent caller
/// counts as affected, not failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub affected: usize,
    pub failed: usize,
}

/// Combined outcome of one maintenance run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub cleanup: SweepReport,
    pub archival: SweepReport,
}

/// Domain service over a checkpoint repository
#[derive(Clone)]
pub struct CheckpointService {
    repository: CheckpointRepository,
    config: ServiceConfig,
    last_maintenance: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl CheckpointService {
    pub fn new(repository: CheckpointRepository) -> Self {
        Self::with_config(repository, ServiceConfig::default())
    }

    pub fn with_config(repository: CheckpointRepository, config: ServiceConfig) -> Self {
        Self {
            repository,
            config,
            last_maintenance: Arc::new(Mutex::new(None)),
        }
    }

    pub fn repository(&self) -> &CheckpointRepository {
        &self.repository
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Validate inputs before any I/O. Never retried.
    pub fn validate_create(
        &self,
        thread_id: &str,
        state_data: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        if thread_id.trim().is_empty() {
            return Err(CheckpointError::Validation(
                "thread_id must not be empty".to_string(),
            ));
        }
        if state_data.is_empty() {
            return Err(CheckpointError::Validation(
                "state_data must not be empty".to_string(),
            ));
        }
        let size = serde_json::to_vec(state_data)?.len() as u64;
        if size > self.config.max_size_bytes {
            return Err(CheckpointError::Validation(format!(
                "state size {} bytes exceeds limit of {} bytes",
                size, self.config.max_size_bytes
            )));
        }
        Ok(())
    }

    /// Restore is permitted for ACTIVE, unexpired checkpoints only.
    pub fn validate_restore(&self, checkpoint: &Checkpoint) -> Result<()> {
        if !checkpoint.can_restore() {
            return Err(CheckpointError::Validation(format!(
                "checkpoint {} is not restorable (status {}, expired: {})",
                checkpoint.id,
                checkpoint.status.as_str(),
                checkpoint.is_expired()
            )));
        }
        Ok(())
    }

    /// Build a checkpoint entity with the configured expiration applied.
    /// MANUAL and MILESTONE checkpoints never auto-expire.
    pub fn create_checkpoint_entity(
        &self,
        thread_id: &str,
        namespace: &str,
        checkpoint_type: CheckpointType,
        state_data: HashMap<String, serde_json::Value>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Checkpoint> {
        self.validate_create(thread_id, &state_data)?;

        let checkpoint = Checkpoint::new(thread_id, namespace, checkpoint_type, state_data)
            .with_metadata(metadata);
        match checkpoint_type {
            CheckpointType::Manual | CheckpointType::Milestone => Ok(checkpoint),
            CheckpointType::Auto | CheckpointType::Error => {
                let expires_at = checkpoint.created_at + Duration::hours(self.config.expiration_hours);
                checkpoint.with_expires_at(expires_at)
            }
        }
    }

    /// Create and persist an AUTO checkpoint.
    pub async fn create_checkpoint(
        &self,
        thread_id: &str,
        namespace: &str,
        state_data: HashMap<String, serde_json::Value>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Checkpoint> {
        let checkpoint = self.create_checkpoint_entity(
            thread_id,
            namespace,
            CheckpointType::Auto,
            state_data,
            metadata,
        )?;
        self.repository.save(checkpoint).await
    }

    /// Create and persist a MANUAL checkpoint with an optional title.
    pub async fn create_manual_checkpoint(
        &self,
        thread_id: &str,
        namespace: &str,
        state_data: HashMap<String, serde_json::Value>,
        title: Option<&str>,
    ) -> Result<Checkpoint> {
        let mut metadata = HashMap::new();
        if let Some(title) = title {
            metadata.insert("title".to_string(), json!(title));
        }
        let checkpoint = self.create_checkpoint_entity(
            thread_id,
            namespace,
            CheckpointType::Manual,
            state_data,
            metadata,
        )?;
        self.repository.save(checkpoint).await
    }

    /// Create and persist an ERROR checkpoint capturing a failure.
    pub async fn create_error_checkpoint(
        &self,
        thread_id: &str,
        namespace: &str,
        state_data: HashMap<String, serde_json::Value>,
        error_message: &str,
    ) -> Result<Checkpoint> {
        let mut metadata = HashMap::new();
        metadata.insert("error".to_string(), json!(error_message));
        let checkpoint = self.create_checkpoint_entity(
            thread_id,
            namespace,
            CheckpointType::Error,
            state_data,
            metadata,
        )?;
        self.repository.save(checkpoint).await
    }

    /// Snapshot an existing checkpoint into a MANUAL backup with no
    /// expiration. The backup records its origin in metadata.
    pub async fn create_backup(&self, selector: &Selector) -> Result<Checkpoint> {
        let original = self.repository.get(selector).await?.ok_or_else(|| {
            CheckpointError::not_found(format!(
                "checkpoint {} in thread {}",
                selector.checkpoint_id.as_deref().unwrap_or("<latest>"),
                selector.thread_id
            ))
        })?;

        let mut metadata = original.metadata.clone();
        metadata.insert("backup_of".to_string(), json!(original.id));
        metadata.insert("backup_timestamp".to_string(), json!(Utc::now()));
        metadata.insert(
            "original_created_at".to_string(),
            json!(original.created_at),
        );

        let backup = Checkpoint::new(
            &original.thread_id,
            &original.namespace,
            CheckpointType::Manual,
            original.state_data.clone(),
        )
        .with_metadata(metadata);

        info!(
            thread_id = %original.thread_id,
            original_id = %original.id,
            backup_id = %backup.id,
            "created backup checkpoint"
        );
        self.repository.save(backup).await
    }

    /// All backups of a checkpoint, newest backup first.
    pub async fn get_backup_chain(&self, checkpoint_id: &CheckpointId) -> Result<Vec<Checkpoint>> {
        let mut backups = self.repository.all_checkpoints().await?;
        backups.retain(|cp| {
            cp.metadata_str("backup_of")
                .map(|id| id == checkpoint_id)
                .unwrap_or(false)
        });
        backups.sort_by(|a, b| {
            let key = |cp: &Checkpoint| {
                cp.metadata
                    .get("backup_timestamp")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_default()
            };
            key(b).cmp(&key(a))
        });
        Ok(backups)
    }

    /// Restore a checkpoint: bump its restore counter and return the
    /// refreshed entity. Fails with ValidationError on non-restorable
    /// checkpoints without mutating them.
    pub async fn restore_checkpoint(&self, selector: &Selector) -> Result<Checkpoint> {
        let mut checkpoint = self.repository.get(selector).await?.ok_or_else(|| {
            CheckpointError::not_found(format!(
                "checkpoint {} in thread {}",
                selector.checkpoint_id.as_deref().unwrap_or("<latest>"),
                selector.thread_id
            ))
        })?;

        self.validate_restore(&checkpoint)?;
        checkpoint.mark_restored();
        self.repository.save(checkpoint).await
    }

    /// Move an ACTIVE checkpoint to ARCHIVED.
    pub async fn archive_checkpoint(&self, selector: &Selector) -> Result<Checkpoint> {
        self.transition(selector, CheckpointStatus::Archived).await
    }

    /// Flag a checkpoint whose payload failed verification.
    pub async fn mark_corrupted(&self, selector: &Selector) -> Result<Checkpoint> {
        self.transition(selector, CheckpointStatus::Corrupted).await
    }

    async fn transition(
        &self,
        selector: &Selector,
        next: CheckpointStatus,
    ) -> Result<Checkpoint> {
        let mut checkpoint = self.repository.get(selector).await?.ok_or_else(|| {
            CheckpointError::not_found(format!(
                "checkpoint {} in thread {}",
                selector.checkpoint_id.as_deref().unwrap_or("<latest>"),
                selector.thread_id
            ))
        })?;
        checkpoint.transition_to(next)?;
        self.repository.save(checkpoint).await
    }

    /// Push a checkpoint's expiration out by `hours`, measured from its
    /// current expiration (or from now if it has none).
    pub async fn extend_expiration(&self, selector: &Selector, hours: i64) -> Result<Checkpoint> {
        if hours <= 0 {
            return Err(CheckpointError::Validation(
                "extension hours must be positive".to_string(),
            ));
        }
        let mut checkpoint = self.repository.get(selector).await?.ok_or_else(|| {
            CheckpointError::not_found(format!(
                "checkpoint {} in thread {}",
                selector.checkpoint_id.as_deref().unwrap_or("<latest>"),
                selector.thread_id
            ))
        })?;

        let base = checkpoint.expires_at.unwrap_or_else(Utc::now);
        checkpoint.expires_at = Some(base + Duration::hours(hours));
        checkpoint.updated_at = Utc::now();
        self.repository.save(checkpoint).await
    }

    /// Age-based cleanup candidacy. MANUAL and MILESTONE never qualify.
    pub fn is_cleanup_candidate(&self, checkpoint: &Checkpoint) -> bool {
        if checkpoint.is_expired() {
            return true;
        }
        match checkpoint.checkpoint_type {
            CheckpointType::Manual | CheckpointType::Milestone => false,
            CheckpointType::Auto => {
                checkpoint.age() > Duration::hours(self.config.auto_cleanup_age_hours)
            }
            CheckpointType::Error => {
                checkpoint.age() > Duration::hours(self.config.error_cleanup_age_hours)
            }
        }
    }

    /// Archive candidacy: ACTIVE, non-MANUAL, older than the configured age.
    pub fn is_archive_candidate(&self, checkpoint: &Checkpoint) -> bool {
        checkpoint.status == CheckpointStatus::Active
            && checkpoint.checkpoint_type != CheckpointType::Manual
            && checkpoint.age() > Duration::days(self.config.archive_age_days)
    }

    /// Delete every cleanup candidate. Operates on a snapshot of candidate
    /// selectors; a candidate already gone counts as affected.
    pub async fn cleanup_expired(&self) -> Result<SweepReport> {
        let snapshot = self.repository.all_checkpoints().await?;
        let mut report = SweepReport {
            examined: snapshot.len(),
            ..SweepReport::default()
        };

        for checkpoint in &snapshot {
            if !self.is_cleanup_candidate(checkpoint) {
                continue;
            }
            match self.repository.delete(&checkpoint.selector()).await {
                Ok(_) => report.affected += 1,
                Err(e) if e.is_not_found() => report.affected += 1,
                Err(e) => {
                    warn!(checkpoint_id = %checkpoint.id, error = %e, "cleanup delete failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            examined = report.examined,
            affected = report.affected,
            failed = report.failed,
            "cleanup sweep finished"
        );
        Ok(report)
    }

    /// Trim a thread to the configured cap. The most recent
    /// `max_checkpoints_per_thread` are kept; beyond that only AUTO and
    /// ERROR checkpoints are deleted.
    pub async fn enforce_thread_limit(&self, thread_id: &str) -> Result<SweepReport> {
        let checkpoints = self.repository.find_by_thread(thread_id).await?;
        let mut report = SweepReport {
            examined: checkpoints.len(),
            ..SweepReport::default()
        };

        for checkpoint in checkpoints
            .iter()
            .skip(self.config.max_checkpoints_per_thread)
        {
            let deletable = matches!(
                checkpoint.checkpoint_type,
                CheckpointType::Auto | CheckpointType::Error
            );
            if !deletable {
                continue;
            }
            match self.repository.delete(&checkpoint.selector()).await {
                Ok(_) => report.affected += 1,
                Err(e) if e.is_not_found() => report.affected += 1,
                Err(e) => {
                    warn!(checkpoint_id = %checkpoint.id, error = %e, "limit enforcement failed");
                    report.failed += 1;
                }
            }
        }

        debug!(
            thread_id = %thread_id,
            affected = report.affected,
            "thread limit enforced"
        );
        Ok(report)
    }

    /// Archive every archive candidate.
    pub async fn archive_old_checkpoints(&self) -> Result<SweepReport> {
        let snapshot = self.repository.all_checkpoints().await?;
        let mut report = SweepReport {
            examined: snapshot.len(),
            ..SweepReport::default()
        };

        for checkpoint in &snapshot {
            if !self.is_archive_candidate(checkpoint) {
                continue;
            }
            match self.archive_checkpoint(&checkpoint.selector()).await {
                Ok(_) => report.affected += 1,
                Err(e) if e.is_not_found() => report.affected += 1,
                Err(e) => {
                    warn!(checkpoint_id = %checkpoint.id, error = %e, "archive failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            examined = report.examined,
            affected = report.affected,
            "archival sweep finished"
        );
        Ok(report)
    }

    /// Run the cleanup and archival sweeps back to back.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let cleanup = self.cleanup_expired().await?;
        let archival = self.archive_old_checkpoints().await?;
        *self.last_maintenance.lock() = Some(Utc::now());
        Ok(MaintenanceReport { cleanup, archival })
    }

    /// Run maintenance only if `cleanup_interval_seconds` has elapsed since
    /// the last run. Callers invoke this opportunistically alongside normal
    /// traffic; the first call always runs.
    pub async fn maintenance_if_due(&self) -> Result<Option<MaintenanceReport>> {
        let due = match *self.last_maintenance.lock() {
            None => true,
            Some(at) => {
                Utc::now() - at >= Duration::seconds(self.config.cleanup_interval_seconds as i64)
            }
        };
        if !due {
            return Ok(None);
        }
        Ok(Some(self.run_maintenance().await?))
    }

    /// Pure aggregation over a provided set of checkpoints.
    pub fn calculate_statistics(checkpoints: &[Checkpoint]) -> CheckpointStatistics {
        CheckpointStatistics::from_checkpoints(checkpoints)
    }
}
