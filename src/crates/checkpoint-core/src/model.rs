//! Core checkpoint data structures
//!
//! Defines the engine's domain model: [`Checkpoint`] (a persisted snapshot of
//! workflow-execution state), [`Selector`] (the `(thread_id, namespace,
//! checkpoint_id?)` key used to address checkpoints), [`WriteRecord`]
//! (intermediate channel writes attached to a checkpoint) and
//! [`CheckpointStatistics`] (derived aggregates, never persisted).
//!
//! Status transitions are one-directional: a checkpoint starts `Active` and
//! may move to `Expired`, `Archived` or `Corrupted`; those three states are
//! terminal for this engine; deletion is the only further operation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{CheckpointError, Result};

/// Checkpoint ID type
pub type CheckpointId = String;

/// Mapping from channel name to version marker
pub type ChannelVersions = HashMap<String, serde_json::Value>;

/// How a checkpoint came to exist
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointType {
    /// Created automatically by the execution runtime
    Auto,
    /// Created explicitly by a user; never auto-expires by default
    Manual,
    /// Captured on execution failure for post-mortem inspection
    Error,
    /// Marks a significant point in a workflow; never auto-expires by default
    Milestone,
}

impl CheckpointType {
    /// Stable lowercase name used in persisted rows and statistics keys
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointType::Auto => "auto",
            CheckpointType::Manual => "manual",
            CheckpointType::Error => "error",
            CheckpointType::Milestone => "milestone",
        }
    }
}

/// Lifecycle state of a checkpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Active,
    Expired,
    Corrupted,
    Archived,
}

impl CheckpointStatus {
    /// One-directional transition rule: only `Active` has successors.
    pub fn can_transition_to(&self, next: CheckpointStatus) -> bool {
        matches!(
            (self, next),
            (
                CheckpointStatus::Active,
                CheckpointStatus::Expired
                    | CheckpointStatus::Archived
                    | CheckpointStatus::Corrupted
            )
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Active => "active",
            CheckpointStatus::Expired => "expired",
            CheckpointStatus::Corrupted => "corrupted",
            CheckpointStatus::Archived => "archived",
        }
    }
}

/// Addressing key for checkpoint operations
///
/// A selector without `checkpoint_id` addresses the latest checkpoint of the
/// `(thread_id, namespace)` pair. The namespace may be empty; it isolates
/// nested or parallel executions within a thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Selector {
    pub thread_id: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,
}

impl Selector {
    /// Selector for the latest checkpoint of a thread's root namespace
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            namespace: String::new(),
            checkpoint_id: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    /// Composite storage key; `\u{1}` cannot occur in thread ids or
    /// namespaces coming over the protocol boundary.
    pub fn storage_key(&self) -> Option<String> {
        self.checkpoint_id
            .as_ref()
            .map(|id| format!("{}\u{1}{}\u{1}{}", self.thread_id, self.namespace, id))
    }
}

/// Intermediate write attached to a checkpoint
///
/// Append-only and not separately addressable: writes are retrieved as the
/// full list for a checkpoint and deleted with it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriteRecord {
    pub checkpoint_id: CheckpointId,
    pub task_id: String,
    pub task_path: String,
    pub channel: String,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A persisted snapshot of workflow-execution state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Globally unique identifier (UUID v4)
    pub id: CheckpointId,

    /// Execution lane this checkpoint belongs to; a checkpoint never moves
    /// between threads
    pub thread_id: String,

    /// Sub-scope within the thread; may be empty
    #[serde(default)]
    pub namespace: String,

    pub checkpoint_type: CheckpointType,

    pub status: CheckpointStatus,

    /// Opaque execution state
    pub state_data: HashMap<String, serde_json::Value>,

    /// Free-form metadata: title, description, tags, backup_of,
    /// backup_timestamp and similar keys
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// When set, must be strictly greater than `created_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Serialized length of `state_data`
    pub size_bytes: u64,

    pub restore_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restored_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// Create an active checkpoint with a generated id.
    ///
    /// `size_bytes` is computed from the serialized state; callers that
    /// mutate `state_data` afterwards must call [`Checkpoint::recompute_size`].
    pub fn new(
        thread_id: impl Into<String>,
        namespace: impl Into<String>,
        checkpoint_type: CheckpointType,
        state_data: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        let size_bytes = serialized_len(&state_data);
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            namespace: namespace.into(),
            checkpoint_type,
            status: CheckpointStatus::Active,
            state_data,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            expires_at: None,
            size_bytes,
            restore_count: 0,
            last_restored_at: None,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set an absolute expiration; rejected unless strictly after `created_at`.
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Result<Self> {
        if expires_at <= self.created_at {
            return Err(CheckpointError::Validation(format!(
                "expires_at {} must be after created_at {}",
                expires_at, self.created_at
            )));
        }
        self.expires_at = Some(expires_at);
        Ok(self)
    }

    /// Selector addressing exactly this checkpoint
    pub fn selector(&self) -> Selector {
        Selector {
            thread_id: self.thread_id.clone(),
            namespace: self.namespace.clone(),
            checkpoint_id: Some(self.id.clone()),
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() >= expires_at,
            None => false,
        }
    }

    pub fn age(&self) -> Duration {
        Utc::now() - self.created_at
    }

    /// Only `Active`, non-expired checkpoints may be restored.
    pub fn can_restore(&self) -> bool {
        self.status == CheckpointStatus::Active && !self.is_expired()
    }

    /// Record a successful restore.
    pub fn mark_restored(&mut self) {
        let now = Utc::now();
        self.restore_count += 1;
        self.last_restored_at = Some(now);
        self.updated_at = now;
    }

    /// Apply a status transition, enforcing the one-directional rule.
    pub fn transition_to(&mut self, next: CheckpointStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CheckpointError::Validation(format!(
                "invalid status transition {} -> {} for checkpoint {}",
                self.status.as_str(),
                next.as_str(),
                self.id
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Recompute `size_bytes` after state mutation.
    pub fn recompute_size(&mut self) {
        self.size_bytes = serialized_len(&self.state_data);
    }

    /// Metadata value as a string, if present and string-typed
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

fn serialized_len(state: &HashMap<String, serde_json::Value>) -> u64 {
    serde_json::to_vec(state).map(|b| b.len() as u64).unwrap_or(0)
}

/// Aggregate statistics over a set of checkpoints
///
/// Derived on demand; never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CheckpointStatistics {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub by_type: HashMap<String, usize>,
    pub total_size_bytes: u64,
    pub avg_size_bytes: f64,
    pub max_size_bytes: u64,
    pub min_size_bytes: u64,
    pub total_restores: u64,
    pub avg_restores: f64,
    pub oldest_age_seconds: i64,
    pub newest_age_seconds: i64,
    pub avg_age_seconds: f64,
}

impl CheckpointStatistics {
    /// Aggregate a snapshot of checkpoints. Empty input yields all zeros.
    pub fn from_checkpoints(checkpoints: &[Checkpoint]) -> Self {
        if checkpoints.is_empty() {
            return Self::default();
        }

        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut total_size: u64 = 0;
        let mut max_size: u64 = 0;
        let mut min_size: u64 = u64::MAX;
        let mut total_restores: u64 = 0;
        let mut total_age: i64 = 0;
        let mut oldest_age: i64 = i64::MIN;
        let mut newest_age: i64 = i64::MAX;

        for cp in checkpoints {
            *by_status.entry(cp.status.as_str().to_string()).or_insert(0) += 1;
            *by_type
                .entry(cp.checkpoint_type.as_str().to_string())
                .or_insert(0) += 1;
            total_size += cp.size_bytes;
            max_size = max_size.max(cp.size_bytes);
            min_size = min_size.min(cp.size_bytes);
            total_restores += cp.restore_count;
            let age = cp.age().num_seconds();
            total_age += age;
            oldest_age = oldest_age.max(age);
            newest_age = newest_age.min(age);
        }

        let total = checkpoints.len();
        Self {
            total,
            by_status,
            by_type,
            total_size_bytes: total_size,
            avg_size_bytes: total_size as f64 / total as f64,
            max_size_bytes: max_size,
            min_size_bytes: min_size,
            total_restores,
            avg_restores: total_restores as f64 / total as f64,
            oldest_age_seconds: oldest_age,
            newest_age_seconds: newest_age,
            avg_age_seconds: total_age as f64 / total as f64,
        }
    }
}
