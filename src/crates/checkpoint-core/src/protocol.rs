//! External runtime protocol adapter
//!
//! The graph-execution runtime addresses checkpoints through a tuple shape
//! `{selector, checkpoint, metadata, parent_selector, pending_writes}`. This
//! module translates between that boundary shape and the domain
//! [`Checkpoint`], so the protocol never leaks into the rest of the engine.
//! `parent_selector` is always `None` here; lineage is expressed through
//! backup chains instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::backend::{Before, CheckpointBackend};
use crate::error::{CheckpointError, Result};
use crate::model::{
    ChannelVersions, Checkpoint, CheckpointStatus, CheckpointType, Selector, WriteRecord,
};

/// Runtime-facing checkpoint tuple
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointTuple {
    pub selector: Selector,
    pub checkpoint: serde_json::Value,
    pub metadata: serde_json::Value,
    pub parent_selector: Option<Selector>,
    pub pending_writes: Vec<WriteRecord>,
}

/// List request in the runtime's shape
///
/// `before_steps` truncates to the first N results after ordering, unlike
/// the storage-level count cursor which skips them.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub selector: Option<Selector>,
    pub filter: Option<HashMap<String, serde_json::Value>>,
    pub status: Option<CheckpointStatus>,
    pub checkpoint_type: Option<CheckpointType>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub before_steps: Option<usize>,
    pub limit: Option<usize>,
}

impl ListRequest {
    pub fn for_thread(thread_id: impl Into<String>) -> Self {
        Self {
            selector: Some(Selector::new(thread_id)),
            ..Self::default()
        }
    }
}

/// Adapter exposing a [`CheckpointBackend`] through the runtime protocol
#[derive(Clone)]
pub struct RuntimeAdapter {
    backend: Arc<dyn CheckpointBackend>,
}

impl RuntimeAdapter {
    pub fn new(backend: Arc<dyn CheckpointBackend>) -> Self {
        Self { backend }
    }

    fn value_to_map(
        value: serde_json::Value,
        what: &str,
    ) -> Result<HashMap<String, serde_json::Value>> {
        match value {
            serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
            serde_json::Value::Null => Ok(HashMap::new()),
            other => Err(CheckpointError::Validation(format!(
                "{} must be a JSON object, got {}",
                what, other
            ))),
        }
    }

    fn to_tuple(&self, checkpoint: Checkpoint, pending_writes: Vec<WriteRecord>) -> CheckpointTuple {
        let selector = Selector {
            thread_id: checkpoint.thread_id.clone(),
            namespace: checkpoint.namespace.clone(),
            checkpoint_id: Some(checkpoint.id.clone()),
        };
        let state: serde_json::Map<String, serde_json::Value> =
            checkpoint.state_data.into_iter().collect();
        let metadata: serde_json::Map<String, serde_json::Value> =
            checkpoint.metadata.into_iter().collect();
        CheckpointTuple {
            selector,
            checkpoint: serde_json::Value::Object(state),
            metadata: serde_json::Value::Object(metadata),
            parent_selector: None,
            pending_writes,
        }
    }

    /// Resolve a selector to the runtime tuple, including pending writes.
    pub async fn get_tuple(&self, selector: &Selector) -> Result<Option<CheckpointTuple>> {
        let checkpoint = match self.backend.get(selector).await? {
            Some(cp) => cp,
            None => return Ok(None),
        };
        let write_selector = Selector {
            thread_id: checkpoint.thread_id.clone(),
            namespace: checkpoint.namespace.clone(),
            checkpoint_id: Some(checkpoint.id.clone()),
        };
        let pending_writes = self.backend.get_writes(&write_selector).await?;
        Ok(Some(self.to_tuple(checkpoint, pending_writes)))
    }

    /// List tuples with the runtime's extended filter set.
    pub async fn list(&self, request: &ListRequest) -> Result<Vec<CheckpointTuple>> {
        let before = request.created_before.map(Before::Timestamp);
        let mut checkpoints = self
            .backend
            .list(
                request.selector.as_ref(),
                request.filter.as_ref(),
                before.as_ref(),
                None,
            )
            .await?;

        if let Some(status) = request.status {
            checkpoints.retain(|cp| cp.status == status);
        }
        if let Some(ty) = request.checkpoint_type {
            checkpoints.retain(|cp| cp.checkpoint_type == ty);
        }
        if let Some(after) = request.created_after {
            checkpoints.retain(|cp| cp.created_at > after);
        }
        if let Some(steps) = request.before_steps {
            checkpoints.truncate(steps);
        }
        if let Some(limit) = request.limit {
            checkpoints.truncate(limit);
        }

        let mut tuples = Vec::with_capacity(checkpoints.len());
        for checkpoint in checkpoints {
            tuples.push(self.to_tuple(checkpoint, Vec::new()));
        }
        Ok(tuples)
    }

    /// Store a protocol-shaped checkpoint. The returned selector always
    /// carries a populated `checkpoint_id`.
    pub async fn put(
        &self,
        selector: &Selector,
        checkpoint_payload: serde_json::Value,
        metadata: serde_json::Value,
        versions: ChannelVersions,
    ) -> Result<Selector> {
        let state_data = Self::value_to_map(checkpoint_payload, "checkpoint payload")?;
        let metadata = Self::value_to_map(metadata, "metadata")?;

        let checkpoint_type = metadata
            .get("checkpoint_type")
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_value(serde_json::Value::String(s.to_string())).ok())
            .unwrap_or(CheckpointType::Auto);

        let checkpoint = Checkpoint::new(
            &selector.thread_id,
            &selector.namespace,
            checkpoint_type,
            state_data,
        )
        .with_metadata(metadata);

        let result = self.backend.put(selector, checkpoint, versions).await?;
        debug!(
            thread_id = %result.thread_id,
            checkpoint_id = result.checkpoint_id.as_deref().unwrap_or(""),
            "stored checkpoint via runtime protocol"
        );
        Ok(result)
    }

    /// Append channel writes for an existing checkpoint.
    pub async fn put_writes(
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

    /// Delete a checkpoint, rejecting cross-thread selectors.
    pub async fn delete(&self, selector: &Selector) -> Result<bool> {
        let id = selector.checkpoint_id.as_ref().ok_or_else(|| {
            CheckpointError::Validation("delete requires a checkpoint_id".to_string())
        })?;

        if self.backend.get(selector).await?.is_some() {
            return self.backend.delete(selector).await;
        }

        // The id was not found under this selector. Reject only when it
        // lives under a different thread; a same-thread namespace miss is
        // an ordinary not-found.
        let all = self.backend.list(None, None, None, None).await?;
        if let Some(owner) = all.iter().find(|cp| &cp.id == id) {
            if owner.thread_id != selector.thread_id {
                return Err(CheckpointError::Validation(format!(
                    "checkpoint {} belongs to thread {}, not {}",
                    id, owner.thread_id, selector.thread_id
                )));
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use serde_json::json;

    fn adapter() -> RuntimeAdapter {
        RuntimeAdapter::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_put_populates_checkpoint_id() {
        let adapter = adapter();
        let saved = adapter
            .put(
                &Selector::new("t1"),
                json!({"x": 1}),
                json!({}),
                HashMap::new(),
            )
            .await
            .unwrap();
        assert!(saved.checkpoint_id.is_some());
    }

    #[tokio::test]
    async fn test_get_tuple_round_trip_with_writes() {
        let adapter = adapter();
        let saved = adapter
            .put(
                &Selector::new("t1"),
                json!({"x": 1}),
                json!({"source": "loop"}),
                HashMap::new(),
            )
            .await
            .unwrap();
        adapter
            .put_writes(&saved, vec![("chan1".into(), json!("v1"))], "task1", "")
            .await
            .unwrap();

        let tuple = adapter
            .get_tuple(&Selector::new("t1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tuple.selector.checkpoint_id, saved.checkpoint_id);
        assert_eq!(tuple.checkpoint["x"], json!(1));
        assert_eq!(tuple.metadata["source"], json!("loop"));
        assert!(tuple.parent_selector.is_none());
        assert_eq!(tuple.pending_writes.len(), 1);
        assert_eq!(tuple.pending_writes[0].channel, "chan1");
    }

    #[tokio::test]
    async fn test_put_rejects_non_object_payload() {
        let adapter = adapter();
        let err = adapter
            .put(&Selector::new("t1"), json!([1, 2]), json!({}), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Validation(_)));
    }

    #[tokio::test]
    async fn test_list_type_filter_and_step_truncation() {
        let adapter = adapter();
        for i in 0..4 {
            let ty = if i % 2 == 0 { "auto" } else { "manual" };
            adapter
                .put(
                    &Selector::new("t1"),
                    json!({"i": i}),
                    json!({"checkpoint_type": ty}),
                    HashMap::new(),
                )
                .await
                .unwrap();
        }

        let manual_only = adapter
            .list(&ListRequest {
                checkpoint_type: Some(CheckpointType::Manual),
                ..ListRequest::for_thread("t1")
            })
            .await
            .unwrap();
        assert_eq!(manual_only.len(), 2);

        let first_three = adapter
            .list(&ListRequest {
                before_steps: Some(3),
                ..ListRequest::for_thread("t1")
            })
            .await
            .unwrap();
        assert_eq!(first_three.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_rejects_cross_thread() {
        let adapter = adapter();
        let saved = adapter
            .put(&Selector::new("t1"), json!({"x": 1}), json!({}), HashMap::new())
            .await
            .unwrap();

        let foreign = Selector::new("t2")
            .with_checkpoint_id(saved.checkpoint_id.clone().unwrap());
        let err = adapter.delete(&foreign).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Validation(_)));

        assert!(adapter.delete(&saved).await.unwrap());
        assert!(adapter.get_tuple(&Selector::new("t1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_same_thread_wrong_namespace_returns_false() {
        let adapter = adapter();
        let saved = adapter
            .put(
                &Selector::new("t1").with_namespace("inner"),
                json!({"x": 1}),
                json!({}),
                HashMap::new(),
            )
            .await
            .unwrap();

        // Same thread, root namespace: not an ownership violation.
        let wrong_ns = Selector::new("t1")
            .with_checkpoint_id(saved.checkpoint_id.clone().unwrap());
        assert!(!adapter.delete(&wrong_ns).await.unwrap());
        assert!(adapter.get_tuple(&saved).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_missing_returns_false() {
        let adapter = adapter();
        let missing = Selector::new("t1").with_checkpoint_id("nope");
        assert!(!adapter.delete(&missing).await.unwrap());
    }
}
