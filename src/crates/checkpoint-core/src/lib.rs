//! Checkpoint persistence core for workflow execution state
//!
//! This crate provides the engine-neutral pieces of the checkpoint engine:
//!
//! - **Model**: [`Checkpoint`], [`Selector`], status/type enums and the
//!   invariants between them
//! - **Backend contract**: the [`CheckpointBackend`] trait every physical
//!   store implements, plus the shared list pipeline
//! - **Memory backend**: [`MemoryBackend`], a lock-protected in-process store
//!   with TTL purging and capacity eviction
//! - **Snapshot encoding**: [`PayloadFormat`], the wire encoding for
//!   exported checkpoints
//! - **Protocol adapter**: [`RuntimeAdapter`], the boundary translation to
//!   the graph-execution runtime's tuple shape
//!
//! Durable storage lives in the companion `checkpoint-store` crate.
//!
//! # Example
//!
//! ```
//! use checkpoint_core::{CheckpointBackend, MemoryBackend, Selector};
//! use std::collections::HashMap;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> checkpoint_core::Result<()> {
//! let backend = MemoryBackend::new();
//! let checkpoint = checkpoint_core::Checkpoint::new(
//!     "thread-1",
//!     "",
//!     checkpoint_core::CheckpointType::Auto,
//!     HashMap::new(),
//! );
//! let saved = backend.put(&Selector::new("thread-1"), checkpoint, HashMap::new()).await?;
//! assert!(saved.checkpoint_id.is_some());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod model;
pub mod protocol;
pub mod serializer;

pub use backend::{apply_list_pipeline, Before, CheckpointBackend};
pub use error::{CheckpointError, Result};
pub use memory::{MemoryBackend, MemoryBackendOptions};
pub use model::{
    ChannelVersions, Checkpoint, CheckpointId, CheckpointStatistics, CheckpointStatus,
    CheckpointType, Selector, WriteRecord,
};
pub use protocol::{CheckpointTuple, ListRequest, RuntimeAdapter};
pub use serializer::PayloadFormat;
