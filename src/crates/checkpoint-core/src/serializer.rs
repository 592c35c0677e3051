//! Checkpoint payload encoding
//!
//! Snapshots leave the engine as opaque bytes (exports, backup transport).
//! [`PayloadFormat`] picks the wire encoding for a whole [`Checkpoint`];
//! storage backends keep their own column encodings and do not go through
//! this type.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::Checkpoint;

/// Wire encoding for checkpoint snapshots
///
/// JSON is the default and stays readable in transit; bincode trades that
/// for compactness. Both carry the full domain checkpoint, so a snapshot
/// decoded with the format it was encoded with reproduces the entity
/// exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Json,
    Bincode,
}

impl PayloadFormat {
    /// Encode a checkpoint into this format's byte representation.
    pub fn encode(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>> {
        match self {
            Self::Json => Ok(serde_json::to_vec(checkpoint)?),
            Self::Bincode => Ok(bincode::serialize(checkpoint)?),
        }
    }

    /// Decode a checkpoint previously produced by [`encode`](Self::encode)
    /// with the same format.
    pub fn decode(&self, data: &[u8]) -> Result<Checkpoint> {
        match self {
            Self::Json => Ok(serde_json::from_slice(data)?),
            Self::Bincode => Ok(bincode::deserialize(data)?),
        }
    }
}
