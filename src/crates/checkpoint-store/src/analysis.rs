//! Checkpoint analysis helpers
//!
//! Compression, integrity hashing, state diffing and usage-pattern analysis.
//! Everything here is pure with respect to storage; callers fetch the
//! checkpoints and hand them in.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Write};

use checkpoint_core::{Checkpoint, CheckpointError, CheckpointType, PayloadFormat, Result};

/// Gzip magic bytes used to recognize compressed payloads
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Result of compressing a state payload
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub data: Vec<u8>,
    pub original_size: usize,
    pub compressed_size: usize,
    /// compressed / original; lower is better
    pub ratio: f64,
}

/// Gzip compressor for serialized checkpoint state
#[derive(Debug, Clone)]
pub struct StateCompressor {
    level: Compression,
}

impl Default for StateCompressor {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl StateCompressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    pub fn is_compressed(data: &[u8]) -> bool {
        data.len() >= 2 && data[..2] == GZIP_MAGIC
    }

    pub fn compress(&self, data: &[u8]) -> Result<CompressionOutcome> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(data)
            .map_err(|e| CheckpointError::storage("compress", e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| CheckpointError::storage("compress", e.to_string()))?;

        let ratio = if data.is_empty() {
            1.0
        } else {
            compressed.len() as f64 / data.len() as f64
        };
        Ok(CompressionOutcome {
            original_size: data.len(),
            compressed_size: compressed.len(),
            data: compressed,
            ratio,
        })
    }

    /// Inverse of `compress`. Uncompressed input passes through unchanged.
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if !Self::is_compressed(data) {
            return Ok(data.to_vec());
        }
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CheckpointError::storage("decompress", e.to_string()))?;
        Ok(out)
    }
}

/// Snapshot codec: a [`PayloadFormat`] plus optional gzip on top.
///
/// Encodes whole checkpoints for export and backup transport. Payloads
/// below the threshold are stored plain; `decode` accepts both, keyed off
/// the gzip magic bytes.
#[derive(Debug, Clone)]
pub struct SnapshotCodec {
    format: PayloadFormat,
    compressor: StateCompressor,
    compress_over: Option<u64>,
}

impl SnapshotCodec {
    /// Codec without compression.
    pub fn new(format: PayloadFormat) -> Self {
        Self {
            format,
            compressor: StateCompressor::new(),
            compress_over: None,
        }
    }

    /// Codec that gzips payloads of `threshold_bytes` or more.
    pub fn with_compression(format: PayloadFormat, threshold_bytes: u64) -> Self {
        Self {
            format,
            compressor: StateCompressor::new(),
            compress_over: Some(threshold_bytes),
        }
    }

    pub fn encode(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>> {
        let bytes = self.format.encode(checkpoint)?;
        match self.compress_over {
            Some(threshold) if bytes.len() as u64 >= threshold => {
                Ok(self.compressor.compress(&bytes)?.data)
            }
            _ => Ok(bytes),
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<Checkpoint> {
        let plain = self.compressor.decompress(data)?;
        self.format.decode(&plain)
    }
}

/// Content hash over the identity-bearing fields of a checkpoint.
///
/// Maps are serialized through `serde_json::Value`, which orders keys, so
/// the hash is stable across runs.
pub fn integrity_hash(checkpoint: &Checkpoint) -> Result<String> {
    let canonical = json!({
        "thread_id": checkpoint.thread_id,
        "state_data": checkpoint.state_data,
        "metadata": checkpoint.metadata,
        "checkpoint_type": checkpoint.checkpoint_type,
        "created_at": checkpoint.created_at,
    });
    let bytes = serde_json::to_vec(&canonical)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Pure equality check against a previously recorded hash.
pub fn verify_integrity(checkpoint: &Checkpoint, expected_hash: &str) -> Result<bool> {
    Ok(integrity_hash(checkpoint)? == expected_hash)
}

/// Field-level difference between two state maps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub unchanged: Vec<String>,
}

pub fn diff_states(
    old: &HashMap<String, serde_json::Value>,
    new: &HashMap<String, serde_json::Value>,
) -> StateDiff {
    let mut diff = StateDiff::default();
    for (key, old_value) in old {
        match new.get(key) {
            None => diff.removed.push(key.clone()),
            Some(new_value) if new_value == old_value => diff.unchanged.push(key.clone()),
            Some(_) => diff.modified.push(key.clone()),
        }
    }
    for key in new.keys() {
        if !old.contains_key(key) {
            diff.added.push(key.clone());
        }
    }
    diff.added.sort();
    diff.removed.sort();
    diff.modified.sort();
    diff.unchanged.sort();
    diff
}

/// Creation-rate classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyPattern {
    Burst,
    High,
    Normal,
    Low,
}

impl FrequencyPattern {
    fn classify(per_hour: f64) -> Self {
        if per_hour >= 10.0 {
            Self::Burst
        } else if per_hour >= 4.0 {
            Self::High
        } else if per_hour >= 0.5 {
            Self::Normal
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrequencyAnalysis {
    pub total: usize,
    pub per_hour: f64,
    pub pattern: FrequencyPattern,
}

/// Checkpoints per hour over the observed creation span.
pub fn analyze_frequency(checkpoints: &[Checkpoint]) -> FrequencyAnalysis {
    if checkpoints.is_empty() {
        return FrequencyAnalysis {
            total: 0,
            per_hour: 0.0,
            pattern: FrequencyPattern::Low,
        };
    }

    let newest = checkpoints.iter().map(|cp| cp.created_at).max();
    let oldest = checkpoints.iter().map(|cp| cp.created_at).min();
    let span_hours = match (newest, oldest) {
        (Some(n), Some(o)) => ((n - o).num_seconds() as f64 / 3600.0).max(1.0),
        _ => 1.0,
    };
    let per_hour = checkpoints.len() as f64 / span_hours;

    FrequencyAnalysis {
        total: checkpoints.len(),
        per_hour,
        pattern: FrequencyPattern::classify(per_hour),
    }
}

const SMALL_LIMIT: u64 = 1024;
const MEDIUM_LIMIT: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct SizeDistribution {
    /// < 1 KB
    pub small: usize,
    /// 1 KB .. 1 MB
    pub medium: usize,
    /// >= 1 MB
    pub large: usize,
    pub percent_large: f64,
}

pub fn analyze_sizes(checkpoints: &[Checkpoint]) -> SizeDistribution {
    let mut dist = SizeDistribution::default();
    for cp in checkpoints {
        if cp.size_bytes < SMALL_LIMIT {
            dist.small += 1;
        } else if cp.size_bytes < MEDIUM_LIMIT {
            dist.medium += 1;
        } else {
            dist.large += 1;
        }
    }
    if !checkpoints.is_empty() {
        dist.percent_large = dist.large as f64 / checkpoints.len() as f64 * 100.0;
    }
    dist
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeShare {
    pub count: usize,
    pub percent: f64,
}

pub fn analyze_types(checkpoints: &[Checkpoint]) -> HashMap<String, TypeShare> {
    let mut shares: HashMap<String, TypeShare> = HashMap::new();
    for cp in checkpoints {
        shares
            .entry(cp.checkpoint_type.as_str().to_string())
            .or_default()
            .count += 1;
    }
    let total = checkpoints.len();
    if total > 0 {
        for share in shares.values_mut() {
            share.percent = share.count as f64 / total as f64 * 100.0;
        }
    }
    shares
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SuggestionPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone)]
pub struct OptimizationSuggestion {
    pub category: &'static str,
    pub message: String,
    pub priority: SuggestionPriority,
}

fn expired_ratio(checkpoints: &[Checkpoint]) -> f64 {
    if checkpoints.is_empty() {
        return 0.0;
    }
    let expired = checkpoints.iter().filter(|cp| cp.is_expired()).count();
    expired as f64 / checkpoints.len() as f64
}

/// Rule-based optimization suggestions over a usage snapshot.
pub fn suggest_optimizations(checkpoints: &[Checkpoint]) -> Vec<OptimizationSuggestion> {
    let mut suggestions = Vec::new();
    if checkpoints.is_empty() {
        return suggestions;
    }

    let frequency = analyze_frequency(checkpoints);
    if matches!(frequency.pattern, FrequencyPattern::Burst | FrequencyPattern::High) {
        suggestions.push(OptimizationSuggestion {
            category: "frequency",
            message: format!(
                "checkpoint creation rate is {:.1}/hour; consider widening the checkpoint interval",
                frequency.per_hour
            ),
            priority: SuggestionPriority::High,
        });
    }

    let sizes = analyze_sizes(checkpoints);
    if sizes.percent_large > 20.0 {
        suggestions.push(OptimizationSuggestion {
            category: "size",
            message: format!(
                "{:.0}% of checkpoints exceed 1 MB; enable state compression",
                sizes.percent_large
            ),
            priority: SuggestionPriority::Medium,
        });
    }

    let types = analyze_types(checkpoints);
    if types
        .get(CheckpointType::Auto.as_str())
        .map(|s| s.percent > 80.0)
        .unwrap_or(false)
    {
        suggestions.push(OptimizationSuggestion {
            category: "type-skew",
            message: "over 80% of checkpoints are automatic; review retention settings".to_string(),
            priority: SuggestionPriority::Low,
        });
    }

    if expired_ratio(checkpoints) > 0.3 {
        suggestions.push(OptimizationSuggestion {
            category: "expired",
            message: "over 30% of checkpoints are expired; run a cleanup sweep".to_string(),
            priority: SuggestionPriority::High,
        });
    }

    suggestions
}

/// Health score in `[0, 100]` derived from the suggestion set.
///
/// A snapshot with no checkpoints scores a neutral 50. A high expired
/// ratio caps the score at 60 regardless of other factors.
pub fn health_score(checkpoints: &[Checkpoint]) -> u8 {
    if checkpoints.is_empty() {
        return 50;
    }

    let suggestions = suggest_optimizations(checkpoints);
    let mut score: i64 = 100;
    for suggestion in &suggestions {
        score -= match suggestion.priority {
            SuggestionPriority::High => 20,
            SuggestionPriority::Medium => 10,
            SuggestionPriority::Low => 5,
        };
    }
    let mut score = score.max(0) as u8;
    if expired_ratio(checkpoints) > 0.3 {
        score = score.min(60);
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn checkpoint_with(ty: CheckpointType, size_hint: usize) -> Checkpoint {
        let mut state = HashMap::new();
        state.insert("payload".to_string(), json!("x".repeat(size_hint)));
        Checkpoint::new("t1", "", ty, state)
    }

    #[test]
    fn test_compress_round_trip_and_ratio() {
        let compressor = StateCompressor::new();
        let data = "abcabcabc".repeat(200).into_bytes();

        let outcome = compressor.compress(&data).unwrap();
        assert!(StateCompressor::is_compressed(&outcome.data));
        assert!(outcome.compressed_size < outcome.original_size);
        assert!(outcome.ratio < 1.0);

        let restored = compressor.decompress(&outcome.data).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_decompress_passes_through_plain_data() {
        let compressor = StateCompressor::new();
        let plain = b"not compressed at all".to_vec();
        assert_eq!(compressor.decompress(&plain).unwrap(), plain);
    }

    #[test]
    fn test_snapshot_codec_compresses_above_threshold_only() {
        let codec = SnapshotCodec::with_compression(PayloadFormat::Json, 512);

        let small = checkpoint_with(CheckpointType::Manual, 8);
        let encoded = codec.encode(&small).unwrap();
        assert!(!StateCompressor::is_compressed(&encoded));
        assert_eq!(codec.decode(&encoded).unwrap().id, small.id);

        let large = checkpoint_with(CheckpointType::Manual, 4096);
        let encoded = codec.encode(&large).unwrap();
        assert!(StateCompressor::is_compressed(&encoded));
        let restored = codec.decode(&encoded).unwrap();
        assert_eq!(restored.id, large.id);
        assert_eq!(restored.state_data, large.state_data);
    }

    #[test]
    fn test_snapshot_codec_without_compression_round_trips() {
        let codec = SnapshotCodec::new(PayloadFormat::Bincode);
        let cp = checkpoint_with(CheckpointType::Auto, 4096);
        let encoded = codec.encode(&cp).unwrap();
        assert!(!StateCompressor::is_compressed(&encoded));
        assert_eq!(codec.decode(&encoded).unwrap().id, cp.id);
    }

    #[test]
    fn test_integrity_hash_is_stable_and_detects_change() {
        let cp = checkpoint_with(CheckpointType::Manual, 16);
        let hash = integrity_hash(&cp).unwrap();
        assert_eq!(integrity_hash(&cp).unwrap(), hash);
        assert!(verify_integrity(&cp, &hash).unwrap());

        let mut tampered = cp.clone();
        tampered.state_data.insert("extra".to_string(), json!(1));
        assert!(!verify_integrity(&tampered, &hash).unwrap());
    }

    #[test]
    fn test_diff_states() {
        let old: HashMap<String, serde_json::Value> = [
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!(2)),
            ("c".to_string(), json!(3)),
        ]
        .into_iter()
        .collect();
        let new: HashMap<String, serde_json::Value> = [
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!(20)),
            ("d".to_string(), json!(4)),
        ]
        .into_iter()
        .collect();

        let diff = diff_states(&old, &new);
        assert_eq!(diff.unchanged, vec!["a"]);
        assert_eq!(diff.modified, vec!["b"]);
        assert_eq!(diff.removed, vec!["c"]);
        assert_eq!(diff.added, vec!["d"]);
    }

    #[test]
    fn test_frequency_classification() {
        assert_eq!(FrequencyPattern::classify(12.0), FrequencyPattern::Burst);
        assert_eq!(FrequencyPattern::classify(5.0), FrequencyPattern::High);
        assert_eq!(FrequencyPattern::classify(1.0), FrequencyPattern::Normal);
        assert_eq!(FrequencyPattern::classify(0.1), FrequencyPattern::Low);

        let mut burst = Vec::new();
        for i in 0..30 {
            let mut cp = checkpoint_with(CheckpointType::Auto, 4);
            cp.created_at = Utc::now() - Duration::minutes(i);
            burst.push(cp);
        }
        let analysis = analyze_frequency(&burst);
        assert_eq!(analysis.pattern, FrequencyPattern::Burst);
    }

    #[test]
    fn test_size_buckets() {
        let checkpoints = vec![
            checkpoint_with(CheckpointType::Auto, 10),
            checkpoint_with(CheckpointType::Auto, 4 * 1024),
            checkpoint_with(CheckpointType::Auto, 2 * 1024 * 1024),
        ];
        let dist = analyze_sizes(&checkpoints);
        assert_eq!(dist.small, 1);
        assert_eq!(dist.medium, 1);
        assert_eq!(dist.large, 1);
        assert!((dist.percent_large - 33.33).abs() < 0.5);
    }

    #[test]
    fn test_suggestions_and_health_score() {
        assert_eq!(health_score(&[]), 50);

        // Quiet usage: a handful of old manual checkpoints, no findings.
        let mut quiet = Vec::new();
        for i in 0..3 {
            let mut cp = checkpoint_with(CheckpointType::Manual, 16);
            cp.created_at = Utc::now() - Duration::days(i + 1);
            quiet.push(cp);
        }
        assert!(suggest_optimizations(&quiet).is_empty());
        assert_eq!(health_score(&quiet), 100);

        // Mostly expired auto checkpoints trip the expired and skew rules.
        let mut noisy = Vec::new();
        for i in 0..10 {
            let mut cp = checkpoint_with(CheckpointType::Auto, 16);
            cp.created_at = Utc::now() - Duration::days(2) - Duration::hours(i);
            cp.expires_at = Some(Utc::now() - Duration::hours(1));
            noisy.push(cp);
        }
        let suggestions = suggest_optimizations(&noisy);
        assert!(suggestions.iter().any(|s| s.category == "expired"));
        assert!(suggestions.iter().any(|s| s.category == "type-skew"));
        assert!(health_score(&noisy) <= 60);
    }
}
