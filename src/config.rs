//! QFAC engine configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main QFAC engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Encoder configuration
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Replay configuration
    #[serde(default)]
    pub replay: ReplayConfig,

    /// Hierarchy builder configuration
    #[serde(default)]
    pub hierarchy: HierarchyConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Similarity metric used by this engine instance.
    /// Fixed for the lifetime of the engine; one instance never mixes metrics.
    #[serde(default)]
    pub metric: MetricKind,
}

/// Similarity metric selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Normalized edit distance (1 - Levenshtein / max length), suited to text
    #[default]
    NormalizedEdit,
    /// Longest-common-subsequence ratio, suited to binary payloads
    LcsRatio,
}

/// Fractal encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Minimum similarity for a pattern to count as a match (0.0 - 1.0)
    pub similarity_threshold: f64,

    /// Candidates are not split below this many content units
    pub min_block_size: usize,

    /// Register a composite pattern when a fragment encodes entirely
    /// into pattern references, so repeats compress to a single reference
    pub promote_composites: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            min_block_size: 16,
            promote_composites: true,
        }
    }
}

/// Replay engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Maximum number of cached reconstructions (strict LRU eviction)
    pub cache_capacity: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 256,
        }
    }
}

/// Hierarchy builder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyConfig {
    /// Minimum average pairwise similarity for two clusters to merge (0.0 - 1.0)
    pub merge_threshold: f64,

    /// Clusters smaller than this stay ungrouped
    pub min_cluster_size: usize,

    /// Maximum number of hierarchy levels to build
    pub max_levels: u32,

    /// Cluster fingerprints are capped at this many content units
    pub fingerprint_cap: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            merge_threshold: 0.6,
            min_cluster_size: 3,
            max_levels: 4,
            fingerprint_cap: 256,
        }
    }
}

/// Pattern storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Maximum number of patterns the store accepts (0 = unbounded)
    pub max_patterns: usize,

    /// Directory for persisted patterns, episodes, and clusters.
    /// None disables persistence entirely.
    pub data_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Validate configured values, rejecting ranges the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.encoder.similarity_threshold) {
            return Err(Error::Config(format!(
                "encoder.similarity_threshold {} outside [0.0, 1.0]",
                self.encoder.similarity_threshold
            )));
        }
        if self.encoder.min_block_size == 0 {
            return Err(Error::Config(
                "encoder.min_block_size must be at least 1".to_string(),
            ));
        }
        if self.replay.cache_capacity == 0 {
            return Err(Error::Config(
                "replay.cache_capacity must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.hierarchy.merge_threshold) {
            return Err(Error::Config(format!(
                "hierarchy.merge_threshold {} outside [0.0, 1.0]",
                self.hierarchy.merge_threshold
            )));
        }
        if self.hierarchy.min_cluster_size < 2 {
            return Err(Error::Config(
                "hierarchy.min_cluster_size must be at least 2".to_string(),
            ));
        }
        if self.hierarchy.max_levels == 0 {
            return Err(Error::Config(
                "hierarchy.max_levels must be at least 1".to_string(),
            ));
        }
        if self.hierarchy.fingerprint_cap == 0 {
            return Err(Error::Config(
                "hierarchy.fingerprint_cap must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
