//! Hierarchy cluster type
//!
//! Clusters group related patterns level by level. Level 1 sits directly
//! above the patterns; higher levels group the clusters beneath them. A
//! cluster's ID is derived from its level and sorted membership, so two
//! rebuilds that agree on membership agree on every ID.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A group of related patterns at one hierarchy level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Deterministic cluster identifier
    pub id: u64,
    /// Hierarchy level (1 = first grouping above leaf patterns)
    pub level: u32,
    /// Sorted IDs of every pattern under this cluster
    pub member_pattern_ids: Vec<u64>,
    /// Average pairwise similarity among members, in [0.0, 1.0]
    pub coherence: f64,
    /// Cluster one level up that absorbed this one, if any
    pub parent_id: Option<u64>,
    /// Direct children one level down (empty at level 1)
    pub child_cluster_ids: Vec<u64>,
}

impl Cluster {
    /// Create a cluster over `members`, sorting them and deriving the ID
    pub fn new(level: u32, mut members: Vec<u64>, coherence: f64) -> Self {
        members.sort_unstable();
        members.dedup();
        let id = Self::derive_id(level, &members);
        Self {
            id,
            level,
            member_pattern_ids: members,
            coherence: coherence.clamp(0.0, 1.0),
            parent_id: None,
            child_cluster_ids: Vec::new(),
        }
    }

    /// First 8 bytes of SHA-256 over the level and sorted member IDs
    pub fn derive_id(level: u32, sorted_members: &[u64]) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(level.to_le_bytes());
        for member in sorted_members {
            hasher.update(member.to_le_bytes());
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(bytes)
    }

    /// Number of member patterns
    pub fn size(&self) -> usize {
        self.member_pattern_ids.len()
    }
}
