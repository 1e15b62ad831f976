//! Pattern data types
//!
//! Patterns are the shared vocabulary episodes compress against. A pattern is
//! either a literal span of canonical content or a composite built from
//! previously stored patterns, and its fractal depth records how many
//! composition levels sit beneath it (0 = literal). Canonical content never
//! changes after insert; only the frequency counter and the observation set
//! move, and both only grow.

use crate::fragment::Content;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Canonical body of a pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternBody {
    /// A literal span of content (depth 0)
    Literal(Content),
    /// Ordered child pattern IDs this pattern is composed of
    Composite(Vec<u64>),
}

impl PatternBody {
    /// SHA-256 over the canonical body encoding. Identical content always
    /// hashes identically, which is what the store's dedup index keys on.
    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        match self {
            PatternBody::Literal(content) => {
                hasher.update([0u8]);
                hasher.update(content.canonical_bytes());
            }
            PatternBody::Composite(children) => {
                hasher.update([1u8]);
                for child in children {
                    hasher.update(child.to_le_bytes());
                }
            }
        }
        hasher.finalize().into()
    }

    /// Whether this body is a composite of other patterns
    pub fn is_composite(&self) -> bool {
        matches!(self, PatternBody::Composite(_))
    }
}

/// A stored pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    /// Unique pattern identifier, assigned sequentially by the store
    pub id: u64,
    /// Canonical body, immutable after insert
    pub body: PatternBody,
    /// How often this pattern has been observed (creation counts once)
    pub frequency: u64,
    /// Fractal depth: 0 for literals, 1 + max child depth for composites
    pub depth: u32,
    /// Unit length of the fully resolved content
    pub resolved_len: usize,
    /// Fragment IDs this pattern has been observed in
    pub observed_in: HashSet<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Pattern {
    /// Construct a depth-0 literal pattern, optionally attributed to the
    /// fragment it was first observed in
    pub fn literal(id: u64, content: Content, observed_in: Option<&str>) -> Self {
        let resolved_len = content.unit_len();
        Self {
            id,
            body: PatternBody::Literal(content),
            frequency: 1,
            depth: 0,
            resolved_len,
            observed_in: observed_in.map(String::from).into_iter().collect(),
            created_at: Utc::now(),
        }
    }

    /// Construct a composite pattern. Depth and resolved length come from the
    /// already-stored children, so the store computes them.
    pub fn composite(
        id: u64,
        children: Vec<u64>,
        depth: u32,
        resolved_len: usize,
        observed_in: Option<&str>,
    ) -> Self {
        Self {
            id,
            body: PatternBody::Composite(children),
            frequency: 1,
            depth,
            resolved_len,
            observed_in: observed_in.map(String::from).into_iter().collect(),
            created_at: Utc::now(),
        }
    }

    /// Record one observation in `fragment_id`: bumps frequency and extends
    /// the observation set. The canonical body is untouched.
    pub fn record_observation(&mut self, fragment_id: impl Into<String>) {
        self.frequency += 1;
        self.observed_in.insert(fragment_id.into());
    }

    /// Literal content, if this is a depth-0 pattern
    pub fn literal_content(&self) -> Option<&Content> {
        match &self.body {
            PatternBody::Literal(content) => Some(content),
            PatternBody::Composite(_) => None,
        }
    }
}
