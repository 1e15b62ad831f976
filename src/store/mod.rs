//! Pattern store
//!
//! The store owns every pattern and the currently installed cluster set.
//! Patterns are shared mutable state guarded by `tokio::sync::RwLock`:
//! reads clone values out, writes hold the lock only long enough to apply
//! one operation. Insert-if-absent runs entirely under one exclusive
//! section keyed by a SHA-256 content hash, so two concurrent inserts of
//! identical content always converge on one pattern.
//!
//! The cluster set is kept behind its own lock as an `Arc` snapshot:
//! readers clone the `Arc` and iterate without holding anything, and a
//! rebuild installs its result with a single pointer swap, so a torn
//! cluster set cannot be observed.

use crate::error::{Error, Result};
use crate::fragment::{Content, ContentUnits};
use crate::hierarchy::cluster::Cluster;
use crate::pattern::{Pattern, PatternBody};
use crate::similarity::SimilarityMetric;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod persist;

/// A similarity search hit, ordered by the store before return
#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    /// Matched pattern ID
    pub pattern_id: u64,
    /// Similarity score in [0.0, 1.0]
    pub similarity: f64,
}

/// One pattern staged by an encode call, not yet visible to other callers
#[derive(Debug, Clone)]
pub struct StagedPattern {
    /// ID reserved for this pattern; the commit may remap it if an
    /// identical pattern landed concurrently
    pub provisional_id: u64,
    /// Canonical body (composite children may name provisional IDs)
    pub body: PatternBody,
    /// Fractal depth of the staged pattern
    pub depth: u32,
    /// Fully resolved content of the staged pattern
    pub resolved: Content,
}

/// Everything one encode call asks the store to apply atomically
#[derive(Debug, Clone)]
pub struct EncodeCommit {
    /// Fragment the encode observed
    pub fragment_id: String,
    /// New patterns in staging order (children before composites)
    pub staged: Vec<StagedPattern>,
    /// Referenced pattern IDs, one entry per reference (may repeat, may
    /// name provisional IDs)
    pub touched: Vec<u64>,
}

struct StoreInner {
    patterns: HashMap<u64, Pattern>,
    /// Body identity -> pattern ID (dedup index)
    by_body: HashMap<[u8; 32], u64>,
    /// Resolved content -> IDs of every pattern resolving to it. A literal
    /// and a composite can resolve identically, so this is a multimap.
    by_resolved: HashMap<[u8; 32], Vec<u64>>,
    /// Cached resolved content for composite patterns
    resolved_composites: HashMap<u64, Content>,
    /// IDs created or updated since the last `take_dirty` drain
    dirty: HashSet<u64>,
}

impl StoreInner {
    fn empty() -> Self {
        Self {
            patterns: HashMap::new(),
            by_body: HashMap::new(),
            by_resolved: HashMap::new(),
            resolved_composites: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    fn resolved_of<'a>(&'a self, pattern: &'a Pattern) -> Option<&'a Content> {
        match &pattern.body {
            PatternBody::Literal(content) => Some(content),
            PatternBody::Composite(_) => self.resolved_composites.get(&pattern.id),
        }
    }

    /// Insert a fully-built pattern, updating every index
    fn index_insert(&mut self, pattern: Pattern, resolved: Content) {
        let id = pattern.id;
        self.by_body.insert(pattern.body.content_hash(), id);
        self.by_resolved
            .entry(content_hash(&resolved))
            .or_default()
            .push(id);
        if pattern.body.is_composite() {
            self.resolved_composites.insert(id, resolved);
        }
        self.patterns.insert(id, pattern);
    }
}

/// Thread-safe store for patterns and the installed hierarchy
pub struct PatternStore {
    inner: Arc<RwLock<StoreInner>>,
    clusters: Arc<RwLock<Arc<Vec<Cluster>>>>,
    next_id: AtomicU64,
    metric: Arc<dyn SimilarityMetric>,
    /// 0 = unbounded
    max_patterns: usize,
}

impl PatternStore {
    /// Create an empty store using `metric` for similarity search
    pub fn new(metric: Arc<dyn SimilarityMetric>, max_patterns: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner::empty())),
            clusters: Arc::new(RwLock::new(Arc::new(Vec::new()))),
            next_id: AtomicU64::new(1),
            metric,
            max_patterns,
        }
    }

    /// Reserve a pattern ID. Reserved IDs are never reused, even when the
    /// staged pattern they were minted for dedups away at commit time.
    pub(crate) fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Insert a literal pattern if absent, keyed by content identity.
    /// Present content increments the existing pattern's frequency instead.
    /// Returns the canonical pattern ID either way.
    pub async fn put_pattern(&self, content: Content, observed_in: Option<&str>) -> Result<u64> {
        if content.is_empty() {
            return Err(Error::InvalidFragment(
                "pattern content must be non-empty".to_string(),
            ));
        }
        let body = PatternBody::Literal(content.clone());
        let body_hash = body.content_hash();

        let mut inner = self.inner.write().await;
        if let Some(&existing) = inner.by_body.get(&body_hash) {
            if let Some(pattern) = inner.patterns.get_mut(&existing) {
                match observed_in {
                    Some(fragment_id) => pattern.record_observation(fragment_id),
                    None => pattern.frequency += 1,
                }
            }
            inner.dirty.insert(existing);
            return Ok(existing);
        }

        self.check_capacity(&inner, 1)?;
        let id = self.allocate_id();
        let pattern = Pattern::literal(id, content.clone(), observed_in);
        inner.index_insert(pattern, content);
        inner.dirty.insert(id);
        Ok(id)
    }

    /// Insert a composite pattern over already-stored children.
    /// Depth and resolved content derive from the children, which keeps
    /// composition depth strictly increasing and therefore cycle-free.
    pub async fn put_composite(
        &self,
        children: Vec<u64>,
        observed_in: Option<&str>,
    ) -> Result<u64> {
        if children.is_empty() {
            return Err(Error::InvalidFragment(
                "composite pattern requires at least one child".to_string(),
            ));
        }
        let mut inner = self.inner.write().await;

        let mut depth = 0u32;
        let mut parts: Vec<Content> = Vec::with_capacity(children.len());
        for child in &children {
            let pattern = inner
                .patterns
                .get(child)
                .ok_or(Error::DanglingPatternRef(*child))?;
            depth = depth.max(pattern.depth + 1);
            let resolved = inner
                .resolved_of(pattern)
                .ok_or(Error::DanglingPatternRef(*child))?;
            parts.push(resolved.clone());
        }
        let resolved = concat_contents(&parts)
            .ok_or_else(|| Error::InvalidFragment("composite mixes content kinds".to_string()))?;

        let body = PatternBody::Composite(children.clone());
        let body_hash = body.content_hash();
        if let Some(&existing) = inner.by_body.get(&body_hash) {
            if let Some(pattern) = inner.patterns.get_mut(&existing) {
                match observed_in {
                    Some(fragment_id) => pattern.record_observation(fragment_id),
                    None => pattern.frequency += 1,
                }
            }
            inner.dirty.insert(existing);
            return Ok(existing);
        }

        self.check_capacity(&inner, 1)?;
        let id = self.allocate_id();
        let pattern = Pattern::composite(id, children, depth, resolved.unit_len(), observed_in);
        inner.index_insert(pattern, resolved);
        inner.dirty.insert(id);
        Ok(id)
    }

    /// Retrieve a pattern by ID
    pub async fn get_pattern(&self, id: u64) -> Result<Pattern> {
        self.inner
            .read()
            .await
            .patterns
            .get(&id)
            .cloned()
            .ok_or(Error::DanglingPatternRef(id))
    }

    /// Fully resolved content of a pattern
    pub async fn resolved_content(&self, id: u64) -> Result<Content> {
        let inner = self.inner.read().await;
        let pattern = inner.patterns.get(&id).ok_or(Error::DanglingPatternRef(id))?;
        inner
            .resolved_of(pattern)
            .cloned()
            .ok_or(Error::DanglingPatternRef(id))
    }

    /// ID of the pattern whose resolved content is exactly `content`, if
    /// any. When several patterns resolve to the same content, the most
    /// frequent wins, ties broken by lowest ID.
    pub async fn find_exact(&self, content: &Content) -> Option<u64> {
        let inner = self.inner.read().await;
        let ids = inner.by_resolved.get(&content_hash(content))?;
        ids.iter()
            .filter_map(|id| inner.patterns.get(id))
            .max_by_key(|p| (p.frequency, std::cmp::Reverse(p.id)))
            .map(|p| p.id)
    }

    /// All patterns whose resolved content scores at least `threshold`
    /// against `content`, ordered by similarity descending, ties broken by
    /// higher frequency, then lower pattern ID. The ordering is fully
    /// deterministic for a given store state.
    pub async fn find_similar(&self, content: &Content, threshold: f64) -> Vec<PatternMatch> {
        let inner = self.inner.read().await;
        let query_len = content.unit_len();

        let mut hits: Vec<(PatternMatch, u64)> = Vec::new();
        for pattern in inner.patterns.values() {
            if self.metric.length_bound(query_len, pattern.resolved_len) < threshold {
                continue;
            }
            let resolved = match inner.resolved_of(pattern) {
                Some(resolved) => resolved,
                None => continue,
            };
            let similarity = self.metric.score(content, resolved);
            if similarity >= threshold {
                hits.push((
                    PatternMatch {
                        pattern_id: pattern.id,
                        similarity,
                    },
                    pattern.frequency,
                ));
            }
        }

        hits.sort_by(|(a, freq_a), (b, freq_b)| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| freq_b.cmp(freq_a))
                .then_with(|| a.pattern_id.cmp(&b.pattern_id))
        });
        hits.into_iter().map(|(hit, _)| hit).collect()
    }

    /// Apply one encode call's staged patterns and reference updates in a
    /// single exclusive section. Nothing is applied when the capacity check
    /// fails, so an encode is all-or-nothing. Returns the final ID for each
    /// provisional ID (identity unless an identical pattern already landed).
    pub async fn commit_encode(&self, commit: EncodeCommit) -> Result<HashMap<u64, u64>> {
        let mut inner = self.inner.write().await;
        let mut remap: HashMap<u64, u64> = HashMap::new();

        // Resolve staged bodies against the live store first; only then is
        // the number of genuinely new patterns known for the capacity check.
        let mut inserts: Vec<(Pattern, Content)> = Vec::new();
        let mut dedup_hits: Vec<u64> = Vec::new();
        for staged in commit.staged {
            let body = match staged.body {
                PatternBody::Literal(content) => PatternBody::Literal(content),
                PatternBody::Composite(children) => PatternBody::Composite(
                    children
                        .into_iter()
                        .map(|child| remap.get(&child).copied().unwrap_or(child))
                        .collect(),
                ),
            };
            if let Some(&existing) = inner.by_body.get(&body.content_hash()) {
                remap.insert(staged.provisional_id, existing);
                dedup_hits.push(existing);
                continue;
            }
            // Pending inserts from this same commit cannot collide with each
            // other: the encoder dedups its own staging by content.
            remap.insert(staged.provisional_id, staged.provisional_id);
            let pattern = match &body {
                PatternBody::Literal(content) => Pattern::literal(
                    staged.provisional_id,
                    content.clone(),
                    Some(commit.fragment_id.as_str()),
                ),
                PatternBody::Composite(children) => Pattern::composite(
                    staged.provisional_id,
                    children.clone(),
                    staged.depth,
                    staged.resolved.unit_len(),
                    Some(commit.fragment_id.as_str()),
                ),
            };
            inserts.push((pattern, staged.resolved));
        }

        // Validate every touch up front so a failure leaves the store as it was
        for id in &commit.touched {
            let final_id = remap.get(id).copied().unwrap_or(*id);
            let pending = inserts.iter().any(|(p, _)| p.id == final_id);
            if !pending && !inner.patterns.contains_key(&final_id) {
                return Err(Error::DanglingPatternRef(final_id));
            }
        }
        self.check_capacity(&inner, inserts.len())?;

        for (pattern, resolved) in inserts {
            inner.dirty.insert(pattern.id);
            inner.index_insert(pattern, resolved);
        }
        for existing in dedup_hits {
            if let Some(pattern) = inner.patterns.get_mut(&existing) {
                pattern.record_observation(&commit.fragment_id);
            }
            inner.dirty.insert(existing);
        }
        for id in commit.touched {
            let final_id = remap.get(&id).copied().unwrap_or(id);
            let pattern = inner
                .patterns
                .get_mut(&final_id)
                .ok_or(Error::DanglingPatternRef(final_id))?;
            pattern.record_observation(&commit.fragment_id);
            inner.dirty.insert(final_id);
        }
        Ok(remap)
    }

    /// Replace the whole installed cluster set in one pointer swap
    pub async fn replace_clusters(&self, clusters: Vec<Cluster>) {
        let mut guard = self.clusters.write().await;
        *guard = Arc::new(clusters);
    }

    /// Snapshot of the installed cluster set. The snapshot stays coherent
    /// even if a rebuild swaps in a new set mid-iteration.
    pub async fn clusters(&self) -> Arc<Vec<Cluster>> {
        self.clusters.read().await.clone()
    }

    /// Number of stored patterns
    pub async fn pattern_count(&self) -> usize {
        self.inner.read().await.patterns.len()
    }

    /// Number of installed clusters across all levels
    pub async fn cluster_count(&self) -> usize {
        self.clusters.read().await.len()
    }

    /// Clone out every pattern, sorted by ID
    pub async fn all_patterns(&self) -> Vec<Pattern> {
        let inner = self.inner.read().await;
        let mut patterns: Vec<Pattern> = inner.patterns.values().cloned().collect();
        patterns.sort_by_key(|p| p.id);
        patterns
    }

    /// `(id, resolved content)` for every pattern, sorted by ID
    pub async fn resolved_snapshot(&self) -> Vec<(u64, Content)> {
        let inner = self.inner.read().await;
        let mut snapshot: Vec<(u64, Content)> = inner
            .patterns
            .values()
            .filter_map(|p| inner.resolved_of(p).map(|c| (p.id, c.clone())))
            .collect();
        snapshot.sort_by_key(|(id, _)| *id);
        snapshot
    }

    /// Drain and return every pattern created or updated since the last
    /// drain, sorted by ID. Used by persistence flushes so only changed
    /// patterns hit the disk.
    pub async fn take_dirty(&self) -> Vec<Pattern> {
        let mut inner = self.inner.write().await;
        let ids: Vec<u64> = inner.dirty.drain().collect();
        let mut patterns: Vec<Pattern> = ids
            .into_iter()
            .filter_map(|id| inner.patterns.get(&id).cloned())
            .collect();
        patterns.sort_by_key(|p| p.id);
        patterns
    }

    /// Replace store contents with restored pattern records.
    ///
    /// Records are validated before anything is installed: every composite
    /// child must be present (`DanglingPatternRef`) and composition depth
    /// must strictly increase (`CyclicPattern`), which rejects reference
    /// cycles no matter what the records claim. Returns the number of
    /// installed patterns.
    pub async fn install_patterns(&self, mut records: Vec<Pattern>) -> Result<usize> {
        records.sort_by_key(|p| (p.depth, p.id));
        let ids: std::collections::HashSet<u64> = records.iter().map(|p| p.id).collect();

        let mut rebuilt = StoreInner::empty();
        let mut max_id = 0u64;
        for mut record in records {
            max_id = max_id.max(record.id);
            let resolved = match &record.body {
                PatternBody::Literal(content) => content.clone(),
                PatternBody::Composite(children) => {
                    if children.is_empty() {
                        return Err(Error::CyclicPattern(record.id));
                    }
                    let mut depth = 0u32;
                    let mut parts: Vec<Content> = Vec::with_capacity(children.len());
                    for child in children {
                        let child_pattern = match rebuilt.patterns.get(child) {
                            Some(p) => p,
                            // Present in the record set but not yet installed
                            // in depth order means the depth claim is wrong,
                            // which is exactly what a cycle looks like.
                            None if ids.contains(child) => {
                                return Err(Error::CyclicPattern(record.id))
                            }
                            None => return Err(Error::DanglingPatternRef(*child)),
                        };
                        depth = depth.max(child_pattern.depth + 1);
                        let child_resolved = rebuilt
                            .resolved_of(child_pattern)
                            .ok_or(Error::DanglingPatternRef(*child))?;
                        parts.push(child_resolved.clone());
                    }
                    if depth != record.depth {
                        return Err(Error::CyclicPattern(record.id));
                    }
                    concat_contents(&parts).ok_or_else(|| {
                        Error::Persistence(format!(
                            "composite pattern {} mixes content kinds",
                            record.id
                        ))
                    })?
                }
            };
            record.resolved_len = resolved.unit_len();
            rebuilt.index_insert(record, resolved);
        }

        let count = rebuilt.patterns.len();
        let mut inner = self.inner.write().await;
        *inner = rebuilt;
        self.next_id.store(max_id + 1, Ordering::SeqCst);
        Ok(count)
    }

    fn check_capacity(&self, inner: &StoreInner, incoming: usize) -> Result<()> {
        if self.max_patterns > 0 && inner.patterns.len() + incoming > self.max_patterns {
            return Err(Error::StorageExhausted {
                capacity: self.max_patterns,
            });
        }
        Ok(())
    }
}

pub(crate) fn content_hash(content: &Content) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(content.canonical_bytes());
    hasher.finalize().into()
}

/// Concatenate same-kind contents; None when kinds mix
fn concat_contents(parts: &[Content]) -> Option<Content> {
    let first = parts.first()?;
    let mut out = ContentUnits::empty(first.kind());
    for part in parts {
        if !out.push_content(part) {
            return None;
        }
    }
    Some(out.into_content())
}
