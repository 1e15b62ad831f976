//! Fractal encoder
//!
//! Turns memory fragments into episodes through a left-to-right scan with
//! recursive candidate splitting. At each position the candidate is the
//! whole remaining span; while no stored or staged pattern resolves to
//! exactly the candidate, its length is halved (rounding up) until it
//! reaches the minimum block size. Stored matches are ranked by the
//! similarity search at the configured threshold, and only a hit that
//! resolves to exactly the candidate is substituted, so an episode always
//! reconstructs its original content. A candidate that still has no match
//! becomes a literal and is registered as a new pattern, so later spans of
//! the same fragment can already reference it. A fragment that collapses
//! entirely into references is promoted to a composite pattern one level
//! above its deepest child, which lets a later repeat of the whole fragment
//! compress to a single reference.
//!
//! Every new pattern and every frequency update is staged locally and
//! applied through one exclusive store commit at the end, so a failed
//! encode leaves the store exactly as it was.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::EncoderConfig;
use crate::episode::{Episode, EpisodeElement};
use crate::error::Result;
use crate::fragment::{Content, MemoryFragment};
use crate::pattern::PatternBody;
use crate::store::{content_hash, EncodeCommit, PatternStore, StagedPattern};

/// Encodes fragments against a shared pattern store.
pub struct FractalEncoder {
    store: Arc<PatternStore>,
    config: EncoderConfig,
}

/// Per-encode staging state. Nothing in here is visible to other callers
/// until the final commit.
struct EncodeSession {
    staged: Vec<StagedPattern>,
    /// Resolved-content hash -> provisional ID, so repeats within one
    /// fragment reference the same staged pattern
    staged_by_content: HashMap<[u8; 32], u64>,
    /// Provisional ID -> fractal depth
    staged_depths: HashMap<u64, u32>,
    /// One entry per emitted reference
    touched: Vec<u64>,
}

impl EncodeSession {
    fn new() -> Self {
        Self {
            staged: Vec::new(),
            staged_by_content: HashMap::new(),
            staged_depths: HashMap::new(),
            touched: Vec::new(),
        }
    }

    /// Find a pattern to substitute for `candidate`, preferring the store
    /// over this session's staging. Candidates are ranked by the similarity
    /// search at the configured threshold, but only the top hit resolving
    /// to exactly the candidate may be substituted: an episode element
    /// carries no residual, so a merely-similar pattern could not
    /// reconstruct the original content.
    async fn lookup(
        &self,
        store: &PatternStore,
        candidate: &Content,
        threshold: f64,
    ) -> Option<u64> {
        if let Some(best) = store.find_similar(candidate, threshold).await.first() {
            if best.similarity >= 1.0 {
                return Some(best.pattern_id);
            }
        }
        self.staged_by_content
            .get(&content_hash(candidate))
            .copied()
    }

    fn stage_literal(&mut self, store: &PatternStore, content: Content) -> u64 {
        let id = store.allocate_id();
        self.staged_by_content.insert(content_hash(&content), id);
        self.staged_depths.insert(id, 0);
        self.staged.push(StagedPattern {
            provisional_id: id,
            body: PatternBody::Literal(content.clone()),
            depth: 0,
            resolved: content,
        });
        id
    }

    fn stage_composite(
        &mut self,
        store: &PatternStore,
        children: Vec<u64>,
        depth: u32,
        resolved: Content,
    ) -> u64 {
        let id = store.allocate_id();
        self.staged_depths.insert(id, depth);
        self.staged.push(StagedPattern {
            provisional_id: id,
            body: PatternBody::Composite(children),
            depth,
            resolved,
        });
        id
    }

    /// Depth of a child that may be staged or already stored
    async fn depth_of(&self, store: &PatternStore, id: u64) -> Result<u32> {
        if let Some(depth) = self.staged_depths.get(&id) {
            return Ok(*depth);
        }
        Ok(store.get_pattern(id).await?.depth)
    }
}

impl FractalEncoder {
    pub fn new(store: Arc<PatternStore>, config: EncoderConfig) -> Self {
        Self { store, config }
    }

    /// Encode one fragment into an episode.
    ///
    /// Deterministic for a given store state: the same fragment (ID,
    /// content, and timestamp) yields a byte-identical episode. An empty
    /// fragment yields an episode with no elements and ratio 1.0. A
    /// fragment shorter than the minimum block size becomes a single
    /// literal, registered as a pattern without any match search.
    pub async fn encode(&self, fragment: &MemoryFragment) -> Result<Episode> {
        fragment.validate()?;

        let canonical = fragment.canonical_content();
        let units = canonical.to_units();
        let total = units.len();
        if total == 0 {
            return Ok(self.finish(fragment, &canonical, Vec::new(), 0));
        }

        let mut session = EncodeSession::new();
        let mut elements = Vec::new();

        if total < self.config.min_block_size {
            session.stage_literal(&self.store, canonical.clone());
            elements.push(EpisodeElement::Literal {
                content: canonical.clone(),
                position: 0,
            });
        } else {
            let mut position = 0;
            while position < total {
                let mut span = total - position;
                loop {
                    let candidate = units.slice(position, position + span);
                    if let Some(pattern_id) = session
                        .lookup(&self.store, &candidate, self.config.similarity_threshold)
                        .await
                    {
                        session.touched.push(pattern_id);
                        elements.push(EpisodeElement::PatternRef {
                            pattern_id,
                            position,
                            span,
                        });
                        break;
                    }
                    if span > self.config.min_block_size {
                        // Rounding up keeps the candidate nonempty and lets
                        // an uneven tail still cover the minimum block
                        span = (span + 1) / 2;
                        continue;
                    }
                    session.stage_literal(&self.store, candidate.clone());
                    elements.push(EpisodeElement::Literal {
                        content: candidate,
                        position,
                    });
                    break;
                }
                position += span;
            }

            if self.config.promote_composites {
                self.promote(&mut session, &elements, &canonical).await?;
            }
        }

        let remap = self
            .store
            .commit_encode(EncodeCommit {
                fragment_id: fragment.id.clone(),
                staged: session.staged,
                touched: session.touched,
            })
            .await?;
        for element in &mut elements {
            if let EpisodeElement::PatternRef { pattern_id, .. } = element {
                if let Some(final_id) = remap.get(pattern_id) {
                    *pattern_id = *final_id;
                }
            }
        }

        let episode = self.finish(fragment, &canonical, elements, total);
        debug!(
            fragment_id = %fragment.id,
            episode_id = %episode.id,
            elements = episode.elements.len(),
            ratio = episode.compression_ratio,
            "encoded fragment"
        );
        Ok(episode)
    }

    /// Stage a composite over the episode's children when every element is
    /// a reference and there are at least two of them.
    async fn promote(
        &self,
        session: &mut EncodeSession,
        elements: &[EpisodeElement],
        canonical: &Content,
    ) -> Result<()> {
        if elements.len() < 2 {
            return Ok(());
        }
        let mut children = Vec::with_capacity(elements.len());
        for element in elements {
            match element {
                EpisodeElement::PatternRef { pattern_id, .. } => children.push(*pattern_id),
                EpisodeElement::Literal { .. } => return Ok(()),
            }
        }
        let mut max_child_depth = 0;
        for child in &children {
            max_child_depth = max_child_depth.max(session.depth_of(&self.store, *child).await?);
        }
        session.stage_composite(
            &self.store,
            children,
            max_child_depth + 1,
            canonical.clone(),
        );
        Ok(())
    }

    fn finish(
        &self,
        fragment: &MemoryFragment,
        canonical: &Content,
        elements: Vec<EpisodeElement>,
        original_length: usize,
    ) -> Episode {
        let mut episode = Episode {
            id: Episode::derive_id(&fragment.id, &fragment.content, fragment.timestamp),
            fragment_id: fragment.id.clone(),
            elements,
            original_length,
            content_kind: fragment.content.kind(),
            compression_ratio: 1.0,
            created_at: fragment.timestamp,
        };
        let original_bytes = canonical.byte_len();
        if original_bytes > 0 {
            episode.compression_ratio =
                episode.to_bytes().len() as f64 / original_bytes as f64;
        }
        episode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricKind;
    use crate::error::Error;
    use crate::fragment::ContentKind;
    use crate::similarity::metric_for;
    use chrono::{TimeZone, Utc};

    fn harness(min_block_size: usize, max_patterns: usize) -> (Arc<PatternStore>, FractalEncoder) {
        let store = Arc::new(PatternStore::new(
            metric_for(MetricKind::NormalizedEdit),
            max_patterns,
        ));
        let config = EncoderConfig {
            min_block_size,
            ..EncoderConfig::default()
        };
        (store.clone(), FractalEncoder::new(store, config))
    }

    fn text(s: &str) -> Content {
        Content::Text(s.to_string())
    }

    #[tokio::test]
    async fn test_repeated_block_creates_one_pattern() {
        let (store, encoder) = harness(3, 0);
        let episode = encoder
            .encode(&MemoryFragment::text("frag-1", "abcabcabc"))
            .await
            .unwrap();

        assert_eq!(episode.elements.len(), 3);
        match &episode.elements[0] {
            EpisodeElement::Literal { content, position } => {
                assert_eq!(*position, 0);
                assert_eq!(content, &text("abc"));
            }
            other => panic!("expected literal, got {other:?}"),
        }
        assert!(matches!(
            episode.elements[1],
            EpisodeElement::PatternRef {
                position: 3,
                span: 3,
                ..
            }
        ));
        assert!(matches!(
            episode.elements[2],
            EpisodeElement::PatternRef {
                position: 6,
                span: 3,
                ..
            }
        ));

        assert_eq!(store.pattern_count().await, 1);
        let id = store.find_exact(&text("abc")).await.unwrap();
        let pattern = store.get_pattern(id).await.unwrap();
        assert_eq!(pattern.frequency, 3);
        assert!(episode.compression_ratio < 1.0);
    }

    #[tokio::test]
    async fn test_configured_threshold_ranks_but_only_exact_substitutes() {
        let (store, encoder) = harness(4, 0);
        // "abcx" scores 0.75 against "abcd", above the default 0.7
        // threshold, but a near-duplicate must never stand in for the
        // original content
        store.put_pattern(text("abcd"), None).await.unwrap();

        let episode = encoder
            .encode(&MemoryFragment::text("frag-1", "abcx"))
            .await
            .unwrap();
        assert_eq!(episode.elements.len(), 1);
        assert!(matches!(
            episode.elements[0],
            EpisodeElement::Literal { .. }
        ));

        // The exact duplicate ranks first in the same threshold search and
        // is referenced
        let expected = store.find_exact(&text("abcd")).await.unwrap();
        let episode = encoder
            .encode(&MemoryFragment::text("frag-2", "abcd"))
            .await
            .unwrap();
        assert_eq!(episode.elements.len(), 1);
        assert!(matches!(
            episode.elements[0],
            EpisodeElement::PatternRef { pattern_id, .. } if pattern_id == expected
        ));
    }

    #[tokio::test]
    async fn test_empty_fragment_yields_empty_episode() {
        let (store, encoder) = harness(16, 0);
        let episode = encoder
            .encode(&MemoryFragment::text("frag-empty", ""))
            .await
            .unwrap();

        assert!(episode.is_empty());
        assert_eq!(episode.original_length, 0);
        assert_eq!(episode.compression_ratio, 1.0);
        assert_eq!(store.pattern_count().await, 0);
    }

    #[tokio::test]
    async fn test_short_fragment_is_single_literal() {
        let (store, encoder) = harness(16, 0);
        let episode = encoder
            .encode(&MemoryFragment::text("frag-short", "tiny"))
            .await
            .unwrap();

        assert_eq!(episode.elements.len(), 1);
        match &episode.elements[0] {
            EpisodeElement::Literal { content, position } => {
                assert_eq!(*position, 0);
                assert_eq!(content, &text("tiny"));
            }
            other => panic!("expected literal, got {other:?}"),
        }
        // Registered as a pattern even without a match search
        assert_eq!(store.pattern_count().await, 1);
        // Framing overhead on a tiny fragment pushes the ratio above 1.0,
        // which is reported rather than clamped
        assert!(episode.compression_ratio > 1.0);
    }

    #[tokio::test]
    async fn test_invalid_fragment_leaves_store_untouched() {
        let (store, encoder) = harness(3, 0);
        let err = encoder
            .encode(&MemoryFragment::text("   ", "abcabcabc"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidFragment(_)));
        assert_eq!(store.pattern_count().await, 0);
    }

    #[tokio::test]
    async fn test_identical_input_yields_identical_episodes() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let fragment =
            MemoryFragment::text("frag-d", "abcabcabcabc").with_timestamp(at);

        let (_store_a, encoder_a) = harness(3, 0);
        let (_store_b, encoder_b) = harness(3, 0);
        let a = encoder_a.encode(&fragment).await.unwrap();
        let b = encoder_b.encode(&fragment).await.unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(a.elements, b.elements);
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[tokio::test]
    async fn test_repeat_within_fragment_references_staged_pattern() {
        let (store, encoder) = harness(3, 0);
        let episode = encoder
            .encode(&MemoryFragment::text("frag-xy", "xyzxyz"))
            .await
            .unwrap();

        assert_eq!(episode.elements.len(), 2);
        assert!(matches!(
            episode.elements[0],
            EpisodeElement::Literal { .. }
        ));
        assert!(matches!(
            episode.elements[1],
            EpisodeElement::PatternRef {
                position: 3,
                span: 3,
                ..
            }
        ));

        assert_eq!(store.pattern_count().await, 1);
        let id = store.find_exact(&text("xyz")).await.unwrap();
        assert_eq!(store.get_pattern(id).await.unwrap().frequency, 2);
    }

    #[tokio::test]
    async fn test_fully_referenced_fragment_promotes_composite() {
        let (store, encoder) = harness(3, 0);
        encoder
            .encode(&MemoryFragment::text("frag-a", "abcabcabc"))
            .await
            .unwrap();

        // Second pass encodes entirely into references and promotes
        let second = encoder
            .encode(&MemoryFragment::text("frag-b", "abcabcabc"))
            .await
            .unwrap();
        assert!(second
            .elements
            .iter()
            .all(|e| matches!(e, EpisodeElement::PatternRef { .. })));
        assert_eq!(store.pattern_count().await, 2);

        // Third pass collapses to a single reference to the composite
        let third = encoder
            .encode(&MemoryFragment::text("frag-c", "abcabcabc"))
            .await
            .unwrap();
        assert_eq!(third.elements.len(), 1);
        match third.elements[0] {
            EpisodeElement::PatternRef {
                pattern_id,
                position,
                span,
            } => {
                assert_eq!(position, 0);
                assert_eq!(span, 9);
                let composite = store.get_pattern(pattern_id).await.unwrap();
                assert_eq!(composite.depth, 1);
                assert!(composite.body.is_composite());
            }
            ref other => panic!("expected reference, got {other:?}"),
        }
        assert_eq!(store.pattern_count().await, 2);
        assert!(third.compression_ratio < second.compression_ratio);
    }

    #[tokio::test]
    async fn test_pattern_frequency_never_decreases() {
        let (store, encoder) = harness(3, 0);
        let mut previous: HashMap<u64, u64> = HashMap::new();
        for i in 0..4 {
            let fragment_id = format!("frag-{i}");
            encoder
                .encode(&MemoryFragment::text(fragment_id, "abcabcabc"))
                .await
                .unwrap();
            for pattern in store.all_patterns().await {
                if let Some(before) = previous.get(&pattern.id) {
                    assert!(pattern.frequency >= *before);
                }
                previous.insert(pattern.id, pattern.frequency);
            }
        }
    }

    #[tokio::test]
    async fn test_storage_exhausted_is_all_or_nothing() {
        let (store, encoder) = harness(3, 1);
        encoder
            .encode(&MemoryFragment::text("frag-1", "abc"))
            .await
            .unwrap();
        let abc = store.find_exact(&text("abc")).await.unwrap();

        // Needs one reference to "abc" plus one new pattern for "xyz";
        // the new pattern does not fit, so nothing applies
        let err = encoder
            .encode(&MemoryFragment::text("frag-2", "abcxyzabc"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageExhausted { .. }));
        assert_eq!(store.pattern_count().await, 1);
        assert_eq!(store.get_pattern(abc).await.unwrap().frequency, 1);
    }

    #[tokio::test]
    async fn test_bytes_fragment_encodes_per_byte() {
        let (store, encoder) = harness(4, 0);
        let episode = encoder
            .encode(&MemoryFragment::bytes(
                "frag-bin",
                vec![1, 2, 3, 4, 1, 2, 3, 4],
            ))
            .await
            .unwrap();

        assert_eq!(episode.content_kind, ContentKind::Bytes);
        assert_eq!(episode.elements.len(), 2);
        assert!(matches!(
            episode.elements[1],
            EpisodeElement::PatternRef {
                position: 4,
                span: 4,
                ..
            }
        ));
        assert_eq!(store.pattern_count().await, 1);
    }

    #[tokio::test]
    async fn test_structured_fragment_canonicalizes_before_encoding() {
        let (_store, encoder) = harness(8, 0);
        let mut map = serde_json::Map::new();
        map.insert("zeta".to_string(), serde_json::json!(1));
        map.insert("alpha".to_string(), serde_json::json!("x"));
        let episode = encoder
            .encode(&MemoryFragment::structured("frag-json", map))
            .await
            .unwrap();

        assert_eq!(episode.content_kind, ContentKind::Structured);
        assert!(episode.original_length > 0);
        // Literal spans carry canonical text, never raw structures
        assert!(episode.elements.iter().all(|e| match e {
            EpisodeElement::Literal { content, .. } =>
                matches!(content, Content::Text(_)),
            EpisodeElement::PatternRef { .. } => true,
        }));
    }
}
