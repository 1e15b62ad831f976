//! Episode replay
//!
//! Reconstructs original fragments from episodes at a requested fidelity.
//! Fidelity 1.0 resolves every reference through the pattern store and
//! reproduces the original content exactly, failing loudly on a dangling
//! reference. Lower fidelities spend a unit budget proportional to the
//! requested fidelity and the fragment size; resolving a reference costs
//! its span weighted by pattern depth. References are resolved in position
//! order until the first one the remaining budget cannot cover; that span
//! and every later one are filled with placeholder units of the same
//! size, so every element stays at its original position and the achieved
//! fidelity only grows with the requested one.
//!
//! Reconstructions are cached per (episode, fidelity) in a bounded LRU
//! cache; a cache hit never touches the pattern store.

pub mod cache;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future;
use tracing::debug;

use crate::config::ReplayConfig;
use crate::episode::{Episode, EpisodeElement};
use crate::error::{Error, Result};
use crate::fragment::{Content, ContentKind, ContentUnits};
use crate::store::PatternStore;

use cache::{CachedReplay, ReplayCache};

/// Outcome of one reconstruction.
#[derive(Debug, Clone)]
pub struct ReconstructionResult {
    /// Reconstructed content; placeholder units mark unresolved spans
    pub content: Content,
    /// Fraction of original units actually resolved, in [0.0, 1.0]
    pub achieved_fidelity: f64,
    /// References left unresolved (skipped or missing)
    pub unresolved_refs: usize,
    /// Wall-clock duration of this call
    pub latency: Duration,
    /// Whether the result was served from the replay cache
    pub from_cache: bool,
}

/// Splice action for one episode element.
enum Plan {
    /// Splice this content as-is (literals)
    Splice(Content),
    /// Resolve the referenced pattern and splice its content
    Resolve(u64, usize),
    /// Fill the span with placeholder units
    Placeholder(usize),
}

/// Replays episodes against a shared pattern store.
pub struct ReplayEngine {
    store: Arc<PatternStore>,
    cache: ReplayCache,
}

impl ReplayEngine {
    pub fn new(store: Arc<PatternStore>, config: &ReplayConfig) -> Self {
        Self {
            store,
            cache: ReplayCache::new(config.cache_capacity),
        }
    }

    /// Fraction of reconstructions served from cache
    pub fn cache_hit_rate(&self) -> f64 {
        self.cache.hit_rate()
    }

    /// Reconstruct an episode at the requested fidelity.
    ///
    /// Fidelity must lie in [0.0, 1.0]. At 1.0 a missing pattern is an
    /// error; below 1.0 it degrades to placeholders instead.
    pub async fn reconstruct(
        &self,
        episode: &Episode,
        fidelity: f64,
    ) -> Result<ReconstructionResult> {
        if !(0.0..=1.0).contains(&fidelity) {
            return Err(Error::InvalidFidelity(fidelity));
        }
        let started = Instant::now();

        if let Some(cached) = self.cache.get(&episode.id, fidelity).await {
            debug!(episode_id = %episode.id, fidelity, "replay served from cache");
            return Ok(ReconstructionResult {
                content: cached.content,
                achieved_fidelity: cached.achieved_fidelity,
                unresolved_refs: cached.unresolved_refs,
                latency: started.elapsed(),
                from_cache: true,
            });
        }

        let (plans, unresolved) = if fidelity >= 1.0 {
            (self.plan_full(episode), 0)
        } else {
            self.plan_partial(episode, fidelity).await
        };
        let (units, resolved_units) = self.materialize(episode, plans).await?;

        let achieved = if episode.original_length == 0 {
            1.0
        } else {
            resolved_units as f64 / episode.original_length as f64
        };
        let complete = unresolved == 0 && resolved_units == episode.original_length;
        let content = restore_shape(episode, units, complete)?;

        self.cache
            .insert(
                &episode.id,
                fidelity,
                CachedReplay {
                    content: content.clone(),
                    achieved_fidelity: achieved,
                    unresolved_refs: unresolved,
                },
            )
            .await;

        debug!(
            episode_id = %episode.id,
            fidelity,
            achieved,
            unresolved,
            "reconstructed episode"
        );
        Ok(ReconstructionResult {
            content,
            achieved_fidelity: achieved,
            unresolved_refs: unresolved,
            latency: started.elapsed(),
            from_cache: false,
        })
    }

    /// Full fidelity resolves every reference; missing patterns surface as
    /// errors during materialization.
    fn plan_full(&self, episode: &Episode) -> Vec<Plan> {
        episode
            .elements
            .iter()
            .map(|element| match element {
                EpisodeElement::Literal { content, .. } => Plan::Splice(content.clone()),
                EpisodeElement::PatternRef {
                    pattern_id, span, ..
                } => Plan::Resolve(*pattern_id, *span),
            })
            .collect()
    }

    /// Build the splice plan for a partial-fidelity replay and count the
    /// references it leaves unresolved.
    async fn plan_partial(&self, episode: &Episode, fidelity: f64) -> (Vec<Plan>, usize) {
        let mut ids: Vec<u64> = episode
            .elements
            .iter()
            .filter_map(|element| match element {
                EpisodeElement::PatternRef { pattern_id, .. } => Some(*pattern_id),
                EpisodeElement::Literal { .. } => None,
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();

        let fetched = future::join_all(ids.into_iter().map(|id| {
            let store = Arc::clone(&self.store);
            async move { (id, store.get_pattern(id).await.ok().map(|p| p.depth)) }
        }))
        .await;
        let depths: HashMap<u64, Option<u32>> = fetched.into_iter().collect();

        let budget = fidelity * episode.original_length as f64;
        let mut spent = 0u64;
        let mut affordable = true;
        let mut plans: Vec<Plan> = Vec::with_capacity(episode.elements.len());
        for element in &episode.elements {
            match element {
                EpisodeElement::Literal { content, .. } => {
                    plans.push(Plan::Splice(content.clone()));
                }
                EpisodeElement::PatternRef {
                    pattern_id, span, ..
                } => {
                    // A missing pattern stays a placeholder and costs nothing
                    let Some(Some(depth)) = depths.get(pattern_id) else {
                        plans.push(Plan::Placeholder(*span));
                        continue;
                    };
                    let cost = *span as u64 * (1 + *depth as u64);
                    if affordable && (spent + cost) as f64 <= budget {
                        spent += cost;
                        plans.push(Plan::Resolve(*pattern_id, *span));
                    } else {
                        // The first span the budget cannot cover ends the
                        // walk; later spans stay placeholders even when
                        // individually cheaper, so the resolved set only
                        // ever grows with the requested fidelity
                        affordable = false;
                        plans.push(Plan::Placeholder(*span));
                    }
                }
            }
        }

        let unresolved = plans
            .iter()
            .filter(|plan| matches!(plan, Plan::Placeholder(_)))
            .count();
        (plans, unresolved)
    }

    /// Fetch every planned pattern concurrently, then splice elements in
    /// position order. Returns the assembled units and how many of them
    /// came from resolved content rather than placeholders.
    async fn materialize(
        &self,
        episode: &Episode,
        plans: Vec<Plan>,
    ) -> Result<(ContentUnits, usize)> {
        let mut wanted: Vec<u64> = plans
            .iter()
            .filter_map(|plan| match plan {
                Plan::Resolve(id, _) => Some(*id),
                _ => None,
            })
            .collect();
        wanted.sort_unstable();
        wanted.dedup();

        let fetched = future::try_join_all(wanted.into_iter().map(|id| {
            let store = Arc::clone(&self.store);
            async move { store.resolved_content(id).await.map(|content| (id, content)) }
        }))
        .await?;
        let contents: HashMap<u64, Content> = fetched.into_iter().collect();

        let mut units = ContentUnits::empty(episode.content_kind);
        let mut resolved_units = 0usize;
        for (element, plan) in episode.elements.iter().zip(plans) {
            if element.position() != units.len() {
                return Err(Error::Persistence(format!(
                    "episode {}: element at unit {} does not follow the previous span",
                    episode.id,
                    element.position()
                )));
            }
            match plan {
                Plan::Splice(content) => {
                    resolved_units += content.unit_len();
                    if !units.push_content(&content) {
                        return Err(kind_mismatch(episode));
                    }
                }
                Plan::Resolve(id, span) => {
                    let content = contents
                        .get(&id)
                        .ok_or(Error::DanglingPatternRef(id))?;
                    if !units.push_content(content) {
                        return Err(kind_mismatch(episode));
                    }
                    if units.len() != element.position() + span {
                        return Err(Error::Persistence(format!(
                            "episode {}: pattern {} resolved to {} units, expected {}",
                            episode.id,
                            id,
                            units.len() - element.position(),
                            span
                        )));
                    }
                    resolved_units += span;
                }
                Plan::Placeholder(span) => {
                    units.push_placeholder(span);
                }
            }
        }
        if units.len() != episode.original_length {
            return Err(Error::Persistence(format!(
                "episode {}: reconstructed {} units, expected {}",
                episode.id,
                units.len(),
                episode.original_length
            )));
        }
        Ok((units, resolved_units))
    }
}

fn kind_mismatch(episode: &Episode) -> Error {
    Error::Persistence(format!(
        "episode {}: pattern content kind does not match the episode",
        episode.id
    ))
}

/// Collapse assembled units back into the episode's payload shape.
/// Structured payloads re-parse from canonical text only when the
/// reconstruction is complete; a degraded replay stays text.
fn restore_shape(episode: &Episode, units: ContentUnits, complete: bool) -> Result<Content> {
    let content = units.into_content();
    if complete
        && episode.original_length > 0
        && episode.content_kind == ContentKind::Structured
    {
        if let Content::Text(text) = &content {
            return Ok(Content::Structured(serde_json::from_str(text)?));
        }
    }
    Ok(content)
}
