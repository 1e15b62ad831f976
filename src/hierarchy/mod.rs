//! Pattern hierarchy construction
//!
//! Builds multi-level cluster sets over the pattern store with
//! agglomerative clustering. Level 1 starts from every pattern as its own
//! singleton and repeatedly merges the pair of groups with the highest
//! average pairwise similarity, as long as that average stays at or above
//! the merge threshold. Groups below the minimum cluster size are
//! discarded rather than installed. Upper levels repeat the procedure
//! over cluster fingerprints, which are member contents concatenated in
//! ID order and capped at a configured unit count, until no further
//! clusters form or the level limit is reached.
//!
//! A rebuild works entirely on a snapshot and returns the finished set
//! for the caller to install in one swap. Cancellation is cooperative:
//! the builder checks its token between similarity rows and merge steps,
//! and a cancelled rebuild returns nothing so the previously installed
//! set stays live.

pub mod cluster;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::HierarchyConfig;
use crate::fragment::{Content, ContentUnits};
use crate::similarity::SimilarityMetric;
use crate::store::PatternStore;

use cluster::Cluster;

/// Cooperative cancellation flag for a running rebuild.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the rebuild to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// What a rebuild produced.
#[derive(Debug, PartialEq)]
pub enum RebuildOutcome {
    /// A complete cluster set ready to install
    Completed(Vec<Cluster>),
    /// The rebuild observed a cancellation and stopped early
    Cancelled,
}

/// Builds cluster hierarchies from pattern store snapshots.
pub struct HierarchyBuilder {
    store: Arc<PatternStore>,
    metric: Arc<dyn SimilarityMetric>,
    config: HierarchyConfig,
}

impl HierarchyBuilder {
    pub fn new(
        store: Arc<PatternStore>,
        metric: Arc<dyn SimilarityMetric>,
        config: HierarchyConfig,
    ) -> Self {
        Self {
            store,
            metric,
            config,
        }
    }

    /// Rebuild the full hierarchy without a cancellation hook.
    pub async fn rebuild(&self) -> RebuildOutcome {
        self.rebuild_with_cancel(&CancelToken::new()).await
    }

    /// Rebuild the full hierarchy from the current pattern snapshot.
    ///
    /// Stores with fewer patterns than the minimum cluster size yield an
    /// empty set. The result depends only on the snapshot and the
    /// configuration, so an unchanged store rebuilds to an identical set.
    pub async fn rebuild_with_cancel(&self, cancel: &CancelToken) -> RebuildOutcome {
        let snapshot = self.store.resolved_snapshot().await;
        if snapshot.len() < self.config.min_cluster_size {
            return RebuildOutcome::Completed(Vec::new());
        }

        let contents: Vec<Content> = snapshot.iter().map(|(_, c)| c.clone()).collect();
        let Some((groups, matrix)) = self.agglomerate(&contents, cancel) else {
            return RebuildOutcome::Cancelled;
        };

        let mut installed: Vec<Cluster> = Vec::new();
        let mut current: Vec<Cluster> = Vec::new();
        for group in groups {
            if group.len() < self.config.min_cluster_size {
                continue;
            }
            let members: Vec<u64> = group.iter().map(|&index| snapshot[index].0).collect();
            let coherence = group_coherence(&group, &matrix);
            current.push(Cluster::new(1, members, coherence));
        }
        current.sort_by_key(|c| c.id);
        debug!(level = 1, clusters = current.len(), "hierarchy level built");

        let mut level = 2u32;
        while level <= self.config.max_levels
            && current.len() >= self.config.min_cluster_size
        {
            let fingerprints: Vec<Content> = current
                .iter()
                .map(|cluster| self.fingerprint(cluster, &snapshot))
                .collect();
            let Some((groups, matrix)) = self.agglomerate(&fingerprints, cancel) else {
                return RebuildOutcome::Cancelled;
            };

            let mut next: Vec<Cluster> = Vec::new();
            for group in groups {
                if group.len() < self.config.min_cluster_size {
                    continue;
                }
                let members: Vec<u64> = group
                    .iter()
                    .flat_map(|&index| current[index].member_pattern_ids.iter().copied())
                    .collect();
                let coherence = group_coherence(&group, &matrix);
                let mut parent = Cluster::new(level, members, coherence);
                parent.child_cluster_ids =
                    group.iter().map(|&index| current[index].id).collect();
                parent.child_cluster_ids.sort_unstable();
                for &index in &group {
                    current[index].parent_id = Some(parent.id);
                }
                next.push(parent);
            }
            if next.is_empty() {
                break;
            }
            next.sort_by_key(|c| c.id);
            debug!(level, clusters = next.len(), "hierarchy level built");

            installed.append(&mut current);
            current = next;
            level += 1;
        }
        installed.append(&mut current);
        installed.sort_by_key(|c| (c.level, c.id));

        info!(
            clusters = installed.len(),
            patterns = snapshot.len(),
            "hierarchy rebuilt"
        );
        RebuildOutcome::Completed(installed)
    }

    /// Group items by average-linkage agglomerative merging, starting from
    /// singletons. Returns the groups along with the pairwise similarity
    /// matrix they were merged under, or None when cancelled.
    fn agglomerate(
        &self,
        items: &[Content],
        cancel: &CancelToken,
    ) -> Option<(Vec<Vec<usize>>, Vec<Vec<f64>>)> {
        let n = items.len();
        let mut matrix = vec![vec![0.0f64; n]; n];
        for i in 0..n {
            if cancel.is_cancelled() {
                return None;
            }
            for j in (i + 1)..n {
                let similarity = self.metric.score(&items[i], &items[j]);
                matrix[i][j] = similarity;
                matrix[j][i] = similarity;
            }
        }

        let mut groups: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let mut best: Option<(usize, usize, f64)> = None;
            for i in 0..groups.len() {
                for j in (i + 1)..groups.len() {
                    let linkage = average_linkage(&groups[i], &groups[j], &matrix);
                    if linkage < self.config.merge_threshold {
                        continue;
                    }
                    // Strictly-greater keeps the earliest pair on ties,
                    // which makes rebuilds deterministic
                    let better = match best {
                        None => true,
                        Some((_, _, score)) => linkage > score,
                    };
                    if better {
                        best = Some((i, j, linkage));
                    }
                }
            }
            match best {
                Some((i, j, _)) => {
                    let merged = groups.remove(j);
                    groups[i].extend(merged);
                }
                None => break,
            }
        }
        Some((groups, matrix))
    }

    /// Aggregate fingerprint of a cluster: member contents concatenated in
    /// ID order, truncated at the configured unit cap.
    fn fingerprint(&self, cluster: &Cluster, snapshot: &[(u64, Content)]) -> Content {
        let cap = self.config.fingerprint_cap;
        let mut units: Option<ContentUnits> = None;
        for id in &cluster.member_pattern_ids {
            let Ok(index) = snapshot.binary_search_by_key(id, |(pattern_id, _)| *pattern_id)
            else {
                continue;
            };
            let content = &snapshot[index].1;
            let buffer = units.get_or_insert_with(|| ContentUnits::empty(content.kind()));
            if buffer.len() >= cap {
                break;
            }
            let room = cap - buffer.len();
            if content.unit_len() <= room {
                buffer.push_content(content);
            } else {
                buffer.push_content(&content.to_units().slice(0, room));
            }
        }
        units
            .map(ContentUnits::into_content)
            .unwrap_or(Content::Text(String::new()))
    }
}

/// Average pairwise similarity between two groups (average linkage).
fn average_linkage(a: &[usize], b: &[usize], matrix: &[Vec<f64>]) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for &i in a {
        for &j in b {
            total += matrix[i][j];
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

/// Average pairwise similarity within one group; 1.0 for a single item.
fn group_coherence(group: &[usize], matrix: &[Vec<f64>]) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for (offset, &i) in group.iter().enumerate() {
        for &j in &group[offset + 1..] {
            total += matrix[i][j];
            count += 1;
        }
    }
    if count == 0 {
        1.0
    } else {
        total / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricKind;
    use crate::similarity::metric_for;

    fn builder(store: Arc<PatternStore>, config: HierarchyConfig) -> HierarchyBuilder {
        HierarchyBuilder::new(store, metric_for(MetricKind::NormalizedEdit), config)
    }

    fn store() -> Arc<PatternStore> {
        Arc::new(PatternStore::new(metric_for(MetricKind::NormalizedEdit), 0))
    }

    fn text(s: &str) -> Content {
        Content::Text(s.to_string())
    }

    async fn completed(builder: &HierarchyBuilder) -> Vec<Cluster> {
        match builder.rebuild().await {
            RebuildOutcome::Completed(clusters) => clusters,
            RebuildOutcome::Cancelled => panic!("rebuild was cancelled"),
        }
    }

    #[tokio::test]
    async fn test_too_few_patterns_builds_nothing() {
        let store = store();
        store.put_pattern(text("first pattern"), None).await.unwrap();
        store.put_pattern(text("first pat_ern"), None).await.unwrap();

        let builder = builder(store, HierarchyConfig::default());
        assert_eq!(completed(&builder).await, Vec::new());
    }

    #[tokio::test]
    async fn test_groups_similar_patterns() {
        let store = store();
        let mut alpha = Vec::new();
        for serial in 1..=3 {
            let id = store
                .put_pattern(text(&format!("alpha-block-000{serial}")), None)
                .await
                .unwrap();
            alpha.push(id);
        }
        for serial in 1..=3 {
            store
                .put_pattern(text(&format!("omega-chunk-999{serial}")), None)
                .await
                .unwrap();
        }
        store
            .put_pattern(text("???unrelated????"), None)
            .await
            .unwrap();

        let builder = builder(store, HierarchyConfig::default());
        let clusters = completed(&builder).await;

        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| c.level == 1));
        assert!(clusters.iter().all(|c| c.coherence >= 0.6));
        let alpha_cluster = clusters
            .iter()
            .find(|c| c.member_pattern_ids == alpha)
            .expect("alpha family forms a cluster");
        assert_eq!(alpha_cluster.size(), 3);
        assert!(alpha_cluster.parent_id.is_none());
    }

    #[tokio::test]
    async fn test_small_groups_are_discarded() {
        let store = store();
        store.put_pattern(text("lonely-pair-0001"), None).await.unwrap();
        store.put_pattern(text("lonely-pair-0002"), None).await.unwrap();
        for serial in 1..=3 {
            store
                .put_pattern(text(&format!("triple-family-0{serial}")), None)
                .await
                .unwrap();
        }

        let builder = builder(store, HierarchyConfig::default());
        let clusters = completed(&builder).await;

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].size(), 3);
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let store = store();
        for serial in 1..=3 {
            store
                .put_pattern(text(&format!("blockdata-00000{serial}")), None)
                .await
                .unwrap();
        }

        let builder = builder(store, HierarchyConfig::default());
        let first = completed(&builder).await;
        let second = completed(&builder).await;

        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_builds_upper_level_with_links() {
        let store = store();
        // Two families sharing a common block: families separate at level 1
        // because average linkage dilutes across serials, while their
        // concatenated fingerprints stay close enough to merge at level 2.
        for item in [
            "basefillaaaaaa111111",
            "basefillaaaaaa222222",
            "basefillbbbbbb111111",
            "basefillbbbbbb222222",
        ] {
            store.put_pattern(text(item), None).await.unwrap();
        }

        let config = HierarchyConfig {
            min_cluster_size: 2,
            ..HierarchyConfig::default()
        };
        let builder = builder(store, config);
        let clusters = completed(&builder).await;

        let level_one: Vec<&Cluster> = clusters.iter().filter(|c| c.level == 1).collect();
        let level_two: Vec<&Cluster> = clusters.iter().filter(|c| c.level == 2).collect();
        assert_eq!(level_one.len(), 2);
        assert_eq!(level_two.len(), 1);

        let top = level_two[0];
        assert_eq!(top.member_pattern_ids, vec![1, 2, 3, 4]);
        let mut child_ids: Vec<u64> = level_one.iter().map(|c| c.id).collect();
        child_ids.sort_unstable();
        assert_eq!(top.child_cluster_ids, child_ids);
        for child in level_one {
            assert_eq!(child.parent_id, Some(top.id));
        }
    }

    #[tokio::test]
    async fn test_level_limit_is_respected() {
        let store = store();
        for item in [
            "basefillaaaaaa111111",
            "basefillaaaaaa222222",
            "basefillbbbbbb111111",
            "basefillbbbbbb222222",
        ] {
            store.put_pattern(text(item), None).await.unwrap();
        }

        let config = HierarchyConfig {
            min_cluster_size: 2,
            max_levels: 1,
            ..HierarchyConfig::default()
        };
        let builder = builder(store, config);
        let clusters = completed(&builder).await;

        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| c.level == 1));
    }

    #[tokio::test]
    async fn test_cancelled_rebuild_returns_nothing() {
        let store = store();
        for serial in 1..=3 {
            store
                .put_pattern(text(&format!("blockdata-00000{serial}")), None)
                .await
                .unwrap();
        }

        let builder = builder(store, HierarchyConfig::default());
        let token = CancelToken::new();
        token.cancel();
        assert_eq!(
            builder.rebuild_with_cancel(&token).await,
            RebuildOutcome::Cancelled
        );
    }

    #[tokio::test]
    async fn test_dissimilar_patterns_stay_unclustered() {
        let store = store();
        store.put_pattern(text("alpha-sequence-x"), None).await.unwrap();
        store.put_pattern(text("9482-numeric-run"), None).await.unwrap();
        store.put_pattern(text("!!punctuation!!!"), None).await.unwrap();

        let builder = builder(store, HierarchyConfig::default());
        assert_eq!(completed(&builder).await, Vec::new());
    }
}
