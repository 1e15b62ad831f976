//! Structural similarity metrics
//!
//! Similarity drives pattern search and hierarchy merging. A metric scores
//! two content values into [0.0, 1.0] over their unit space (characters for
//! text, bytes for binary); payloads of different kinds never match. The
//! metric is selected once per engine instance through `MetricKind`, so a
//! store's similarity ordering is stable for its whole lifetime.

use crate::config::MetricKind;
use crate::fragment::{Content, ContentUnits};
use std::sync::Arc;

/// A structural similarity metric over fragment content
pub trait SimilarityMetric: Send + Sync {
    /// Metric name for logs and diagnostics
    fn name(&self) -> &'static str;

    /// Similarity of `a` and `b` in [0.0, 1.0]; 1.0 means identical
    fn score(&self, a: &Content, b: &Content) -> f64;

    /// Upper bound on the score reachable for contents of these unit
    /// lengths. Both metrics are bounded by `min_len / max_len`, which lets
    /// the store skip scoring patterns that cannot reach a threshold.
    fn length_bound(&self, a_len: usize, b_len: usize) -> f64 {
        let max = a_len.max(b_len);
        if max == 0 {
            return 1.0;
        }
        a_len.min(b_len) as f64 / max as f64
    }
}

/// Build the metric an engine instance runs with
pub fn metric_for(kind: MetricKind) -> Arc<dyn SimilarityMetric> {
    match kind {
        MetricKind::NormalizedEdit => Arc::new(NormalizedEditDistance),
        MetricKind::LcsRatio => Arc::new(LcsRatio),
    }
}

/// Normalized edit distance: `1 - levenshtein(a, b) / max_len`
pub struct NormalizedEditDistance;

impl SimilarityMetric for NormalizedEditDistance {
    fn name(&self) -> &'static str {
        "normalized_edit"
    }

    fn score(&self, a: &Content, b: &Content) -> f64 {
        match (a.to_units(), b.to_units()) {
            (ContentUnits::Chars(x), ContentUnits::Chars(y)) => normalized_edit(&x, &y),
            (ContentUnits::Bytes(x), ContentUnits::Bytes(y)) => normalized_edit(&x, &y),
            _ => 0.0,
        }
    }
}

/// Longest-common-subsequence ratio: `lcs_len(a, b) / max_len`
pub struct LcsRatio;

impl SimilarityMetric for LcsRatio {
    fn name(&self) -> &'static str {
        "lcs_ratio"
    }

    fn score(&self, a: &Content, b: &Content) -> f64 {
        match (a.to_units(), b.to_units()) {
            (ContentUnits::Chars(x), ContentUnits::Chars(y)) => lcs_ratio(&x, &y),
            (ContentUnits::Bytes(x), ContentUnits::Bytes(y)) => lcs_ratio(&x, &y),
            _ => 0.0,
        }
    }
}

fn normalized_edit<T: PartialEq>(a: &[T], b: &[T]) -> f64 {
    let max = a.len().max(b.len());
    if max == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max as f64
}

fn lcs_ratio<T: PartialEq>(a: &[T], b: &[T]) -> f64 {
    let max = a.len().max(b.len());
    if max == 0 {
        return 1.0;
    }
    lcs_len(a, b) as f64 / max as f64
}

/// Two-row Levenshtein distance
fn levenshtein<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Two-row longest common subsequence length
fn lcs_len<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Content {
        Content::Text(s.to_string())
    }

    #[test]
    fn test_edit_distance_known_values() {
        let metric = NormalizedEditDistance;
        // kitten -> sitting is 3 edits over max length 7
        let score = metric.score(&text("kitten"), &text("sitting"));
        assert!((score - (1.0 - 3.0 / 7.0)).abs() < 1e-9);

        // cab -> cabc is one insertion over max length 4
        let score = metric.score(&text("cab"), &text("cabc"));
        assert!((score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_identical_scores_one() {
        let edit = NormalizedEditDistance;
        let lcs = LcsRatio;
        assert_eq!(edit.score(&text("abc"), &text("abc")), 1.0);
        assert_eq!(lcs.score(&text("abc"), &text("abc")), 1.0);
        assert_eq!(
            edit.score(
                &Content::Bytes(vec![1, 2, 3]),
                &Content::Bytes(vec![1, 2, 3])
            ),
            1.0
        );
    }

    #[test]
    fn test_empty_content() {
        let edit = NormalizedEditDistance;
        assert_eq!(edit.score(&text(""), &text("")), 1.0);
        assert_eq!(edit.score(&text(""), &text("abc")), 0.0);
    }

    #[test]
    fn test_kind_mismatch_scores_zero() {
        let edit = NormalizedEditDistance;
        assert_eq!(edit.score(&text("ab"), &Content::Bytes(b"ab".to_vec())), 0.0);
    }

    #[test]
    fn test_lcs_ratio_known_values() {
        let metric = LcsRatio;
        // lcs("abcabc", "abc") = 3 over max length 6
        let score = metric.score(&text("abcabc"), &text("abc"));
        assert!((score - 0.5).abs() < 1e-9);

        let score = metric.score(
            &Content::Bytes(vec![1, 2, 3, 4]),
            &Content::Bytes(vec![2, 3]),
        );
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_unicode_scored_per_char() {
        let metric = NormalizedEditDistance;
        // One substitution over 5 chars, regardless of byte widths
        let score = metric.score(&text("héllo"), &text("hållo"));
        assert!((score - (1.0 - 1.0 / 5.0)).abs() < 1e-9);
    }

    #[test]
    fn test_length_bound_holds() {
        let metric = NormalizedEditDistance;
        let a = text("abcdefgh");
        let b = text("abcd");
        let bound = metric.length_bound(a.unit_len(), b.unit_len());
        assert!(metric.score(&a, &b) <= bound + 1e-9);

        let lcs = LcsRatio;
        assert!(lcs.score(&a, &b) <= lcs.length_bound(8, 4) + 1e-9);
    }

    #[test]
    fn test_metric_for_selector() {
        assert_eq!(metric_for(MetricKind::NormalizedEdit).name(), "normalized_edit");
        assert_eq!(metric_for(MetricKind::LcsRatio).name(), "lcs_ratio");
    }
}
