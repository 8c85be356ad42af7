//! Hybrid semantic matcher
//!
//! Scores a query text against a flat index with a weighted blend of
//! embedding similarity, token-set Jaccard and candidate containment, and
//! returns the top-K candidates by the blended score. Thresholding is the
//! caller's business; this module is pure and neither persists nor logs.

use crate::catalog::VectorIndex;
use crate::config::MatchThresholds;
use crate::embedding::dot;
use crate::normalize::{is_pure_number, NormalizedText};
use std::collections::HashSet;

/// Function words excluded from token scoring
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "at", "by", "for", "in", "of", "on", "or", "per", "the", "to", "with",
];

/// One scored candidate, best-hybrid first in the returned list
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    /// Entry id within the searched index
    pub id: usize,
    pub name: String,
    pub normalized: String,
    pub semantic: f64,
    pub token_overlap: f64,
    pub containment: f64,
    pub hybrid: f64,
}

/// Content-word set of a normalized text: tokens of length ≥ 2 that are
/// neither stopwords nor bare numbers.
pub fn content_tokens(normalized: &str) -> HashSet<&str> {
    normalized
        .split_whitespace()
        .filter(|t| t.chars().count() >= 2 && !STOPWORDS.contains(t) && !is_pure_number(t))
        .collect()
}

/// Jaccard overlap of two content-word sets
pub fn token_overlap(query: &HashSet<&str>, candidate: &HashSet<&str>) -> f64 {
    if query.is_empty() && candidate.is_empty() {
        return 0.0;
    }
    let inter = query.intersection(candidate).count();
    let union = query.union(candidate).count();
    if union == 0 {
        0.0
    } else {
        inter as f64 / union as f64
    }
}

/// Share of the candidate's content words present in the query;
/// 0 when the candidate has no content tokens.
pub fn containment(query: &HashSet<&str>, candidate: &HashSet<&str>) -> f64 {
    if candidate.is_empty() {
        return 0.0;
    }
    let inter = query.intersection(candidate).count();
    inter as f64 / candidate.len() as f64
}

/// Hybrid scorer over a [`VectorIndex`]
pub struct Matcher {
    thresholds: MatchThresholds,
}

impl Matcher {
    pub fn new(thresholds: MatchThresholds) -> Self {
        Self { thresholds }
    }

    /// Score every entry and return the top-K by hybrid score.
    ///
    /// `query_vectors` holds the embeddings of the query's normalized form
    /// and, when present, its medical core; semantic similarity is the best
    /// dot product over (query, entry) variant pairs.
    pub fn top_candidates(
        &self,
        query: &NormalizedText,
        query_vectors: &[Vec<f32>],
        index: &VectorIndex,
    ) -> Vec<MatchCandidate> {
        let query_tokens = content_tokens(&query.normalized);

        let mut scored: Vec<MatchCandidate> = index
            .entries
            .iter()
            .map(|entry| {
                let semantic = query_vectors
                    .iter()
                    .flat_map(|q| entry.vectors.iter().map(move |v| dot(q, v)))
                    .fold(f32::MIN, f32::max);
                let semantic = f64::from(semantic).clamp(-1.0, 1.0);

                let cand_tokens = content_tokens(&entry.normalized);
                let token_overlap = token_overlap(&query_tokens, &cand_tokens);
                let containment = containment(&query_tokens, &cand_tokens);
                let hybrid = self.thresholds.weight_semantic * semantic
                    + self.thresholds.weight_token * token_overlap
                    + self.thresholds.weight_containment * containment;

                MatchCandidate {
                    id: entry.id,
                    name: entry.name.clone(),
                    normalized: entry.normalized.clone(),
                    semantic,
                    token_overlap,
                    containment,
                    hybrid,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.hybrid
                .partial_cmp(&a.hybrid)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(self.thresholds.top_k);
        scored
    }
}
