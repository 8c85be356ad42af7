//! Bill verification orchestration
//!
//! Four stages: match the asserted hospital, match each bill category to a
//! catalog category, match and classify each item, then aggregate summary
//! counters and financial totals. Every input item appears in the output
//! exactly once, in input order; a reconciliation imbalance is logged and
//! recorded but never raised.

use crate::arbiter::Arbiter;
use crate::artifact;
use crate::catalog::{Catalog, HospitalIndices, VectorIndex};
use crate::config::MatchThresholds;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::matcher::{MatchCandidate, Matcher};
use crate::normalize::{normalize_item, NormalizedText};
use crate::pricing;
use crate::types::{
    BillInput, CategoryResult, FailureReason, FinancialTotals, HospitalMatch, ItemResult, ItemRow,
    ItemStatus, LineItemEdit, MatchedTieUp, ScoredCandidate, StatusSummary, TieUpItem,
    VerificationResult,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Where stage 3 resolves candidate ids for one category
enum SearchSpace<'a> {
    /// Item index of one matched category
    Category { index: &'a VectorIndex, cid: usize },

    /// Union of all of the hospital's items
    Union(&'a HospitalIndices),
}

impl<'a> SearchSpace<'a> {
    fn index(&self) -> &'a VectorIndex {
        match self {
            SearchSpace::Category { index, .. } => index,
            SearchSpace::Union(h) => &h.union_index,
        }
    }

    fn item(&self, hospital: &'a HospitalIndices, candidate_id: usize) -> Option<&'a TieUpItem> {
        let (cid, iid) = match self {
            SearchSpace::Category { cid, .. } => (*cid, candidate_id),
            SearchSpace::Union(h) => *h.union_map.get(candidate_id)?,
        };
        hospital.sheet.categories.get(cid)?.items.get(iid)
    }
}

/// Orchestrates hospital → category → item matching and classification
pub struct BillVerifier {
    embedder: Arc<dyn Embedder>,
    matcher: Matcher,
    arbiter: Option<Arbiter>,
    thresholds: MatchThresholds,
}

impl BillVerifier {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        thresholds: MatchThresholds,
        arbiter: Option<Arbiter>,
    ) -> Self {
        Self {
            embedder,
            matcher: Matcher::new(thresholds.clone()),
            arbiter,
            thresholds,
        }
    }

    /// Verify one bill against a catalog snapshot.
    pub async fn verify_bill(
        &self,
        input: &BillInput,
        catalog: &Catalog,
        edits: &[LineItemEdit],
    ) -> Result<VerificationResult> {
        let rate_overrides: HashMap<(&str, usize), f64> = edits
            .iter()
            .filter_map(|e| {
                e.tieup_rate
                    .map(|r| ((e.category_name.as_str(), e.item_index), r))
            })
            .collect();

        // Stage 1 — hospital match.
        let hospital_query = self.embed_query(&normalize_item(&input.hospital_name))?;
        let top = catalog.hospital_index.search(&hospital_query, 1);
        let (hospital_id, similarity) = match top.first() {
            Some(&(id, sim)) => (Some(id), sim),
            None => (None, 0.0),
        };
        // An exact-threshold similarity is still too weak to trust.
        let accepted = similarity > self.thresholds.hospital_threshold;
        let hospital_match = HospitalMatch {
            matched_name: hospital_id
                .and_then(|id| catalog.hospital_by_id(id))
                .map(|h| h.sheet.hospital_name.clone()),
            similarity,
            accepted,
        };

        let hospital = if accepted {
            hospital_id.and_then(|id| catalog.hospital_by_id(id))
        } else {
            None
        };
        let categories = match hospital {
            None => {
                debug!(
                    hospital = %input.hospital_name,
                    similarity,
                    "hospital below threshold; all items unclassified"
                );
                self.unmatched_hospital_results(input)
            }
            Some(hospital) => {
                let mut out = Vec::with_capacity(input.categories.len());
                for category in &input.categories {
                    out.push(
                        self.verify_category(category, hospital, &rate_overrides)
                            .await?,
                    );
                }
                out
            }
        };

        // Stage 4 — aggregation and reconciliation.
        let mut summary = StatusSummary::default();
        let mut totals = FinancialTotals::default();
        for item in categories.iter().flat_map(|c| &c.items) {
            summary.record(item.status);
            match item.status {
                ItemStatus::IgnoredArtifact => {}
                ItemStatus::Green | ItemStatus::Red => {
                    totals.bill += item.bill_amount;
                    totals.allowed += item.allowed_amount;
                    totals.extra += item.extra_amount;
                }
                ItemStatus::Unclassified
                | ItemStatus::Mismatch
                | ItemStatus::AllowedNotComparable => {
                    totals.bill += item.bill_amount;
                    totals.unclassified += item.bill_amount;
                }
            }
        }
        let financials_balanced = (totals.bill - (totals.allowed + totals.extra + totals.unclassified))
            .abs()
            <= self.thresholds.reconcile_tolerance;

        let mut diagnostics = Vec::new();
        if !financials_balanced {
            error!(
                bill = totals.bill,
                allowed = totals.allowed,
                extra = totals.extra,
                unclassified = totals.unclassified,
                "financial reconciliation imbalance"
            );
            diagnostics.push(format!(
                "RECONCILIATION_IMBALANCE: bill={:.2} allowed={:.2} extra={:.2} unclassified={:.2}",
                totals.bill, totals.allowed, totals.extra, totals.unclassified
            ));
        }

        Ok(VerificationResult {
            hospital: hospital_match,
            categories,
            summary,
            totals,
            financials_balanced,
            diagnostics,
        })
    }

    /// Stage 1 failure path: artifacts are still filtered, everything else
    /// is unclassified with the hospital reason.
    fn unmatched_hospital_results(&self, input: &BillInput) -> Vec<CategoryResult> {
        input
            .categories
            .iter()
            .map(|category| CategoryResult {
                input_name: category.category_name.clone(),
                matched_name: None,
                similarity: None,
                soft_matched: false,
                searched_union: false,
                items: category
                    .items
                    .iter()
                    .map(|row| {
                        if row_is_artifact(&category.category_name, row) {
                            artifact_result(row)
                        } else {
                            unmatched_result(
                                row,
                                ItemStatus::Unclassified,
                                FailureReason::HospitalNotMatched,
                                Vec::new(),
                                false,
                            )
                        }
                    })
                    .collect(),
            })
            .collect()
    }

    /// Stages 2 and 3 for one input category.
    async fn verify_category(
        &self,
        category: &crate::types::BillCategory,
        hospital: &HospitalIndices,
        rate_overrides: &HashMap<(&str, usize), f64>,
    ) -> Result<CategoryResult> {
        let query = self.embed_query(&normalize_item(&category.category_name))?;
        let top = hospital.category_index.search(&query, 1);
        let (matched_name, similarity) = match top.first() {
            Some(&(cid, sim)) => (
                Some(hospital.sheet.categories[cid].category_name.clone()),
                Some(sim),
            ),
            None => (None, None),
        };

        let sim = similarity.unwrap_or(0.0);
        let (space, soft_matched, searched_union) = match top.first() {
            Some(&(cid, _)) if sim >= self.thresholds.category_strong => (
                SearchSpace::Category {
                    index: &hospital.item_indices[cid],
                    cid,
                },
                false,
                false,
            ),
            Some(&(cid, _)) if sim >= self.thresholds.category_soft => {
                warn!(
                    category = %category.category_name,
                    matched = %hospital.sheet.categories[cid].category_name,
                    similarity = sim,
                    "category matched below the strong threshold"
                );
                (
                    SearchSpace::Category {
                        index: &hospital.item_indices[cid],
                        cid,
                    },
                    true,
                    false,
                )
            }
            _ => (SearchSpace::Union(hospital), false, true),
        };

        let mut items = Vec::with_capacity(category.items.len());
        for (item_index, row) in category.items.iter().enumerate() {
            let rate_override = rate_overrides
                .get(&(category.category_name.as_str(), item_index))
                .copied();
            items.push(
                self.verify_item(row, &category.category_name, hospital, &space, rate_override)
                    .await?,
            );
        }

        Ok(CategoryResult {
            input_name: category.category_name.clone(),
            matched_name,
            similarity,
            soft_matched,
            searched_union,
            items,
        })
    }

    /// Stage 3 for one row.
    async fn verify_item(
        &self,
        row: &ItemRow,
        category_name: &str,
        hospital: &HospitalIndices,
        space: &SearchSpace<'_>,
        rate_override: Option<f64>,
    ) -> Result<ItemResult> {
        if row_is_artifact(category_name, row) {
            return Ok(artifact_result(row));
        }

        let normalized = normalize_item(&row.item_name);
        if normalized.normalized.is_empty() {
            return Ok(unmatched_result(
                row,
                ItemStatus::Unclassified,
                FailureReason::NotInTieup,
                Vec::new(),
                false,
            ));
        }

        let query = self.embed_query(&normalized)?;
        let candidates = self
            .matcher
            .top_candidates(&normalized, &query, space.index());
        let Some(best) = candidates.first().cloned() else {
            return Ok(self.reject(row, &normalized, None, candidates, false));
        };

        let t = &self.thresholds;
        let lexical_accept = best.hybrid >= t.hybrid_accept
            && (best.token_overlap >= t.token_overlap_accept
                || best.containment >= t.containment_accept);
        let mut arbitrated = false;
        let mut accept = best.semantic >= t.semantic_autoaccept || lexical_accept;

        if !accept && best.semantic >= t.llm_band_low && best.semantic < t.llm_band_high {
            if let Some(arbiter) = &self.arbiter {
                arbitrated = true;
                let verdict = arbiter.decide(&normalized.normalized, &best.normalized).await;
                accept = verdict.is_match;
                debug!(
                    item = %row.item_name,
                    candidate = %best.name,
                    accept,
                    confidence = verdict.confidence,
                    "arbiter verdict"
                );
            }
        }

        let resolved = space.item(hospital, best.id);
        if let (true, Some(matched_item)) = (accept, resolved) {
            let check = pricing::check_price(row, matched_item, rate_override);
            return Ok(ItemResult {
                item_name: row.item_name.clone(),
                normalized_name: normalized.normalized,
                status: check.status,
                bill_amount: check.bill_amount,
                allowed_amount: check.allowed_amount,
                extra_amount: check.extra_amount,
                failure_reason: None,
                matched: Some(MatchedTieUp {
                    item_name: matched_item.item_name.clone(),
                    rate: matched_item.rate,
                    kind: matched_item.kind,
                    similarity: best.semantic,
                }),
                candidates: to_scored(&candidates),
                arbitrated,
            });
        }

        Ok(self.reject(
            row,
            &normalized,
            resolved.map(|item| (best.semantic, item.kind)),
            candidates,
            arbitrated,
        ))
    }

    /// Classify a non-accepted row: admin charges first, then the
    /// not-in-tieup floor, then bundle-only mismatches.
    fn reject(
        &self,
        row: &ItemRow,
        normalized: &NormalizedText,
        best: Option<(f64, crate::types::ItemKind)>,
        candidates: Vec<MatchCandidate>,
        arbitrated: bool,
    ) -> ItemResult {
        let (status, reason) = if artifact::is_admin_charge(&row.item_name) {
            (ItemStatus::AllowedNotComparable, FailureReason::AdminCharge)
        } else {
            match best {
                None => (ItemStatus::Unclassified, FailureReason::NotInTieup),
                Some((semantic, _)) if semantic < self.thresholds.not_in_tieup_below => {
                    (ItemStatus::Unclassified, FailureReason::NotInTieup)
                }
                Some((_, crate::types::ItemKind::Bundle)) => {
                    (ItemStatus::Mismatch, FailureReason::PackageOnly)
                }
                Some(_) => (ItemStatus::Unclassified, FailureReason::LowSimilarity),
            }
        };
        let mut result = unmatched_result(row, status, reason, to_scored(&candidates), arbitrated);
        result.normalized_name = normalized.normalized.clone();
        result
    }

    fn embed_query(&self, normalized: &NormalizedText) -> Result<Vec<Vec<f32>>> {
        let mut texts: Vec<&str> = vec![&normalized.normalized];
        if let Some(core) = &normalized.medical_core {
            texts.push(core);
        }
        self.embedder.embed(&texts)
    }
}

fn row_is_artifact(category_name: &str, row: &ItemRow) -> bool {
    // The header rule wants (amount, final_amount); rows carry a single
    // final amount, with the pre-discount rate as the first element when
    // one was extracted.
    let pre_amount = row.rate.unwrap_or(row.amount);
    artifact::is_artifact(category_name, &row.item_name, pre_amount, row.amount)
}

fn artifact_result(row: &ItemRow) -> ItemResult {
    ItemResult {
        item_name: row.item_name.clone(),
        normalized_name: normalize_item(&row.item_name).normalized,
        status: ItemStatus::IgnoredArtifact,
        bill_amount: row.amount,
        allowed_amount: 0.0,
        extra_amount: 0.0,
        failure_reason: None,
        matched: None,
        candidates: Vec::new(),
        arbitrated: false,
    }
}

fn unmatched_result(
    row: &ItemRow,
    status: ItemStatus,
    reason: FailureReason,
    candidates: Vec<ScoredCandidate>,
    arbitrated: bool,
) -> ItemResult {
    ItemResult {
        item_name: row.item_name.clone(),
        normalized_name: normalize_item(&row.item_name).normalized,
        status,
        bill_amount: row.amount,
        allowed_amount: 0.0,
        extra_amount: 0.0,
        failure_reason: Some(reason),
        matched: None,
        candidates,
        arbitrated,
    }
}

fn to_scored(candidates: &[MatchCandidate]) -> Vec<ScoredCandidate> {
    candidates
        .iter()
        .map(|c| ScoredCandidate {
            name: c.name.clone(),
            semantic: c.semantic,
            token_overlap: c.token_overlap,
            containment: c.containment,
            hybrid: c.hybrid,
        })
        .collect()
}
