//! Verification output rendering and validation
//!
//! The final view shows one line per billable row, categories in input
//! order; artifacts appear only in the debug view. The two validators are
//! diagnostic-only: violations are returned as strings for the caller to
//! log and attach, never raised.

use crate::artifact;
use crate::types::{BillInput, FailureReason, ItemResult, ItemStatus, VerificationResult};
use std::collections::HashMap;

/// Check that every non-artifact input item appears in the output exactly
/// once, with the same original text, per category.
pub fn validate_completeness(input: &BillInput, result: &VerificationResult) -> Vec<String> {
    let mut violations = Vec::new();
    if input.categories.len() != result.categories.len() {
        violations.push(format!(
            "COMPLETENESS_VIOLATION: {} input categories vs {} output categories",
            input.categories.len(),
            result.categories.len()
        ));
        return violations;
    }

    for (cat_in, cat_out) in input.categories.iter().zip(&result.categories) {
        let mut expected: HashMap<&str, i64> = HashMap::new();
        for row in &cat_in.items {
            let pre_amount = row.rate.unwrap_or(row.amount);
            if !artifact::is_artifact(
                &cat_in.category_name,
                &row.item_name,
                pre_amount,
                row.amount,
            ) {
                *expected.entry(row.item_name.as_str()).or_default() += 1;
            }
        }
        for item in &cat_out.items {
            if item.status == ItemStatus::IgnoredArtifact {
                continue;
            }
            *expected.entry(item.item_name.as_str()).or_default() -= 1;
        }
        for (name, count) in expected {
            if count != 0 {
                violations.push(format!(
                    "COMPLETENESS_VIOLATION: {:?} in {:?} off by {}",
                    name, cat_in.category_name, -count
                ));
            }
        }
    }
    violations
}

/// Check that the status counters add up to the total item count.
pub fn validate_counters(result: &VerificationResult) -> Vec<String> {
    let total_items: usize = result.categories.iter().map(|c| c.items.len()).sum();
    if result.summary.total() != total_items {
        vec![format!(
            "COUNTER_VIOLATION: counters sum to {} but {} items exist",
            result.summary.total(),
            total_items
        )]
    } else {
        Vec::new()
    }
}

/// Plain-text final view of a verification result.
pub fn render_report(result: &VerificationResult) -> String {
    let mut out = String::new();
    match &result.hospital.matched_name {
        Some(name) => out.push_str(&format!(
            "Hospital: {} (similarity {:.2})\n",
            name, result.hospital.similarity
        )),
        None => out.push_str("Hospital: no catalog match\n"),
    }
    if !result.hospital.accepted {
        out.push_str("  !! asserted hospital not matched; items are unclassified\n");
    }
    out.push('\n');

    for category in &result.categories {
        out.push_str(&format!("== {} ==\n", category.input_name));
        if category.searched_union {
            out.push_str("   (no category match; searched all items)\n");
        }
        for item in &category.items {
            if item.status == ItemStatus::IgnoredArtifact {
                continue;
            }
            out.push_str(&render_item(item));
        }
        out.push('\n');
    }

    let s = &result.summary;
    out.push_str(&format!(
        "Summary: {} green, {} red, {} unclassified, {} allowed-not-comparable, {} mismatch, {} ignored\n",
        s.green, s.red, s.unclassified, s.allowed_not_comparable, s.mismatch, s.ignored_artifact
    ));
    let t = &result.totals;
    out.push_str(&format!(
        "Totals: bill ₹{:.2} | allowed ₹{:.2} | extra ₹{:.2} | unclassified ₹{:.2}\n",
        t.bill, t.allowed, t.extra, t.unclassified
    ));
    out.push_str(if result.financials_balanced {
        "Financials balanced.\n"
    } else {
        "!! FINANCIALS DO NOT BALANCE\n"
    });
    for diag in &result.diagnostics {
        out.push_str(&format!("!! {}\n", diag));
    }
    out
}

fn render_item(item: &ItemResult) -> String {
    match item.status {
        ItemStatus::Green => format!(
            "  [GREEN] {} | bill ₹{:.2} | allowed ₹{:.2}\n",
            item.item_name, item.bill_amount, item.allowed_amount
        ),
        ItemStatus::Red => format!(
            "  [RED] {} | bill ₹{:.2} | allowed ₹{:.2} | extra ₹{:.2}\n",
            item.item_name, item.bill_amount, item.allowed_amount, item.extra_amount
        ),
        ItemStatus::IgnoredArtifact => String::new(),
        status => {
            let label = match status {
                ItemStatus::Mismatch => "MISMATCH",
                ItemStatus::AllowedNotComparable => "ALLOWED-NOT-COMPARABLE",
                _ => "UNCLASSIFIED",
            };
            let mut line = format!(
                "  [{}] {} | bill ₹{:.2} | allowed N/A | extra N/A",
                label, item.item_name, item.bill_amount
            );
            if let Some(reason) = item.failure_reason {
                line.push_str(&format!(" | {:?}", reason));
            }
            // A best candidate is only meaningful when something was close.
            if item.failure_reason != Some(FailureReason::NotInTieup) {
                if let Some(best) = item.candidates.first() {
                    line.push_str(&format!(
                        " | closest: {} ({:.2})",
                        best.name, best.semantic
                    ));
                }
            }
            line.push('\n');
            line
        }
    }
}

/// Debug view: the final view plus per-item candidate lists and scores.
pub fn render_debug(result: &VerificationResult) -> String {
    let mut out = render_report(result);
    out.push_str("\n-- debug --\n");
    for category in &result.categories {
        for item in &category.items {
            out.push_str(&format!(
                "{} [{}]\n",
                item.item_name,
                match item.status {
                    ItemStatus::IgnoredArtifact => "artifact",
                    _ => "scored",
                }
            ));
            out.push_str(&format!("  normalized: {:?}\n", item.normalized_name));
            if item.arbitrated {
                out.push_str("  arbitrated: yes\n");
            }
            for c in &item.candidates {
                out.push_str(&format!(
                    "  candidate: {} sem={:.3} tok={:.3} con={:.3} hybrid={:.3}\n",
                    c.name, c.semantic, c.token_overlap, c.containment, c.hybrid
                ));
            }
        }
    }
    out
}
