//! Artifact and admin-charge detection
//!
//! OCR output leaks page headers and inventory noise into the item stream.
//! The detector classifies those rows so they can be filtered before
//! persistence and excluded from completeness validation. Admin-phrase
//! detection lives here too: it explains unmatched rows that are real
//! charges but have no tie-up counterpart by design.

use crate::normalize::{self, normalize};

/// Admin phrases checked against the normalized item text
const ADMIN_PHRASES: &[&str] = &[
    "registration fee",
    "registration charge",
    "admission fee",
    "admission charge",
    "processing fee",
    "processing charge",
    "service charge",
    "deposit",
    "advance",
    "medical record",
    "mrd charge",
    "file charge",
    "discharge summary",
];

/// True when a (category, item, amount, final_amount) quadruple is a
/// non-billable OCR/header artifact.
///
/// The generic hospital-header rule fires when all of: the category reads as
/// `hospital`/`hospitalization`, the item is empty or `unknown`, and both
/// amounts are zero. Separately, zero-amount rows whose normalized form is a
/// bare number, an inventory code or a lot/batch/expiry fragment are noise
/// regardless of category.
pub fn is_artifact(category: &str, item_name: &str, amount: f64, final_amount: f64) -> bool {
    let norm_item = normalize(item_name);

    let category_is_header = {
        let c = normalize(category);
        c == "hospital" || c == "hospitalization"
    };
    let item_is_blank = norm_item.is_empty() || norm_item == "unknown";
    if category_is_header && item_is_blank && amount == 0.0 && final_amount == 0.0 {
        return true;
    }

    if amount == 0.0 && final_amount == 0.0 {
        if norm_item.is_empty()
            || normalize::is_pure_number(&norm_item)
            || normalize::has_lot_batch_marker(item_name)
            || norm_item.split_whitespace().all(normalize::is_code_token)
        {
            return true;
        }
    }

    false
}

/// True when the normalized item text reads as an administrative,
/// non-comparable charge.
pub fn is_admin_charge(item_name: &str) -> bool {
    let norm = normalize(item_name);
    if norm.is_empty() {
        return false;
    }
    ADMIN_PHRASES
        .iter()
        .any(|phrase| norm.contains(phrase))
        // Single-word fee/charge rows ("Deposit", "Advance") normalize to
        // exactly the phrase word.
        || norm == "fee"
        || norm.ends_with(" fee")
        || norm.ends_with(" fees")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hospital_header_artifact() {
        assert!(is_artifact("Hospital", "", 0.0, 0.0));
        assert!(is_artifact("HOSPITALIZATION", "UNKNOWN", 0.0, 0.0));
    }

    #[test]
    fn test_header_with_amount_is_not_artifact() {
        assert!(!is_artifact("Hospital", "UNKNOWN", 150.0, 150.0));
        assert!(!is_artifact("Hospital", "UNKNOWN", 0.0, 10.0));
    }

    #[test]
    fn test_real_item_in_header_category_is_not_artifact() {
        assert!(!is_artifact("Hospital", "Room Rent", 0.0, 0.0));
    }

    #[test]
    fn test_zero_amount_noise_rows() {
        assert!(is_artifact("Pharmacy", "123456", 0.0, 0.0));
        assert!(is_artifact("Pharmacy", "HSN30049099", 0.0, 0.0));
        assert!(is_artifact("Pharmacy", "BATCH AX991", 0.0, 0.0));
        // Same text with a price is a real (if odd) row.
        assert!(!is_artifact("Pharmacy", "123456", 12.0, 12.0));
    }

    #[test]
    fn test_admin_phrases() {
        assert!(is_admin_charge("Registration Fee"));
        assert!(is_admin_charge("REFUNDABLE DEPOSIT"));
        assert!(is_admin_charge("Processing fee - admin"));
        assert!(is_admin_charge("Medical Records Charges"));
        assert!(!is_admin_charge("Consultation"));
        assert!(!is_admin_charge("MRI Brain"));
    }
}
