//! End-to-end verification scenarios over a fixture catalog
//!
//! Semantic similarities are prescribed through the table embedder, so
//! every threshold decision in these tests is exact.

mod common;

use common::*;
use std::sync::Arc;
use tieup_rs::types::{
    BillCategory, BillInput, FailureReason, ItemRow, ItemStatus, VerificationResult,
};

fn row(name: &str, amount: f64) -> ItemRow {
    ItemRow {
        item_name: name.to_string(),
        amount,
        quantity: None,
        rate: None,
        page: Some(1),
        category: None,
    }
}

fn input(hospital: &str, categories: Vec<(&str, Vec<ItemRow>)>) -> BillInput {
    BillInput {
        hospital_name: hospital.to_string(),
        categories: categories
            .into_iter()
            .map(|(name, items)| BillCategory {
                category_name: name.to_string(),
                items,
            })
            .collect(),
    }
}

async fn verify(embedder: TableEmbedder, bill: &BillInput) -> VerificationResult {
    verify_with_arbiter(embedder, bill, None).await
}

async fn verify_with_arbiter(
    embedder: TableEmbedder,
    bill: &BillInput,
    arbiter: Option<tieup_rs::arbiter::Arbiter>,
) -> VerificationResult {
    let dir = tempfile::TempDir::new().unwrap();
    let embedder: Arc<dyn tieup_rs::embedding::Embedder> = Arc::new(embedder);
    let catalog = catalog_handle(dir.path(), Arc::clone(&embedder));
    let verifier = verifier_with(embedder, arbiter);
    verifier
        .verify_bill(bill, &catalog.snapshot(), &[])
        .await
        .unwrap()
}

fn single_item(result: &VerificationResult) -> &tieup_rs::types::ItemResult {
    assert_eq!(result.categories.len(), 1);
    assert_eq!(result.categories[0].items.len(), 1);
    &result.categories[0].items[0]
}

#[tokio::test]
async fn s1_exact_consultation_is_green() {
    let mut embedder = TableEmbedder::with_catalog_axes();
    embedder.set("consultation first visit", axis(AX_CONSULTATION));
    let bill = input(
        "Apollo Hospital",
        vec![(
            "Consultation",
            vec![row("1. CONSULTATION - FIRST VISIT | Dr. A. Kumar", 1500.0)],
        )],
    );

    let result = verify(embedder, &bill).await;
    assert!(result.hospital.accepted);

    let item = single_item(&result);
    assert_eq!(item.status, ItemStatus::Green);
    assert_eq!(item.allowed_amount, 1500.0);
    assert_eq!(item.extra_amount, 0.0);
    assert_eq!(item.matched.as_ref().unwrap().item_name, "Consultation");

    assert_eq!(result.summary.green, 1);
    assert!(result.financials_balanced);
    assert_eq!(result.totals.bill, 1500.0);
    assert_eq!(result.totals.allowed, 1500.0);
}

#[tokio::test]
async fn s2_overbilled_mri_is_red_with_extra() {
    let embedder = TableEmbedder::with_catalog_axes();
    let bill = input(
        "Apollo Hospital",
        vec![("Radiology", vec![row("MRI BRAIN | Dr. X", 10770.0)])],
    );

    let result = verify(embedder, &bill).await;
    let item = single_item(&result);
    assert_eq!(item.status, ItemStatus::Red);
    assert_eq!(item.allowed_amount, 8500.0);
    assert!((item.extra_amount - 2270.0).abs() < 1e-9);

    assert_eq!(result.totals.extra, 2270.0);
    assert!(result.financials_balanced);
}

#[tokio::test]
async fn s3_registration_fee_is_admin_charge() {
    let embedder = TableEmbedder::with_catalog_axes();
    // "registration fee" and "misc" embed to the free axis: no catalog
    // similarity anywhere.
    let bill = input(
        "Apollo Hospital",
        vec![("Misc", vec![row("Registration Fee", 200.0)])],
    );

    let result = verify(embedder, &bill).await;
    assert!(result.categories[0].searched_union);

    let item = single_item(&result);
    assert_eq!(item.status, ItemStatus::AllowedNotComparable);
    assert_eq!(item.failure_reason, Some(FailureReason::AdminCharge));
    assert_eq!(item.allowed_amount, 0.0);

    assert_eq!(result.totals.unclassified, 200.0);
    assert!(result.financials_balanced);
}

#[tokio::test]
async fn s4_distant_item_is_not_in_tieup() {
    let mut embedder = TableEmbedder::with_catalog_axes();
    embedder.set("experimental treatment z", at_cosine(AX_GENERAL, 0.35));
    let bill = input(
        "Apollo Hospital",
        vec![("Misc", vec![row("Experimental Treatment Z", 10000.0)])],
    );

    let result = verify(embedder, &bill).await;
    let item = single_item(&result);
    assert_eq!(item.status, ItemStatus::Unclassified);
    assert_eq!(item.failure_reason, Some(FailureReason::NotInTieup));
    assert!(item.matched.is_none());

    // The near-miss is visible to debugging but not the final view.
    assert_eq!(item.candidates[0].name, "General Procedure");
    let report = tieup_rs::render::render_report(&result);
    assert!(!report.contains("closest: General Procedure"));
}

#[tokio::test]
async fn bundle_only_candidate_is_mismatch() {
    let mut embedder = TableEmbedder::with_catalog_axes();
    embedder.set("joint surgery knee", at_cosine(AX_KNEE, 0.55));
    let bill = input(
        "Apollo Hospital",
        vec![("Misc", vec![row("Joint Surgery - Knee", 90000.0)])],
    );

    let result = verify(embedder, &bill).await;
    let item = single_item(&result);
    assert_eq!(item.status, ItemStatus::Mismatch);
    assert_eq!(item.failure_reason, Some(FailureReason::PackageOnly));
    assert_eq!(result.totals.unclassified, 90000.0);
}

#[tokio::test]
async fn hospital_at_threshold_unclassifies_everything() {
    let mut embedder = TableEmbedder::with_catalog_axes();
    // 0.5 is exactly representable: similarity == threshold, not above it.
    embedder.set("apolo hospitals", at_cosine(AX_HOSPITAL, 0.5));
    let bill = input(
        "Apolo Hospitals",
        vec![
            ("Radiology", vec![row("MRI BRAIN", 10770.0)]),
            ("Hospital", vec![row("UNKNOWN", 0.0)]),
        ],
    );

    let result = verify(embedder, &bill).await;
    assert!(!result.hospital.accepted);
    assert!((result.hospital.similarity - 0.5).abs() < 1e-9);

    let mri = &result.categories[0].items[0];
    assert_eq!(mri.status, ItemStatus::Unclassified);
    assert_eq!(mri.failure_reason, Some(FailureReason::HospitalNotMatched));

    // Artifacts are still filtered on the unmatched-hospital path.
    let header = &result.categories[1].items[0];
    assert_eq!(header.status, ItemStatus::IgnoredArtifact);

    assert_eq!(result.totals.unclassified, 10770.0);
    assert!(result.financials_balanced);
}

#[tokio::test]
async fn semantic_at_autoaccept_needs_no_arbiter() {
    let mut embedder = TableEmbedder::with_catalog_axes();
    embedder.set("xray thorax", at_cosine(AX_XRAY, 0.85));
    let bill = input(
        "Apollo Hospital",
        vec![("Radiology", vec![row("XRAY THORAX", 500.0)])],
    );

    // Arbiter present and answering "no match": an auto-accept must not ask.
    let result = verify_with_arbiter(embedder, &bill, Some(arbiter_matching(false))).await;
    let item = single_item(&result);
    assert_eq!(item.status, ItemStatus::Green);
    assert!(!item.arbitrated);
}

#[tokio::test]
async fn semantic_in_band_consults_arbiter() {
    let mut embedder = TableEmbedder::with_catalog_axes();
    // 0.75 is exact in binary; lexical scores stay below every accept rule.
    embedder.set("ct scan brain region", at_cosine(AX_CT, 0.75));
    let bill = input(
        "Apollo Hospital",
        vec![("Radiology", vec![row("CT SCAN BRAIN REGION", 4000.0)])],
    );

    // Without an arbiter the band item stays unmatched.
    let unarbitrated = verify_with_arbiter(embedder, &bill, None).await;
    let item = single_item(&unarbitrated);
    assert_eq!(item.status, ItemStatus::Unclassified);
    assert_eq!(item.failure_reason, Some(FailureReason::LowSimilarity));
    assert!(!item.arbitrated);

    let mut embedder2 = TableEmbedder::with_catalog_axes();
    embedder2.set("ct scan brain region", at_cosine(AX_CT, 0.75));
    let result = verify_with_arbiter(embedder2, &bill, Some(arbiter_matching(true))).await;
    let item = single_item(&result);
    assert_eq!(item.status, ItemStatus::Green);
    assert!(item.arbitrated);
    assert_eq!(item.matched.as_ref().unwrap().item_name, "CT Head");

    let mut embedder3 = TableEmbedder::with_catalog_axes();
    embedder3.set("ct scan brain region", at_cosine(AX_CT, 0.75));
    let rejected = verify_with_arbiter(embedder3, &bill, Some(arbiter_matching(false))).await;
    let item = single_item(&rejected);
    assert_eq!(item.status, ItemStatus::Unclassified);
    assert_eq!(item.failure_reason, Some(FailureReason::LowSimilarity));
    assert!(item.arbitrated);
}

#[tokio::test]
async fn below_band_never_consults_arbiter() {
    let mut embedder = TableEmbedder::with_catalog_axes();
    // 0.6875 is exact in binary and sits below the band floor.
    embedder.set("ct scan brain region", at_cosine(AX_CT, 0.6875));
    let bill = input(
        "Apollo Hospital",
        vec![("Radiology", vec![row("CT SCAN BRAIN REGION", 4000.0)])],
    );

    let result = verify_with_arbiter(embedder, &bill, Some(arbiter_matching(true))).await;
    let item = single_item(&result);
    assert_eq!(item.status, ItemStatus::Unclassified);
    assert_eq!(item.failure_reason, Some(FailureReason::LowSimilarity));
    assert!(!item.arbitrated);
}

#[tokio::test]
async fn unit_items_multiply_by_quantity() {
    let embedder = TableEmbedder::with_catalog_axes();
    let mut xray = row("X-RAY CHEST", 1200.0);
    xray.quantity = Some(2.0);
    let bill = input("Apollo Hospital", vec![("Radiology", vec![xray])]);

    let result = verify(embedder, &bill).await;
    let item = single_item(&result);
    // 2 × 500 allowed, billed 1200.
    assert_eq!(item.status, ItemStatus::Red);
    assert_eq!(item.allowed_amount, 1000.0);
    assert_eq!(item.extra_amount, 200.0);
}

#[tokio::test]
async fn mixed_bill_reconciles_and_counts() {
    let mut embedder = TableEmbedder::with_catalog_axes();
    embedder.set("consultation first visit", axis(AX_CONSULTATION));
    embedder.set("experimental treatment z", at_cosine(AX_GENERAL, 0.35));
    let bill = input(
        "Apollo Hospital",
        vec![
            (
                "Consultation",
                vec![row("1. CONSULTATION - FIRST VISIT | Dr. A. Kumar", 1500.0)],
            ),
            ("Radiology", vec![row("MRI BRAIN | Dr. X", 10770.0)]),
            (
                "Misc",
                vec![
                    row("Registration Fee", 200.0),
                    row("Experimental Treatment Z", 10000.0),
                ],
            ),
            ("Hospital", vec![row("UNKNOWN", 0.0)]),
        ],
    );

    let result = verify(embedder, &bill).await;
    let s = &result.summary;
    assert_eq!(
        (s.green, s.red, s.unclassified, s.allowed_not_comparable, s.mismatch, s.ignored_artifact),
        (1, 1, 1, 1, 0, 1)
    );
    assert_eq!(s.total(), 5);

    let t = &result.totals;
    assert_eq!(t.bill, 1500.0 + 10770.0 + 200.0 + 10000.0);
    assert_eq!(t.allowed, 1500.0 + 8500.0);
    assert_eq!(t.extra, 2270.0);
    assert_eq!(t.unclassified, 10200.0);
    assert!(result.financials_balanced);
    assert!(result.diagnostics.is_empty());

    // Completeness and counters hold for the full result.
    assert!(tieup_rs::render::validate_completeness(&bill, &result).is_empty());
    assert!(tieup_rs::render::validate_counters(&result).is_empty());
}

#[tokio::test]
async fn category_order_and_cardinality_are_preserved() {
    let mut embedder = TableEmbedder::with_catalog_axes();
    embedder.set("consultation first visit", axis(AX_CONSULTATION));
    let bill = input(
        "Apollo Hospital",
        vec![
            ("Radiology", vec![row("MRI BRAIN", 9000.0), row("MRI BRAIN", 9000.0)]),
            ("Consultation", vec![row("Consultation", 1500.0)]),
        ],
    );

    let result = verify(embedder, &bill).await;
    assert_eq!(result.categories[0].input_name, "Radiology");
    assert_eq!(result.categories[1].input_name, "Consultation");
    // Duplicate rows stay duplicate rows.
    assert_eq!(result.categories[0].items.len(), 2);
    assert_eq!(result.summary.red, 2);
}
