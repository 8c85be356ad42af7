//! Core data types for bill verification
//!
//! One upload record per submitted PDF, one rate sheet per tie-up hospital,
//! and the verification result produced by matching the two. Lifecycle
//! sub-states are closed enums; optional bill fields are explicit `Option`s.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an upload record.
///
/// Transitions only advance along `PENDING → PROCESSING → COMPLETED|FAILED`;
/// a reconcile sweep may return an expired `PROCESSING` record to `PENDING`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    /// Accepted and queued, not yet claimed by a worker
    Pending,

    /// Claimed by a worker; a queue lease is active
    Processing,

    /// Extraction finished; the extracted bill is persisted
    Completed,

    /// A processing step failed; `error_message` holds the reason
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "PENDING",
            UploadStatus::Processing => "PROCESSING",
            UploadStatus::Completed => "COMPLETED",
            UploadStatus::Failed => "FAILED",
        }
    }
}

/// Verification sub-state, independent of the extraction lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    /// Verification has not been attempted
    None,

    /// The verifier is running against the extracted bill
    Processing,

    /// A verification result is persisted
    Completed,

    /// Verification raised an error
    Failed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::None => "NONE",
            VerificationStatus::Processing => "PROCESSING",
            VerificationStatus::Completed => "COMPLETED",
            VerificationStatus::Failed => "FAILED",
        }
    }
}

/// Per-item pricing classification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    /// Matched and billed at or under the tie-up rate
    Green,

    /// Matched and billed over the tie-up rate
    Red,

    /// Not matched; no admin/artifact/package explanation applies
    Unclassified,

    /// Administrative or otherwise non-comparable charge
    AllowedNotComparable,

    /// Best candidate is only billable as part of a bundle
    Mismatch,

    /// OCR/header fragment, not a real billable row
    IgnoredArtifact,
}

/// Explanation attached to items that are neither GREEN nor RED
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Best semantic similarity fell below the not-in-tieup floor
    NotInTieup,

    /// A candidate existed but no acceptance rule fired
    LowSimilarity,

    /// The best candidate is tagged bundle-only in the catalog
    PackageOnly,

    /// Registration fee, deposit, processing fee and similar charges
    AdminCharge,

    /// The asserted hospital did not match any catalog hospital
    HospitalNotMatched,
}

/// Pricing arrangement of a tie-up item
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Rate applies per unit; multiplied by quantity at price check time
    Unit,

    /// Flat rate per occurrence of the service
    Service,

    /// Rate covers a package; only billable as the whole bundle
    Bundle,
}

// ============================================================================
// Rate Sheet Types
// ============================================================================

/// A canonical billable entry from a hospital's rate sheet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieUpItem {
    /// Canonical item name as negotiated
    pub item_name: String,

    /// Negotiated rate in rupees; non-negative
    pub rate: f64,

    /// Pricing arrangement
    #[serde(rename = "type")]
    pub kind: ItemKind,
}

/// An ordered category of tie-up items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateCategory {
    pub category_name: String,
    pub items: Vec<TieUpItem>,
}

/// One hospital's rate sheet, loaded from a tie-up JSON file.
///
/// File naming is the slug of `hospital_name`; categories keep their
/// file order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSheet {
    pub hospital_name: String,
    pub categories: Vec<RateCategory>,
}

// ============================================================================
// Extracted Bill Types
// ============================================================================

/// One free-text line from an extracted bill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRow {
    /// Raw item text as extracted
    pub item_name: String,

    /// Final billed amount for the row, rupees, non-negative
    pub amount: f64,

    /// Billed quantity, when the row carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,

    /// Per-unit rate, when the row carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,

    /// 1-based page the row was extracted from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,

    /// Category the row was extracted under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Patient block from the bill header pages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatientInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
}

/// Bill-level header fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BillHeader {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bill_number: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_date: Option<NaiveDate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub admission_date: Option<NaiveDate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub discharge_date: Option<NaiveDate>,
}

/// A payment or receipt row from the bill's summary section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRow {
    /// Payment mode text as printed (cash, card, insurance, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    /// Paid amount in rupees
    pub amount: f64,
}

/// One named category of bill rows, in extraction order.
///
/// The source modeled categories as a name → rows map; an ordered list is
/// used here so input order survives into verification and rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillCategory {
    pub category_name: String,
    pub items: Vec<ItemRow>,
}

/// Structured bill produced by extraction, persisted on COMPLETED
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedBill {
    #[serde(default)]
    pub patient: PatientInfo,

    #[serde(default)]
    pub header: BillHeader,

    /// Categories in page order, rows in line order
    #[serde(default)]
    pub categories: Vec<BillCategory>,

    #[serde(default)]
    pub payments: Vec<PaymentRow>,

    /// Grand total as printed on the bill, when one was found
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grand_total: Option<f64>,

    /// Per-page parse problems absorbed during extraction
    #[serde(default)]
    pub extraction_warnings: Vec<String>,
}

impl ExtractedBill {
    /// Total number of extracted rows across all categories
    pub fn item_count(&self) -> usize {
        self.categories.iter().map(|c| c.items.len()).sum()
    }
}

/// Input to the bill verifier: the asserted hospital plus the extracted rows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillInput {
    pub hospital_name: String,
    pub categories: Vec<BillCategory>,
}

impl BillInput {
    /// Build a verifier input from an extracted bill and the caller-asserted
    /// hospital name, applying any persisted manual edits.
    pub fn from_extracted(
        hospital_name: &str,
        bill: &ExtractedBill,
        edits: &[LineItemEdit],
    ) -> Self {
        let mut categories = bill.categories.clone();
        for edit in edits {
            if let Some(cat) = categories
                .iter_mut()
                .find(|c| c.category_name == edit.category_name)
            {
                if let Some(row) = cat.items.get_mut(edit.item_index) {
                    if let Some(qty) = edit.quantity {
                        row.quantity = Some(qty);
                    }
                    if let Some(rate) = edit.rate {
                        row.rate = Some(rate);
                    }
                }
            }
        }
        Self {
            hospital_name: hospital_name.to_string(),
            categories,
        }
    }
}

/// A manual correction to one extracted line item.
///
/// Edits are persisted separately and applied when a verifier input is
/// built; the extracted bill itself is never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemEdit {
    pub category_name: String,

    /// Index of the row within its category, in extraction order
    pub item_index: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,

    /// Override for the tie-up rate used at price check time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tieup_rate: Option<f64>,
}

// ============================================================================
// Verification Result Types
// ============================================================================

/// A scored candidate from the item index, kept for the debug view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub name: String,
    pub semantic: f64,
    pub token_overlap: f64,
    pub containment: f64,
    pub hybrid: f64,
}

/// The tie-up item an accepted bill row was matched to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedTieUp {
    pub item_name: String,
    pub rate: f64,
    pub kind: ItemKind,

    /// Semantic similarity of the winning candidate
    pub similarity: f64,
}

/// Per-item verification outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResult {
    /// Original bill text, unmodified
    pub item_name: String,

    /// Normalized form used for matching
    pub normalized_name: String,

    pub status: ItemStatus,

    pub bill_amount: f64,

    /// Allowed amount; 0 for everything except GREEN/RED
    pub allowed_amount: f64,

    /// Overbilled amount; non-zero only for RED
    pub extra_amount: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<MatchedTieUp>,

    /// Top-K candidates with scores; empty for artifacts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<ScoredCandidate>,

    /// Whether the LLM arbiter decided this item
    #[serde(default)]
    pub arbitrated: bool,
}

/// Per-category verification outcome, preserving input order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryResult {
    /// Category name as it appeared on the bill
    pub input_name: String,

    /// Best catalog category, also recorded when below threshold
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,

    /// True when the match fell in the soft band and was used with a warning
    #[serde(default)]
    pub soft_matched: bool,

    /// True when item matching searched the hospital-wide union index
    #[serde(default)]
    pub searched_union: bool,

    pub items: Vec<ItemResult>,
}

/// Counts per item status
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSummary {
    pub green: usize,
    pub red: usize,
    pub unclassified: usize,
    pub allowed_not_comparable: usize,
    pub mismatch: usize,
    pub ignored_artifact: usize,
}

impl StatusSummary {
    pub fn total(&self) -> usize {
        self.green
            + self.red
            + self.unclassified
            + self.allowed_not_comparable
            + self.mismatch
            + self.ignored_artifact
    }

    pub fn record(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Green => self.green += 1,
            ItemStatus::Red => self.red += 1,
            ItemStatus::Unclassified => self.unclassified += 1,
            ItemStatus::AllowedNotComparable => self.allowed_not_comparable += 1,
            ItemStatus::Mismatch => self.mismatch += 1,
            ItemStatus::IgnoredArtifact => self.ignored_artifact += 1,
        }
    }
}

/// Bill-level financial totals
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FinancialTotals {
    /// Sum of bill amounts over every non-artifact item
    pub bill: f64,

    /// Sum of allowed amounts over GREEN and RED items
    pub allowed: f64,

    /// Sum of extra amounts over RED items
    pub extra: f64,

    /// Sum of bill amounts over UNCLASSIFIED, MISMATCH and
    /// ALLOWED_NOT_COMPARABLE items
    pub unclassified: f64,
}

/// Hospital match recorded at verification stage 1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HospitalMatch {
    /// Best catalog hospital name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_name: Option<String>,

    pub similarity: f64,

    /// Whether the similarity cleared the hospital threshold
    pub accepted: bool,
}

/// Complete verification outcome for one bill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub hospital: HospitalMatch,
    pub categories: Vec<CategoryResult>,
    pub summary: StatusSummary,
    pub totals: FinancialTotals,

    /// `totals.bill == totals.allowed + totals.extra + totals.unclassified`
    /// within tolerance
    pub financials_balanced: bool,

    /// Diagnostic violations detected during validation; never raised
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

// ============================================================================
// Upload Record Types
// ============================================================================

/// Metadata captured when an upload is accepted
#[derive(Debug, Clone)]
pub struct UploadMeta {
    /// Unique, sparse idempotency key
    pub ingestion_request_id: String,

    /// Exactly 8 decimal digits
    pub employee_id: String,

    /// Caller-asserted hospital name
    pub hospital_name: String,

    pub original_filename: String,

    /// Size of the original PDF, not any derived images
    pub file_size_bytes: u64,

    pub page_count: Option<u32>,

    pub invoice_date: Option<NaiveDate>,
}

/// One document per submitted PDF.
///
/// `upload_id` and `ingestion_request_id` are immutable once written; the
/// extracted bill appears only when `status = COMPLETED`, and a verification
/// result only when an extracted bill exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    /// Random 128-bit hex primary key
    pub upload_id: String,

    pub ingestion_request_id: String,

    pub employee_id: String,

    pub hospital_name: String,

    pub original_filename: String,

    pub file_size_bytes: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_date: Option<NaiveDate>,

    pub status: UploadStatus,

    pub verification_status: VerificationStatus,

    /// 1-based position in the pending queue; 0 once claimed or finished
    pub queue_position: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_lease_expires_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub is_deleted: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bill: Option<ExtractedBill>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_result: Option<VerificationResult>,

    /// Plain-text rendering of the verification result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_report: Option<String>,

    #[serde(default)]
    pub line_item_edits: Vec<LineItemEdit>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl UploadRecord {
    /// Derived user-facing stage from the two lifecycle sub-states
    pub fn processing_stage(&self) -> &'static str {
        match (self.status, self.verification_status) {
            (UploadStatus::Pending, _) => "queued",
            (UploadStatus::Processing, _) => "extracting",
            (UploadStatus::Failed, _) => "failed",
            (UploadStatus::Completed, VerificationStatus::None) => "extracted",
            (UploadStatus::Completed, VerificationStatus::Processing) => "verifying",
            (UploadStatus::Completed, VerificationStatus::Completed) => "done",
            (UploadStatus::Completed, VerificationStatus::Failed) => "verification_failed",
        }
    }
}

/// Snapshot returned by `submit_upload`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub upload_id: String,
    pub status: UploadStatus,
    pub queue_position: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    pub original_filename: String,
    pub file_size_bytes: u64,
}

/// Catalog snapshot entry returned by `list_hospitals`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HospitalSummary {
    pub hospital_name: String,
    pub category_count: usize,
    pub item_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization_is_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&UploadStatus::Pending).unwrap(),
            "\"PENDING\""
        );
        assert_eq!(
            serde_json::to_string(&ItemStatus::AllowedNotComparable).unwrap(),
            "\"ALLOWED_NOT_COMPARABLE\""
        );
        assert_eq!(
            serde_json::to_string(&FailureReason::NotInTieup).unwrap(),
            "\"NOT_IN_TIEUP\""
        );
    }

    #[test]
    fn test_item_kind_round_trip() {
        let json = r#"{"item_name":"MRI Brain","rate":8500.0,"type":"service"}"#;
        let item: TieUpItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.kind, ItemKind::Service);
        let back = serde_json::to_string(&item).unwrap();
        assert!(back.contains("\"type\":\"service\""));
    }

    #[test]
    fn test_summary_record_and_total() {
        let mut s = StatusSummary::default();
        s.record(ItemStatus::Green);
        s.record(ItemStatus::Green);
        s.record(ItemStatus::Red);
        s.record(ItemStatus::IgnoredArtifact);
        assert_eq!(s.green, 2);
        assert_eq!(s.total(), 4);
    }

    #[test]
    fn test_processing_stage_derivation() {
        let mut rec = sample_record();
        assert_eq!(rec.processing_stage(), "queued");
        rec.status = UploadStatus::Completed;
        rec.verification_status = VerificationStatus::Completed;
        assert_eq!(rec.processing_stage(), "done");
        rec.verification_status = VerificationStatus::Processing;
        assert_eq!(rec.processing_stage(), "verifying");
    }

    #[test]
    fn test_bill_input_applies_edits() {
        let bill = ExtractedBill {
            categories: vec![BillCategory {
                category_name: "Pharmacy".to_string(),
                items: vec![ItemRow {
                    item_name: "Nicorandil 5mg".to_string(),
                    amount: 120.0,
                    quantity: Some(2.0),
                    rate: Some(60.0),
                    page: Some(1),
                    category: None,
                }],
            }],
            ..Default::default()
        };
        let edits = vec![LineItemEdit {
            category_name: "Pharmacy".to_string(),
            item_index: 0,
            quantity: Some(3.0),
            rate: None,
            tieup_rate: None,
        }];
        let input = BillInput::from_extracted("Apollo Hospital", &bill, &edits);
        assert_eq!(input.categories[0].items[0].quantity, Some(3.0));
        assert_eq!(input.categories[0].items[0].rate, Some(60.0));
    }

    fn sample_record() -> UploadRecord {
        UploadRecord {
            upload_id: "a".repeat(32),
            ingestion_request_id: "req-1".to_string(),
            employee_id: "12345678".to_string(),
            hospital_name: "Apollo Hospital".to_string(),
            original_filename: "bill.pdf".to_string(),
            file_size_bytes: 1024,
            page_count: Some(2),
            invoice_date: None,
            status: UploadStatus::Pending,
            verification_status: VerificationStatus::None,
            queue_position: 1,
            queue_lease_expires_at: None,
            processing_started_at: None,
            completed_at: None,
            error_message: None,
            is_deleted: false,
            deleted_at: None,
            deleted_by: None,
            bill: None,
            verification_result: None,
            verification_report: None,
            line_item_edits: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
