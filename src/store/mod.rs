//! State store contract
//!
//! One document per upload; all lifecycle changes are updates through the
//! operations below. The pending queue lives inside the store: membership
//! is `status = PENDING` plus a positive `queue_position`, and the atomic
//! claim is the correctness mechanism for multi-process workers.
//!
//! Implementations: [`postgres::PgStore`] for durable deployments,
//! [`memory::MemoryStore`] for tests and broker-less single-process use.

use crate::error::Result;
use crate::types::{
    ExtractedBill, LineItemEdit, UploadMeta, UploadRecord, UploadStatus, VerificationResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod memory;
pub mod postgres;

/// Which records a listing sees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListScope {
    /// Only records that are not soft-deleted (the default)
    Active,

    /// Only soft-deleted records
    Deleted,

    /// Everything
    All,
}

/// Filters for `list_uploads`; results are most-recent `updated_at` first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListFilter {
    pub scope: ListScope,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<UploadStatus>,

    /// Case-insensitive substring of the asserted hospital name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hospital: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_after: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_before: Option<DateTime<Utc>>,

    pub limit: usize,
}

/// Hard cap applied to every listing
pub const LIST_LIMIT_MAX: usize = 500;

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            scope: ListScope::Active,
            status: None,
            hospital: None,
            updated_after: None,
            updated_before: None,
            limit: 100,
        }
    }
}

impl ListFilter {
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, LIST_LIMIT_MAX)
    }
}

/// Outcome of `create_upload_record`: the record plus whether this call
/// inserted it or found an active duplicate.
#[derive(Debug, Clone)]
pub struct CreatedUpload {
    pub record: UploadRecord,
    pub created: bool,
}

/// Outcome of one reconcile sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Expired-lease PROCESSING records returned to PENDING
    pub requeued: usize,

    /// Stale PROCESSING records demoted to FAILED
    pub demoted: usize,
}

/// Durable state behind the upload pipeline
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert exactly one record for this upload. A duplicate
    /// `ingestion_request_id` on a non-FAILED record returns that record
    /// instead of inserting.
    async fn create_upload_record(&self, meta: &UploadMeta) -> Result<CreatedUpload>;

    /// Make the record PENDING with the next queue position; returns the
    /// assigned position.
    async fn enqueue_upload_job(&self, upload_id: &str) -> Result<i64>;

    /// Atomically claim the lowest-positioned PENDING record without an
    /// active lease. At most one claimer succeeds per record.
    async fn claim_next_pending_job(&self, lease_ttl: Duration) -> Result<Option<UploadRecord>>;

    /// Idempotent PENDING/FAILED → PROCESSING transition for direct
    /// callers; no-op when already PROCESSING.
    async fn mark_processing(&self, upload_id: &str) -> Result<()>;

    /// Transition to COMPLETED and persist the extracted bill, along with
    /// the page count observed during extraction. Artifact rows are
    /// filtered before persistence; residuals are logged, not rejected.
    async fn complete_bill(
        &self,
        upload_id: &str,
        bill: ExtractedBill,
        page_count: Option<u32>,
    ) -> Result<()>;

    /// Transition to FAILED with a truncated message; clears the lease.
    async fn mark_failed(&self, upload_id: &str, error: &str) -> Result<()>;

    async fn mark_verification_processing(&self, upload_id: &str) -> Result<()>;

    /// Verification COMPLETED with its structured result and rendered text.
    async fn save_verification_result(
        &self,
        upload_id: &str,
        result: &VerificationResult,
        report: &str,
    ) -> Result<()>;

    async fn mark_verification_failed(&self, upload_id: &str, error: &str) -> Result<()>;

    /// Replace the manual-edit array; the extracted bill is untouched.
    async fn save_line_item_edits(
        &self,
        upload_id: &str,
        edits: &[LineItemEdit],
    ) -> Result<UploadRecord>;

    async fn get_upload(&self, upload_id: &str) -> Result<UploadRecord>;

    async fn list_uploads(&self, filter: &ListFilter) -> Result<Vec<UploadRecord>>;

    async fn soft_delete_upload(&self, upload_id: &str, deleted_by: &str) -> Result<()>;

    async fn restore_upload(&self, upload_id: &str) -> Result<()>;

    /// Remove the document outright. Temp-file cleanup is the caller's
    /// concern; the store only owns the row.
    async fn hard_delete_upload(&self, upload_id: &str) -> Result<()>;

    /// Renumber PENDING records so queue positions are contiguous from 1.
    async fn recompute_pending_queue_positions(&self) -> Result<()>;

    /// Revert expired-lease PROCESSING records to PENDING and demote
    /// PROCESSING records older than `stale_after` to FAILED, then
    /// renumber.
    async fn reconcile_queue_state(&self, stale_after: Duration) -> Result<ReconcileOutcome>;

    /// Soft-deleted records whose `deleted_at` is at or before `cutoff`;
    /// the retention worker feeds these to `hard_delete_upload`.
    async fn list_expired_deleted(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadRecord>>;
}

/// Drop artifact rows from an extracted bill before persistence.
///
/// Returns the filtered bill and how many rows were removed.
pub(crate) fn filter_artifacts(mut bill: ExtractedBill) -> (ExtractedBill, usize) {
    let mut removed = 0;
    for category in &mut bill.categories {
        let before = category.items.len();
        let name = category.category_name.clone();
        category.items.retain(|row| {
            !crate::artifact::is_artifact(
                &name,
                &row.item_name,
                row.rate.unwrap_or(row.amount),
                row.amount,
            )
        });
        removed += before - category.items.len();
    }
    bill.categories.retain(|c| !c.items.is_empty());
    (bill, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BillCategory, ItemRow};

    #[test]
    fn test_effective_limit_clamps() {
        let mut f = ListFilter::default();
        f.limit = 10_000;
        assert_eq!(f.effective_limit(), LIST_LIMIT_MAX);
        f.limit = 0;
        assert_eq!(f.effective_limit(), 1);
    }

    #[test]
    fn test_filter_artifacts_drops_header_rows() {
        let bill = ExtractedBill {
            categories: vec![BillCategory {
                category_name: "Hospital".to_string(),
                items: vec![
                    ItemRow {
                        item_name: "UNKNOWN".to_string(),
                        amount: 0.0,
                        quantity: None,
                        rate: None,
                        page: Some(1),
                        category: None,
                    },
                    ItemRow {
                        item_name: "Room Rent".to_string(),
                        amount: 2000.0,
                        quantity: None,
                        rate: None,
                        page: Some(1),
                        category: None,
                    },
                ],
            }],
            ..Default::default()
        };
        let (filtered, removed) = filter_artifacts(bill);
        assert_eq!(removed, 1);
        assert_eq!(filtered.item_count(), 1);
        assert_eq!(filtered.categories[0].items[0].item_name, "Room Rent");
    }

    #[test]
    fn test_filter_artifacts_drops_emptied_categories() {
        let bill = ExtractedBill {
            categories: vec![BillCategory {
                category_name: "Hospital".to_string(),
                items: vec![ItemRow {
                    item_name: "unknown".to_string(),
                    amount: 0.0,
                    quantity: None,
                    rate: None,
                    page: None,
                    category: None,
                }],
            }],
            ..Default::default()
        };
        let (filtered, removed) = filter_artifacts(bill);
        assert_eq!(removed, 1);
        assert!(filtered.categories.is_empty());
    }
}
