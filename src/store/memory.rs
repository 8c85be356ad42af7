//! In-memory state store
//!
//! A `Mutex<HashMap>` behind the same contract as the Postgres store, with
//! identical transition rules. Used by the lifecycle tests and usable as a
//! broker-less single-process deployment; nothing survives a restart.

use super::{filter_artifacts, CreatedUpload, ListFilter, ListScope, ReconcileOutcome, StateStore};
use crate::error::{Error, Result};
use crate::types::{
    ExtractedBill, LineItemEdit, UploadMeta, UploadRecord, UploadStatus, VerificationResult,
    VerificationStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// Persisted error messages are cut to this many characters.
pub(crate) const ERROR_MESSAGE_MAX: usize = 500;

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, UploadRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records<T>(&self, f: impl FnOnce(&mut HashMap<String, UploadRecord>) -> T) -> T {
        let mut guard = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    fn mutate<T>(
        &self,
        upload_id: &str,
        f: impl FnOnce(&mut UploadRecord) -> Result<T>,
    ) -> Result<T> {
        self.with_records(|records| {
            let record = records
                .get_mut(upload_id)
                .ok_or_else(|| Error::NotFound(upload_id.to_string()))?;
            let out = f(record)?;
            record.updated_at = Utc::now();
            Ok(out)
        })
    }
}

fn next_queue_position(records: &HashMap<String, UploadRecord>) -> i64 {
    records
        .values()
        .filter(|r| r.status == UploadStatus::Pending)
        .map(|r| r.queue_position)
        .max()
        .unwrap_or(0)
        + 1
}

fn renumber_pending(records: &mut HashMap<String, UploadRecord>) {
    let mut pending: Vec<(String, i64, DateTime<Utc>)> = records
        .values()
        .filter(|r| r.status == UploadStatus::Pending && !r.is_deleted)
        .map(|r| (r.upload_id.clone(), r.queue_position, r.created_at))
        .collect();
    pending.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));
    for (i, (id, _, _)) in pending.into_iter().enumerate() {
        if let Some(r) = records.get_mut(&id) {
            r.queue_position = i as i64 + 1;
        }
    }
}

pub(crate) fn truncate_error(error: &str) -> String {
    if error.chars().count() <= ERROR_MESSAGE_MAX {
        error.to_string()
    } else {
        let cut: String = error.chars().take(ERROR_MESSAGE_MAX).collect();
        format!("{}…", cut)
    }
}

fn new_record(meta: &UploadMeta) -> UploadRecord {
    let now = Utc::now();
    UploadRecord {
        upload_id: uuid::Uuid::new_v4().simple().to_string(),
        ingestion_request_id: meta.ingestion_request_id.clone(),
        employee_id: meta.employee_id.clone(),
        hospital_name: meta.hospital_name.clone(),
        original_filename: meta.original_filename.clone(),
        file_size_bytes: meta.file_size_bytes,
        page_count: meta.page_count,
        invoice_date: meta.invoice_date,
        status: UploadStatus::Pending,
        verification_status: VerificationStatus::None,
        queue_position: 0,
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
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create_upload_record(&self, meta: &UploadMeta) -> Result<CreatedUpload> {
        self.with_records(|records| {
            if let Some(existing) = records.values().find(|r| {
                r.ingestion_request_id == meta.ingestion_request_id
                    && r.status != UploadStatus::Failed
            }) {
                return Ok(CreatedUpload {
                    record: existing.clone(),
                    created: false,
                });
            }
            let record = new_record(meta);
            records.insert(record.upload_id.clone(), record.clone());
            Ok(CreatedUpload {
                record,
                created: true,
            })
        })
    }

    async fn enqueue_upload_job(&self, upload_id: &str) -> Result<i64> {
        self.with_records(|records| {
            let position = next_queue_position(records);
            let record = records
                .get_mut(upload_id)
                .ok_or_else(|| Error::NotFound(upload_id.to_string()))?;
            if record.queue_position > 0 && record.status == UploadStatus::Pending {
                return Ok(record.queue_position);
            }
            record.status = UploadStatus::Pending;
            record.queue_position = position;
            record.updated_at = Utc::now();
            Ok(position)
        })
    }

    async fn claim_next_pending_job(&self, lease_ttl: Duration) -> Result<Option<UploadRecord>> {
        self.with_records(|records| {
            let now = Utc::now();
            let candidate = records
                .values()
                .filter(|r| {
                    r.status == UploadStatus::Pending
                        && !r.is_deleted
                        && r.queue_lease_expires_at.map_or(true, |lease| lease < now)
                })
                .min_by_key(|r| (r.queue_position, r.created_at))
                .map(|r| r.upload_id.clone());
            let Some(id) = candidate else {
                return Ok(None);
            };
            let lease = now
                + ChronoDuration::from_std(lease_ttl)
                    .unwrap_or_else(|_| ChronoDuration::seconds(600));
            let record = records.get_mut(&id).ok_or_else(|| Error::NotFound(id.clone()))?;
            record.status = UploadStatus::Processing;
            record.queue_lease_expires_at = Some(lease);
            record.processing_started_at = Some(now);
            record.queue_position = 0;
            record.updated_at = now;
            let claimed = record.clone();
            renumber_pending(records);
            Ok(Some(claimed))
        })
    }

    async fn mark_processing(&self, upload_id: &str) -> Result<()> {
        self.mutate(upload_id, |record| match record.status {
            UploadStatus::Processing => Ok(()),
            UploadStatus::Pending | UploadStatus::Failed => {
                record.status = UploadStatus::Processing;
                record.queue_position = 0;
                record.error_message = None;
                if record.processing_started_at.is_none() {
                    record.processing_started_at = Some(Utc::now());
                }
                Ok(())
            }
            UploadStatus::Completed => Err(Error::InvalidTransition {
                upload_id: upload_id.to_string(),
                detail: "COMPLETED records cannot re-enter PROCESSING".to_string(),
            }),
        })
    }

    async fn complete_bill(
        &self,
        upload_id: &str,
        bill: ExtractedBill,
        page_count: Option<u32>,
    ) -> Result<()> {
        self.mutate(upload_id, |record| match record.status {
            // A re-claimed job completing a second time is a no-op.
            UploadStatus::Completed => Ok(()),
            UploadStatus::Processing => {
                let (filtered, removed) = filter_artifacts(bill);
                if removed > 0 {
                    warn!(upload_id, removed, "artifact rows filtered before persistence");
                }
                if page_count.is_some() {
                    record.page_count = page_count;
                }
                record.bill = Some(filtered);
                record.status = UploadStatus::Completed;
                record.completed_at = Some(Utc::now());
                record.queue_lease_expires_at = None;
                record.error_message = None;
                Ok(())
            }
            other => Err(Error::InvalidTransition {
                upload_id: upload_id.to_string(),
                detail: format!("complete_bill from {}", other.as_str()),
            }),
        })
    }

    async fn mark_failed(&self, upload_id: &str, error: &str) -> Result<()> {
        self.mutate(upload_id, |record| match record.status {
            UploadStatus::Completed => Err(Error::InvalidTransition {
                upload_id: upload_id.to_string(),
                detail: "COMPLETED records cannot fail extraction".to_string(),
            }),
            _ => {
                record.status = UploadStatus::Failed;
                record.error_message = Some(truncate_error(error));
                record.queue_lease_expires_at = None;
                record.queue_position = 0;
                Ok(())
            }
        })
    }

    async fn mark_verification_processing(&self, upload_id: &str) -> Result<()> {
        self.mutate(upload_id, |record| {
            if record.status != UploadStatus::Completed || record.bill.is_none() {
                return Err(Error::NotReady(format!(
                    "{} has no extracted bill",
                    upload_id
                )));
            }
            record.verification_status = VerificationStatus::Processing;
            Ok(())
        })
    }

    async fn save_verification_result(
        &self,
        upload_id: &str,
        result: &VerificationResult,
        report: &str,
    ) -> Result<()> {
        self.mutate(upload_id, |record| {
            if record.bill.is_none() {
                return Err(Error::NotReady(format!(
                    "{} has no extracted bill",
                    upload_id
                )));
            }
            record.verification_status = VerificationStatus::Completed;
            record.verification_result = Some(result.clone());
            record.verification_report = Some(report.to_string());
            Ok(())
        })
    }

    async fn mark_verification_failed(&self, upload_id: &str, error: &str) -> Result<()> {
        self.mutate(upload_id, |record| {
            record.verification_status = VerificationStatus::Failed;
            record.error_message = Some(truncate_error(error));
            Ok(())
        })
    }

    async fn save_line_item_edits(
        &self,
        upload_id: &str,
        edits: &[LineItemEdit],
    ) -> Result<UploadRecord> {
        self.mutate(upload_id, |record| {
            record.line_item_edits = edits.to_vec();
            Ok(record.clone())
        })
    }

    async fn get_upload(&self, upload_id: &str) -> Result<UploadRecord> {
        self.with_records(|records| {
            records
                .get(upload_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(upload_id.to_string()))
        })
    }

    async fn list_uploads(&self, filter: &ListFilter) -> Result<Vec<UploadRecord>> {
        self.with_records(|records| {
            let hospital_needle = filter.hospital.as_deref().map(str::to_lowercase);
            let mut hits: Vec<UploadRecord> = records
                .values()
                .filter(|r| match filter.scope {
                    ListScope::Active => !r.is_deleted,
                    ListScope::Deleted => r.is_deleted,
                    ListScope::All => true,
                })
                .filter(|r| filter.status.map_or(true, |s| r.status == s))
                .filter(|r| {
                    hospital_needle
                        .as_deref()
                        .map_or(true, |n| r.hospital_name.to_lowercase().contains(n))
                })
                .filter(|r| filter.updated_after.map_or(true, |t| r.updated_at >= t))
                .filter(|r| filter.updated_before.map_or(true, |t| r.updated_at <= t))
                .cloned()
                .collect();
            hits.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            hits.truncate(filter.effective_limit());
            Ok(hits)
        })
    }

    async fn soft_delete_upload(&self, upload_id: &str, deleted_by: &str) -> Result<()> {
        self.with_records(|records| {
            let record = records
                .get_mut(upload_id)
                .ok_or_else(|| Error::NotFound(upload_id.to_string()))?;
            if record.is_deleted {
                return Err(Error::AlreadyDeleted(upload_id.to_string()));
            }
            record.is_deleted = true;
            record.deleted_at = Some(Utc::now());
            record.deleted_by = Some(deleted_by.to_string());
            record.queue_position = 0;
            record.updated_at = Utc::now();
            renumber_pending(records);
            Ok(())
        })
    }

    async fn restore_upload(&self, upload_id: &str) -> Result<()> {
        self.with_records(|records| {
            let position = next_queue_position(records);
            let record = records
                .get_mut(upload_id)
                .ok_or_else(|| Error::NotFound(upload_id.to_string()))?;
            if !record.is_deleted {
                return Err(Error::NotDeleted(upload_id.to_string()));
            }
            record.is_deleted = false;
            record.deleted_at = None;
            record.deleted_by = None;
            if record.status == UploadStatus::Pending {
                record.queue_position = position;
            }
            record.updated_at = Utc::now();
            renumber_pending(records);
            Ok(())
        })
    }

    async fn hard_delete_upload(&self, upload_id: &str) -> Result<()> {
        self.with_records(|records| {
            records
                .remove(upload_id)
                .ok_or_else(|| Error::NotFound(upload_id.to_string()))?;
            renumber_pending(records);
            Ok(())
        })
    }

    async fn recompute_pending_queue_positions(&self) -> Result<()> {
        self.with_records(|records| {
            renumber_pending(records);
            Ok(())
        })
    }

    async fn reconcile_queue_state(&self, stale_after: Duration) -> Result<ReconcileOutcome> {
        self.with_records(|records| {
            let now = Utc::now();
            let stale_cutoff = now
                - ChronoDuration::from_std(stale_after)
                    .unwrap_or_else(|_| ChronoDuration::seconds(3600));
            let mut outcome = ReconcileOutcome::default();
            let next_position = next_queue_position(records);
            let mut requeue_offset = 0;
            for record in records.values_mut() {
                if record.status != UploadStatus::Processing {
                    continue;
                }
                let started = record.processing_started_at.unwrap_or(record.updated_at);
                if started <= stale_cutoff {
                    record.status = UploadStatus::Failed;
                    record.error_message = Some("stale: processing exceeded limit".to_string());
                    record.queue_lease_expires_at = None;
                    record.updated_at = now;
                    outcome.demoted += 1;
                } else if record
                    .queue_lease_expires_at
                    .map_or(false, |lease| lease < now)
                {
                    record.status = UploadStatus::Pending;
                    record.queue_lease_expires_at = None;
                    record.queue_position = next_position + requeue_offset;
                    requeue_offset += 1;
                    record.updated_at = now;
                    outcome.requeued += 1;
                }
            }
            renumber_pending(records);
            Ok(outcome)
        })
    }

    async fn list_expired_deleted(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadRecord>> {
        self.with_records(|records| {
            Ok(records
                .values()
                .filter(|r| r.is_deleted && r.deleted_at.map_or(false, |t| t <= cutoff))
                .cloned()
                .collect())
        })
    }
}
