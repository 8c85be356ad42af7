//! Upload acceptance and the processing worker
//!
//! Acceptance is synchronous to the caller: validate, write the record,
//! stage the PDF bytes, enqueue, return a receipt. Everything expensive —
//! OCR, extraction, verification — runs on the single worker loop, which
//! claims one job at a time through the store's atomic claim. Any step
//! raising an error becomes a job-level failure; the loop itself never
//! crashes.

use crate::catalog::CatalogHandle;
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::extract::extract_bill;
use crate::ocr::PdfTextExtractor;
use crate::render;
use crate::store::StateStore;
use crate::types::{BillInput, UploadMeta, UploadReceipt, UploadRecord, VerificationResult};
use crate::verifier::BillVerifier;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// One upload submission
pub struct SubmitRequest {
    pub bytes: Vec<u8>,
    pub employee_id: String,
    pub hospital_name: String,
    pub original_filename: String,
    pub client_request_id: Option<String>,
    pub invoice_date: Option<NaiveDate>,
}

/// Staging subdirectory of one upload
pub fn staging_dir(base: &Path, upload_id: &str) -> PathBuf {
    base.join(upload_id)
}

/// Staged original PDF of one upload
pub fn staged_pdf_path(base: &Path, upload_id: &str) -> PathBuf {
    staging_dir(base, upload_id).join("original.pdf")
}

/// Remove an upload's staging subdirectory; missing is fine.
pub async fn remove_staging(base: &Path, upload_id: &str) {
    let dir = staging_dir(base, upload_id);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => debug!(upload_id, "staging removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(upload_id, "staging cleanup failed: {}", e),
    }
}

/// Idempotency key when the caller supplied none:
/// `sha256(employee_id ‖ hospital ‖ sha256(pdf))`.
fn derived_request_id(employee_id: &str, hospital_name: &str, bytes: &[u8]) -> String {
    let content: String = {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    };
    let mut hasher = Sha256::new();
    hasher.update(employee_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(hospital_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn validate_employee_id(employee_id: &str) -> Result<()> {
    if employee_id.len() == 8 && employee_id.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "employee id must be exactly 8 decimal digits, got {:?}",
            employee_id
        )))
    }
}

/// Accepts uploads and owns the worker wake event
pub struct UploadPipeline {
    store: Arc<dyn StateStore>,
    catalog: Arc<CatalogHandle>,
    queue: QueueConfig,
    wake: Arc<Notify>,
}

impl UploadPipeline {
    pub fn new(store: Arc<dyn StateStore>, catalog: Arc<CatalogHandle>, queue: QueueConfig) -> Self {
        Self {
            store,
            catalog,
            queue,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Shared wake handle for the worker loop.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn staging_base(&self) -> &Path {
        &self.queue.staging_dir
    }

    /// Validate, persist, stage and enqueue one upload.
    ///
    /// A duplicate active `ingestion_request_id` returns the existing
    /// record's receipt without creating or staging anything.
    pub async fn submit_upload(&self, req: SubmitRequest) -> Result<UploadReceipt> {
        validate_employee_id(&req.employee_id)?;
        if req.bytes.is_empty() {
            return Err(Error::InvalidInput("empty file".to_string()));
        }
        if self
            .catalog
            .snapshot()
            .hospital_named(&req.hospital_name)
            .is_err()
        {
            return Err(Error::InvalidInput(format!(
                "unknown hospital {:?}",
                req.hospital_name
            )));
        }

        let ingestion_request_id = req.client_request_id.clone().unwrap_or_else(|| {
            derived_request_id(&req.employee_id, &req.hospital_name, &req.bytes)
        });
        let meta = UploadMeta {
            ingestion_request_id,
            employee_id: req.employee_id.clone(),
            hospital_name: req.hospital_name.clone(),
            original_filename: req.original_filename.clone(),
            file_size_bytes: req.bytes.len() as u64,
            page_count: None,
            invoice_date: req.invoice_date,
        };

        let created = self.store.create_upload_record(&meta).await?;
        let record = created.record;
        if !created.created {
            info!(
                upload_id = %record.upload_id,
                "duplicate submission absorbed by existing record"
            );
            return Ok(receipt_of(&record));
        }

        let pdf_path = staged_pdf_path(&self.queue.staging_dir, &record.upload_id);
        if let Err(e) = self.stage_bytes(&pdf_path, &req.bytes).await {
            let _ = self
                .store
                .mark_failed(&record.upload_id, &format!("staging failed: {}", e))
                .await;
            return Err(e);
        }

        let queue_position = self.store.enqueue_upload_job(&record.upload_id).await?;
        self.wake.notify_one();
        info!(
            upload_id = %record.upload_id,
            queue_position,
            size = req.bytes.len(),
            "upload accepted"
        );

        Ok(UploadReceipt {
            upload_id: record.upload_id,
            status: crate::types::UploadStatus::Pending,
            queue_position,
            page_count: None,
            original_filename: req.original_filename,
            file_size_bytes: req.bytes.len() as u64,
        })
    }

    async fn stage_bytes(&self, pdf_path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = pdf_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(pdf_path, bytes).await?;
        Ok(())
    }
}

fn receipt_of(record: &UploadRecord) -> UploadReceipt {
    UploadReceipt {
        upload_id: record.upload_id.clone(),
        status: record.status,
        queue_position: record.queue_position,
        page_count: record.page_count,
        original_filename: record.original_filename.clone(),
        file_size_bytes: record.file_size_bytes,
    }
}

/// Re-run verification against the record's persisted bill.
///
/// Shared by the worker loop and the re-verify operation. Requires an
/// extracted bill; errors with `NotReady` otherwise.
pub async fn run_verification(
    store: &dyn StateStore,
    catalog: &CatalogHandle,
    verifier: &BillVerifier,
    upload_id: &str,
) -> Result<VerificationResult> {
    let record = store.get_upload(upload_id).await?;
    let bill = record
        .bill
        .as_ref()
        .ok_or_else(|| Error::NotReady(format!("{} has no extracted bill", upload_id)))?;

    store.mark_verification_processing(upload_id).await?;
    let input = BillInput::from_extracted(&record.hospital_name, bill, &record.line_item_edits);
    let snapshot = catalog.snapshot();
    let mut result = verifier
        .verify_bill(&input, &snapshot, &record.line_item_edits)
        .await?;

    // Diagnostic-only validators; violations are logged and attached.
    for violation in render::validate_completeness(&input, &result)
        .into_iter()
        .chain(render::validate_counters(&result))
    {
        error!(upload_id, "{}", violation);
        result.diagnostics.push(violation);
    }

    let report = render::render_report(&result);
    store
        .save_verification_result(upload_id, &result, &report)
        .await?;
    Ok(result)
}

/// The single background worker: claim → OCR → extract → verify → cleanup
pub struct Worker {
    store: Arc<dyn StateStore>,
    catalog: Arc<CatalogHandle>,
    verifier: Arc<BillVerifier>,
    ocr: Arc<dyn PdfTextExtractor>,
    queue: QueueConfig,
    wake: Arc<Notify>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn StateStore>,
        catalog: Arc<CatalogHandle>,
        verifier: Arc<BillVerifier>,
        ocr: Arc<dyn PdfTextExtractor>,
        queue: QueueConfig,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            catalog,
            verifier,
            ocr,
            queue,
            wake,
        }
    }

    /// Run until `shutdown` flips to `true`. At most one job is in
    /// PROCESSING at any instant within this loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.queue.reconcile_interval_secs);
        let mut last_reconcile: Option<Instant> = None;
        info!("upload worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_reconcile.map_or(true, |t| t.elapsed() >= interval) {
                match self
                    .store
                    .reconcile_queue_state(Duration::from_secs(self.queue.stale_processing_secs))
                    .await
                {
                    Ok(outcome) if outcome.requeued > 0 || outcome.demoted > 0 => {
                        info!(
                            requeued = outcome.requeued,
                            demoted = outcome.demoted,
                            "queue reconciled"
                        );
                    }
                    Ok(_) => {}
                    // Lease management errors never crash the loop.
                    Err(e) => warn!("queue reconcile failed: {}", e),
                }
                last_reconcile = Some(Instant::now());
            }

            match self.process_one().await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    warn!("claim failed: {}", e);
                    tokio::time::sleep(interval).await;
                }
            }
        }
        info!("upload worker stopped");
    }

    /// Claim and fully process one job. `Ok(false)` means the queue was
    /// empty.
    pub async fn process_one(&self) -> Result<bool> {
        let lease = Duration::from_secs(self.queue.lease_ttl_secs);
        let Some(record) = self.store.claim_next_pending_job(lease).await? else {
            return Ok(false);
        };
        info!(upload_id = %record.upload_id, "job claimed");
        self.process_job(&record).await;
        Ok(true)
    }

    async fn process_job(&self, record: &UploadRecord) {
        let upload_id = record.upload_id.as_str();
        let pdf_path = staged_pdf_path(&self.queue.staging_dir, upload_id);

        match self.extract_stage(upload_id, &pdf_path).await {
            Ok(()) => {
                if let Err(e) = run_verification(
                    self.store.as_ref(),
                    &self.catalog,
                    &self.verifier,
                    upload_id,
                )
                .await
                {
                    error!(upload_id, "verification failed: {}", e);
                    let _ = self
                        .store
                        .mark_verification_failed(upload_id, &e.truncated_message(500))
                        .await;
                }
            }
            Err(e) => {
                error!(upload_id, "extraction failed: {}", e);
                let _ = self
                    .store
                    .mark_failed(upload_id, &e.truncated_message(500))
                    .await;
            }
        }

        // Scoped release: the staging directory goes away on success and
        // failure alike.
        remove_staging(&self.queue.staging_dir, upload_id).await;
    }

    async fn extract_stage(&self, upload_id: &str, pdf_path: &Path) -> Result<()> {
        let pages = self.ocr.extract_text(pdf_path).await?;
        if pages.iter().all(|p| p.is_blank()) {
            return Err(Error::OcrFailure(format!(
                "all {} pages empty",
                pages.len()
            )));
        }
        let bill = extract_bill(&pages);
        let page_count = u32::try_from(pages.len()).ok();
        self.store.complete_bill(upload_id, bill, page_count).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_employee_id_validation() {
        assert!(validate_employee_id("12345678").is_ok());
        assert!(validate_employee_id("1234567").is_err());
        assert!(validate_employee_id("123456789").is_err());
        assert!(validate_employee_id("1234567a").is_err());
        assert!(validate_employee_id("").is_err());
    }

    #[test]
    fn test_derived_request_id_is_deterministic() {
        let a = derived_request_id("12345678", "Apollo Hospital", b"pdf bytes");
        let b = derived_request_id("12345678", "Apollo Hospital", b"pdf bytes");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        // Any input change produces a different key.
        assert_ne!(a, derived_request_id("87654321", "Apollo Hospital", b"pdf bytes"));
        assert_ne!(a, derived_request_id("12345678", "Fortis", b"pdf bytes"));
        assert_ne!(a, derived_request_id("12345678", "Apollo Hospital", b"other"));
    }

    #[test]
    fn test_staging_paths() {
        let base = Path::new("uploads");
        assert_eq!(
            staged_pdf_path(base, "abc123"),
            PathBuf::from("uploads/abc123/original.pdf")
        );
    }
}
