//! Caller-facing operations
//!
//! The facade the HTTP surface talks to. Handlers may only touch the state
//! store and the staging path through these operations; OCR, extraction and
//! verification always run on the worker loop — with the one exception of
//! explicit re-verification, which operates on an already-extracted bill.

use crate::catalog::CatalogHandle;
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::ocr::PdfTextExtractor;
use crate::pipeline::{remove_staging, run_verification, SubmitRequest, UploadPipeline, Worker};
use crate::retention::RetentionWorker;
use crate::store::{ListFilter, StateStore};
use crate::types::{
    HospitalSummary, LineItemEdit, UploadReceipt, UploadRecord, UploadStatus, VerificationResult,
    VerificationStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Point-in-time status of one upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub upload_id: String,
    pub status: UploadStatus,
    pub verification_status: VerificationStatus,
    pub processing_stage: String,
    pub queue_position: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Service facade over the processing backbone
pub struct BillService {
    store: Arc<dyn StateStore>,
    catalog: Arc<CatalogHandle>,
    verifier: Arc<crate::verifier::BillVerifier>,
    pipeline: UploadPipeline,
    queue: QueueConfig,
}

impl BillService {
    pub fn new(
        store: Arc<dyn StateStore>,
        catalog: Arc<CatalogHandle>,
        verifier: Arc<crate::verifier::BillVerifier>,
        queue: QueueConfig,
    ) -> Self {
        let pipeline = UploadPipeline::new(Arc::clone(&store), Arc::clone(&catalog), queue.clone());
        Self {
            store,
            catalog,
            verifier,
            pipeline,
            queue,
        }
    }

    /// Build the background worker sharing this service's wake event.
    pub fn worker(&self, ocr: Arc<dyn PdfTextExtractor>) -> Worker {
        Worker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.catalog),
            Arc::clone(&self.verifier),
            ocr,
            self.queue.clone(),
            self.pipeline.wake_handle(),
        )
    }

    /// Build the retention worker for this service's store and staging dir.
    pub fn retention_worker(&self, config: crate::config::RetentionConfig) -> RetentionWorker {
        RetentionWorker::new(
            Arc::clone(&self.store),
            config,
            self.queue.staging_dir.clone(),
        )
    }

    pub async fn submit_upload(&self, req: SubmitRequest) -> Result<UploadReceipt> {
        self.pipeline.submit_upload(req).await
    }

    pub async fn get_status(&self, upload_id: &str) -> Result<StatusSnapshot> {
        let record = self.store.get_upload(upload_id).await?;
        Ok(StatusSnapshot {
            processing_stage: record.processing_stage().to_string(),
            upload_id: record.upload_id,
            status: record.status,
            verification_status: record.verification_status,
            queue_position: record.queue_position,
            error_message: record.error_message,
            updated_at: record.updated_at,
        })
    }

    pub async fn list_bills(&self, filter: &ListFilter) -> Result<Vec<UploadRecord>> {
        self.store.list_uploads(filter).await
    }

    /// Full record with bill, verification result and rendered report.
    /// Queued or mid-extraction records are not ready; FAILED records are
    /// returned with their last-known stage and warnings.
    pub async fn get_bill_details(&self, upload_id: &str) -> Result<UploadRecord> {
        let record = self.store.get_upload(upload_id).await?;
        match record.status {
            UploadStatus::Pending | UploadStatus::Processing => Err(Error::NotReady(format!(
                "{} is {}",
                upload_id,
                record.processing_stage()
            ))),
            UploadStatus::Completed | UploadStatus::Failed => Ok(record),
        }
    }

    /// Persist manual line-item corrections and re-verify with them applied.
    pub async fn patch_line_items(
        &self,
        upload_id: &str,
        edits: &[LineItemEdit],
    ) -> Result<UploadRecord> {
        let record = self.store.get_upload(upload_id).await?;
        let bill = record
            .bill
            .as_ref()
            .ok_or_else(|| Error::NotReady(format!("{} has no extracted bill", upload_id)))?;

        for edit in edits {
            let category = bill
                .categories
                .iter()
                .find(|c| c.category_name == edit.category_name)
                .ok_or_else(|| {
                    Error::InvalidInput(format!("unknown category {:?}", edit.category_name))
                })?;
            if edit.item_index >= category.items.len() {
                return Err(Error::InvalidInput(format!(
                    "item index {} out of range for {:?}",
                    edit.item_index, edit.category_name
                )));
            }
        }

        self.store.save_line_item_edits(upload_id, edits).await?;
        run_verification(
            self.store.as_ref(),
            &self.catalog,
            &self.verifier,
            upload_id,
        )
        .await?;
        self.store.get_upload(upload_id).await
    }

    pub async fn verify_bill_again(&self, upload_id: &str) -> Result<VerificationResult> {
        match run_verification(
            self.store.as_ref(),
            &self.catalog,
            &self.verifier,
            upload_id,
        )
        .await
        {
            Ok(result) => Ok(result),
            // A verification that started and then failed must not stay
            // PROCESSING; pre-start errors leave the sub-state alone.
            Err(e @ (Error::NotFound(_) | Error::NotReady(_))) => Err(e),
            Err(e) => {
                let _ = self
                    .store
                    .mark_verification_failed(upload_id, &e.truncated_message(500))
                    .await;
                Err(e)
            }
        }
    }

    /// Soft-delete, or hard-delete plus staging cleanup when `permanent`.
    pub async fn delete_bill(
        &self,
        upload_id: &str,
        permanent: bool,
        deleted_by: &str,
    ) -> Result<()> {
        if permanent {
            self.store.hard_delete_upload(upload_id).await?;
            remove_staging(&self.queue.staging_dir, upload_id).await;
            info!(upload_id, deleted_by, "upload permanently deleted");
        } else {
            self.store.soft_delete_upload(upload_id, deleted_by).await?;
            info!(upload_id, deleted_by, "upload soft-deleted");
        }
        Ok(())
    }

    pub async fn restore_bill(&self, upload_id: &str) -> Result<UploadRecord> {
        self.store.restore_upload(upload_id).await?;
        self.store.get_upload(upload_id).await
    }

    pub fn list_hospitals(&self) -> Vec<HospitalSummary> {
        self.catalog.list_hospitals()
    }

    /// Rebuild the catalog from disk. Embedding is CPU-bound, so the
    /// rebuild runs off the async executor.
    pub async fn reload_catalog(&self) -> Result<Vec<HospitalSummary>> {
        let catalog = Arc::clone(&self.catalog);
        tokio::task::spawn_blocking(move || catalog.reload())
            .await
            .map_err(|e| Error::CatalogLoad(format!("reload task failed: {}", e)))??;
        Ok(self.catalog.list_hospitals())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchThresholds;
    use crate::embedding::{l2_normalize, Embedder};
    use crate::store::memory::MemoryStore;
    use crate::verifier::BillVerifier;
    use tempfile::TempDir;

    struct ByteEmbedder;

    impl Embedder for ByteEmbedder {
        fn model_id(&self) -> &str {
            "byte-test"
        }

        fn embed(&self, texts: &[&str]) -> crate::error::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; 16];
                    for (i, b) in t.bytes().enumerate() {
                        v[i % 16] += b as f32;
                    }
                    l2_normalize(v)
                })
                .collect())
        }
    }

    fn service(dir: &TempDir) -> BillService {
        std::fs::write(
            dir.path().join("apollo-hospital.json"),
            r#"{"hospital_name": "Apollo Hospital", "categories": [
                 {"category_name": "Consultation",
                  "items": [{"item_name": "Consultation", "rate": 1500, "type": "service"}]}]}"#,
        )
        .unwrap();
        let embedder: Arc<dyn Embedder> = Arc::new(ByteEmbedder);
        let catalog =
            Arc::new(CatalogHandle::load(dir.path(), Arc::clone(&embedder)).unwrap());
        let verifier = Arc::new(BillVerifier::new(
            embedder,
            MatchThresholds::default(),
            None,
        ));
        let queue = QueueConfig {
            staging_dir: dir.path().join("staging"),
            ..QueueConfig::default()
        };
        BillService::new(Arc::new(MemoryStore::new()), catalog, verifier, queue)
    }

    fn submit(hospital: &str) -> SubmitRequest {
        SubmitRequest {
            bytes: b"%PDF-1.4 test".to_vec(),
            employee_id: "12345678".to_string(),
            hospital_name: hospital.to_string(),
            original_filename: "bill.pdf".to_string(),
            client_request_id: None,
            invoice_date: None,
        }
    }

    #[tokio::test]
    async fn test_submit_and_status() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let receipt = svc.submit_upload(submit("Apollo Hospital")).await.unwrap();
        assert_eq!(receipt.status, UploadStatus::Pending);
        assert_eq!(receipt.queue_position, 1);

        let status = svc.get_status(&receipt.upload_id).await.unwrap();
        assert_eq!(status.processing_stage, "queued");
        assert!(svc.get_status("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_submit_unknown_hospital_rejected() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let err = svc.submit_upload(submit("Nowhere Clinic")).await;
        assert!(matches!(err, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_details_not_ready_while_queued() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let receipt = svc.submit_upload(submit("Apollo Hospital")).await.unwrap();
        assert!(matches!(
            svc.get_bill_details(&receipt.upload_id).await,
            Err(Error::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let receipt = svc.submit_upload(submit("Apollo Hospital")).await.unwrap();

        svc.delete_bill(&receipt.upload_id, false, "tester")
            .await
            .unwrap();
        assert!(matches!(
            svc.delete_bill(&receipt.upload_id, false, "tester").await,
            Err(Error::AlreadyDeleted(_))
        ));
        let restored = svc.restore_bill(&receipt.upload_id).await.unwrap();
        assert!(!restored.is_deleted);

        svc.delete_bill(&receipt.upload_id, true, "tester")
            .await
            .unwrap();
        assert!(matches!(
            svc.get_status(&receipt.upload_id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_hospitals_and_reload() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let before = svc.list_hospitals();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].hospital_name, "Apollo Hospital");
        assert_eq!(before[0].item_count, 1);

        std::fs::write(
            dir.path().join("fortis.json"),
            r#"{"hospital_name": "Fortis", "categories": []}"#,
        )
        .unwrap();
        let after = svc.reload_catalog().await.unwrap();
        assert_eq!(after.len(), 2);
    }
}
