//! Postgres state store
//!
//! One row per upload in the `uploads` table; bill and verification
//! documents live in JSONB columns. Every lifecycle transition is a single
//! conditional `UPDATE`, and the queue claim is a `FOR UPDATE SKIP LOCKED`
//! subselect, so multiple worker processes can share one database without
//! double-claiming.

use super::{filter_artifacts, CreatedUpload, ListFilter, ListScope, ReconcileOutcome, StateStore};
use crate::error::{Error, Result};
use crate::types::{
    ExtractedBill, LineItemEdit, UploadMeta, UploadRecord, UploadStatus, VerificationResult,
    VerificationStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{info, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS uploads (
    upload_id             TEXT PRIMARY KEY,
    ingestion_request_id  TEXT NOT NULL,
    employee_id           TEXT NOT NULL,
    hospital_name         TEXT NOT NULL,
    original_filename     TEXT NOT NULL,
    file_size_bytes       BIGINT NOT NULL,
    page_count            INTEGER,
    invoice_date          DATE,
    status                TEXT NOT NULL,
    verification_status   TEXT NOT NULL DEFAULT 'NONE',
    queue_position        BIGINT NOT NULL DEFAULT 0,
    queue_lease_expires_at TIMESTAMPTZ,
    processing_started_at TIMESTAMPTZ,
    completed_at          TIMESTAMPTZ,
    error_message         TEXT,
    is_deleted            BOOLEAN NOT NULL DEFAULT FALSE,
    deleted_at            TIMESTAMPTZ,
    deleted_by            TEXT,
    bill                  JSONB,
    verification_result   JSONB,
    verification_report   TEXT,
    line_item_edits       JSONB NOT NULL DEFAULT '[]'::jsonb,
    created_at            TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at            TIMESTAMPTZ NOT NULL DEFAULT now()
);

-- Sparse idempotency key: FAILED records do not absorb retries.
CREATE UNIQUE INDEX IF NOT EXISTS uploads_request_id
    ON uploads (ingestion_request_id) WHERE status <> 'FAILED';
CREATE INDEX IF NOT EXISTS uploads_status_updated ON uploads (status, updated_at);
CREATE INDEX IF NOT EXISTS uploads_deleted ON uploads (is_deleted, deleted_at);
"#;

const COLUMNS: &str = "upload_id, ingestion_request_id, employee_id, hospital_name, \
     original_filename, file_size_bytes, page_count, invoice_date, status, \
     verification_status, queue_position, queue_lease_expires_at, \
     processing_started_at, completed_at, error_message, is_deleted, deleted_at, \
     deleted_by, bill, verification_result, verification_report, line_item_edits, \
     created_at, updated_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("uploads schema ensured");
        Ok(())
    }

    async fn fetch(&self, upload_id: &str) -> Result<UploadRecord> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM uploads WHERE upload_id = $1",
            COLUMNS
        ))
        .bind(upload_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(upload_id.to_string()))?;
        record_from_row(&row)
    }

    async fn renumber(&self) -> Result<()> {
        sqlx::query(
            "WITH ranked AS (
                 SELECT upload_id,
                        ROW_NUMBER() OVER (ORDER BY queue_position, created_at) AS rn
                 FROM uploads
                 WHERE status = 'PENDING' AND is_deleted = FALSE
             )
             UPDATE uploads u
             SET queue_position = r.rn, updated_at = now()
             FROM ranked r
             WHERE u.upload_id = r.upload_id AND u.queue_position <> r.rn",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn status_from_str(s: &str) -> Result<UploadStatus> {
    match s {
        "PENDING" => Ok(UploadStatus::Pending),
        "PROCESSING" => Ok(UploadStatus::Processing),
        "COMPLETED" => Ok(UploadStatus::Completed),
        "FAILED" => Ok(UploadStatus::Failed),
        other => Err(Error::StoreUnavailable(format!(
            "unknown status {:?} in store",
            other
        ))),
    }
}

fn verification_status_from_str(s: &str) -> Result<VerificationStatus> {
    match s {
        "NONE" => Ok(VerificationStatus::None),
        "PROCESSING" => Ok(VerificationStatus::Processing),
        "COMPLETED" => Ok(VerificationStatus::Completed),
        "FAILED" => Ok(VerificationStatus::Failed),
        other => Err(Error::StoreUnavailable(format!(
            "unknown verification status {:?} in store",
            other
        ))),
    }
}

fn record_from_row(row: &PgRow) -> Result<UploadRecord> {
    let bill: Option<sqlx::types::Json<ExtractedBill>> = row.try_get("bill")?;
    let verification: Option<sqlx::types::Json<VerificationResult>> =
        row.try_get("verification_result")?;
    let edits: sqlx::types::Json<Vec<LineItemEdit>> = row.try_get("line_item_edits")?;
    let status: String = row.try_get("status")?;
    let verification_status: String = row.try_get("verification_status")?;
    Ok(UploadRecord {
        upload_id: row.try_get("upload_id")?,
        ingestion_request_id: row.try_get("ingestion_request_id")?,
        employee_id: row.try_get("employee_id")?,
        hospital_name: row.try_get("hospital_name")?,
        original_filename: row.try_get("original_filename")?,
        file_size_bytes: row.try_get::<i64, _>("file_size_bytes")? as u64,
        page_count: row
            .try_get::<Option<i32>, _>("page_count")?
            .map(|n| n as u32),
        invoice_date: row.try_get("invoice_date")?,
        status: status_from_str(&status)?,
        verification_status: verification_status_from_str(&verification_status)?,
        queue_position: row.try_get("queue_position")?,
        queue_lease_expires_at: row.try_get("queue_lease_expires_at")?,
        processing_started_at: row.try_get("processing_started_at")?,
        completed_at: row.try_get("completed_at")?,
        error_message: row.try_get("error_message")?,
        is_deleted: row.try_get("is_deleted")?,
        deleted_at: row.try_get("deleted_at")?,
        deleted_by: row.try_get("deleted_by")?,
        bill: bill.map(|j| j.0),
        verification_result: verification.map(|j| j.0),
        verification_report: row.try_get("verification_report")?,
        line_item_edits: edits.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl StateStore for PgStore {
    async fn create_upload_record(&self, meta: &UploadMeta) -> Result<CreatedUpload> {
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        let inserted = sqlx::query(&format!(
            "INSERT INTO uploads (upload_id, ingestion_request_id, employee_id, \
                 hospital_name, original_filename, file_size_bytes, page_count, \
                 invoice_date, status, verification_status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'PENDING', 'NONE')
             ON CONFLICT (ingestion_request_id) WHERE status <> 'FAILED' DO NOTHING
             RETURNING {}",
            COLUMNS
        ))
        .bind(&upload_id)
        .bind(&meta.ingestion_request_id)
        .bind(&meta.employee_id)
        .bind(&meta.hospital_name)
        .bind(&meta.original_filename)
        .bind(meta.file_size_bytes as i64)
        .bind(meta.page_count.map(|n| n as i32))
        .bind(meta.invoice_date)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => Ok(CreatedUpload {
                record: record_from_row(&row)?,
                created: true,
            }),
            None => {
                // Another upload with this request id is active; hand it back.
                let row = sqlx::query(&format!(
                    "SELECT {} FROM uploads \
                     WHERE ingestion_request_id = $1 AND status <> 'FAILED'",
                    COLUMNS
                ))
                .bind(&meta.ingestion_request_id)
                .fetch_one(&self.pool)
                .await?;
                Ok(CreatedUpload {
                    record: record_from_row(&row)?,
                    created: false,
                })
            }
        }
    }

    async fn enqueue_upload_job(&self, upload_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "UPDATE uploads
             SET status = 'PENDING',
                 queue_position = CASE
                     WHEN status = 'PENDING' AND queue_position > 0 THEN queue_position
                     ELSE (SELECT COALESCE(MAX(queue_position), 0) + 1
                           FROM uploads WHERE status = 'PENDING')
                 END,
                 updated_at = now()
             WHERE upload_id = $1
             RETURNING queue_position",
        )
        .bind(upload_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(upload_id.to_string()))?;
        Ok(row.try_get("queue_position")?)
    }

    async fn claim_next_pending_job(&self, lease_ttl: Duration) -> Result<Option<UploadRecord>> {
        let lease = Utc::now()
            + ChronoDuration::from_std(lease_ttl).unwrap_or_else(|_| ChronoDuration::seconds(600));
        let row = sqlx::query(&format!(
            "UPDATE uploads
             SET status = 'PROCESSING',
                 queue_lease_expires_at = $1,
                 processing_started_at = now(),
                 queue_position = 0,
                 updated_at = now()
             WHERE upload_id = (
                 SELECT upload_id FROM uploads
                 WHERE status = 'PENDING'
                   AND is_deleted = FALSE
                   AND (queue_lease_expires_at IS NULL OR queue_lease_expires_at < now())
                 ORDER BY queue_position ASC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {}",
            COLUMNS
        ))
        .bind(lease)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                self.renumber().await?;
                Ok(Some(record_from_row(&row)?))
            }
            None => Ok(None),
        }
    }

    async fn mark_processing(&self, upload_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE uploads
             SET status = 'PROCESSING',
                 processing_started_at = COALESCE(processing_started_at, now()),
                 queue_position = 0,
                 error_message = NULL,
                 updated_at = now()
             WHERE upload_id = $1 AND status IN ('PENDING', 'FAILED', 'PROCESSING')",
        )
        .bind(upload_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        // Either missing or COMPLETED; fetch to tell the two apart.
        let record = self.fetch(upload_id).await?;
        Err(Error::InvalidTransition {
            upload_id: upload_id.to_string(),
            detail: format!("mark_processing from {}", record.status.as_str()),
        })
    }

    async fn complete_bill(
        &self,
        upload_id: &str,
        bill: ExtractedBill,
        page_count: Option<u32>,
    ) -> Result<()> {
        let (filtered, removed) = filter_artifacts(bill);
        if removed > 0 {
            warn!(upload_id, removed, "artifact rows filtered before persistence");
        }
        let result = sqlx::query(
            "UPDATE uploads
             SET status = 'COMPLETED',
                 bill = $2,
                 page_count = COALESCE($3, page_count),
                 completed_at = now(),
                 queue_lease_expires_at = NULL,
                 error_message = NULL,
                 updated_at = now()
             WHERE upload_id = $1 AND status = 'PROCESSING'",
        )
        .bind(upload_id)
        .bind(sqlx::types::Json(&filtered))
        .bind(page_count.map(|n| n as i32))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        let record = self.fetch(upload_id).await?;
        if record.status == UploadStatus::Completed {
            // A re-claimed job finishing twice is a no-op.
            return Ok(());
        }
        Err(Error::InvalidTransition {
            upload_id: upload_id.to_string(),
            detail: format!("complete_bill from {}", record.status.as_str()),
        })
    }

    async fn mark_failed(&self, upload_id: &str, error: &str) -> Result<()> {
        let message = super::memory::truncate_error(error);
        let result = sqlx::query(
            "UPDATE uploads
             SET status = 'FAILED',
                 error_message = $2,
                 queue_lease_expires_at = NULL,
                 queue_position = 0,
                 updated_at = now()
             WHERE upload_id = $1 AND status <> 'COMPLETED'",
        )
        .bind(upload_id)
        .bind(&message)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        let record = self.fetch(upload_id).await?;
        Err(Error::InvalidTransition {
            upload_id: upload_id.to_string(),
            detail: format!("mark_failed from {}", record.status.as_str()),
        })
    }

    async fn mark_verification_processing(&self, upload_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE uploads
             SET verification_status = 'PROCESSING', updated_at = now()
             WHERE upload_id = $1 AND status = 'COMPLETED' AND bill IS NOT NULL",
        )
        .bind(upload_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        self.fetch(upload_id).await?;
        Err(Error::NotReady(format!("{} has no extracted bill", upload_id)))
    }

    async fn save_verification_result(
        &self,
        upload_id: &str,
        result: &VerificationResult,
        report: &str,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE uploads
             SET verification_status = 'COMPLETED',
                 verification_result = $2,
                 verification_report = $3,
                 updated_at = now()
             WHERE upload_id = $1 AND bill IS NOT NULL",
        )
        .bind(upload_id)
        .bind(sqlx::types::Json(result))
        .bind(report)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 1 {
            return Ok(());
        }
        self.fetch(upload_id).await?;
        Err(Error::NotReady(format!("{} has no extracted bill", upload_id)))
    }

    async fn mark_verification_failed(&self, upload_id: &str, error: &str) -> Result<()> {
        let message = super::memory::truncate_error(error);
        let result = sqlx::query(
            "UPDATE uploads
             SET verification_status = 'FAILED', error_message = $2, updated_at = now()
             WHERE upload_id = $1",
        )
        .bind(upload_id)
        .bind(&message)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(upload_id.to_string()));
        }
        Ok(())
    }

    async fn save_line_item_edits(
        &self,
        upload_id: &str,
        edits: &[LineItemEdit],
    ) -> Result<UploadRecord> {
        let row = sqlx::query(&format!(
            "UPDATE uploads
             SET line_item_edits = $2, updated_at = now()
             WHERE upload_id = $1
             RETURNING {}",
            COLUMNS
        ))
        .bind(upload_id)
        .bind(sqlx::types::Json(edits))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(upload_id.to_string()))?;
        record_from_row(&row)
    }

    async fn get_upload(&self, upload_id: &str) -> Result<UploadRecord> {
        self.fetch(upload_id).await
    }

    async fn list_uploads(&self, filter: &ListFilter) -> Result<Vec<UploadRecord>> {
        let mut qb = sqlx::QueryBuilder::new(format!(
            "SELECT {} FROM uploads WHERE TRUE",
            COLUMNS
        ));
        match filter.scope {
            ListScope::Active => {
                qb.push(" AND is_deleted = FALSE");
            }
            ListScope::Deleted => {
                qb.push(" AND is_deleted = TRUE");
            }
            ListScope::All => {}
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(hospital) = &filter.hospital {
            qb.push(" AND hospital_name ILIKE ")
                .push_bind(format!("%{}%", hospital));
        }
        if let Some(after) = filter.updated_after {
            qb.push(" AND updated_at >= ").push_bind(after);
        }
        if let Some(before) = filter.updated_before {
            qb.push(" AND updated_at <= ").push_bind(before);
        }
        qb.push(" ORDER BY updated_at DESC LIMIT ")
            .push_bind(filter.effective_limit() as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn soft_delete_upload(&self, upload_id: &str, deleted_by: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE uploads
             SET is_deleted = TRUE, deleted_at = now(), deleted_by = $2,
                 queue_position = 0, updated_at = now()
             WHERE upload_id = $1 AND is_deleted = FALSE",
        )
        .bind(upload_id)
        .bind(deleted_by)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let record = self.fetch(upload_id).await?;
            if record.is_deleted {
                return Err(Error::AlreadyDeleted(upload_id.to_string()));
            }
            return Err(Error::NotFound(upload_id.to_string()));
        }
        self.renumber().await
    }

    async fn restore_upload(&self, upload_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE uploads
             SET is_deleted = FALSE, deleted_at = NULL, deleted_by = NULL,
                 queue_position = CASE WHEN status = 'PENDING'
                     THEN (SELECT COALESCE(MAX(queue_position), 0) + 1
                           FROM uploads WHERE status = 'PENDING' AND is_deleted = FALSE)
                     ELSE queue_position END,
                 updated_at = now()
             WHERE upload_id = $1 AND is_deleted = TRUE",
        )
        .bind(upload_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let record = self.fetch(upload_id).await?;
            if !record.is_deleted {
                return Err(Error::NotDeleted(upload_id.to_string()));
            }
            return Err(Error::NotFound(upload_id.to_string()));
        }
        self.renumber().await
    }

    async fn hard_delete_upload(&self, upload_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM uploads WHERE upload_id = $1")
            .bind(upload_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(upload_id.to_string()));
        }
        self.renumber().await
    }

    async fn recompute_pending_queue_positions(&self) -> Result<()> {
        self.renumber().await
    }

    async fn reconcile_queue_state(&self, stale_after: Duration) -> Result<ReconcileOutcome> {
        let stale_cutoff = Utc::now()
            - ChronoDuration::from_std(stale_after)
                .unwrap_or_else(|_| ChronoDuration::seconds(3600));

        let demoted = sqlx::query(
            "UPDATE uploads
             SET status = 'FAILED',
                 error_message = 'stale: processing exceeded limit',
                 queue_lease_expires_at = NULL,
                 updated_at = now()
             WHERE status = 'PROCESSING' AND processing_started_at <= $1",
        )
        .bind(stale_cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            "UPDATE uploads
             SET status = 'PENDING',
                 queue_lease_expires_at = NULL,
                 queue_position = (SELECT COALESCE(MAX(queue_position), 0) + 1
                                   FROM uploads WHERE status = 'PENDING'),
                 updated_at = now()
             WHERE status = 'PROCESSING' AND queue_lease_expires_at < now()",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        self.renumber().await?;
        Ok(ReconcileOutcome {
            requeued: requeued as usize,
            demoted: demoted as usize,
        })
    }

    async fn list_expired_deleted(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM uploads WHERE is_deleted = TRUE AND deleted_at <= $1",
            COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }
}
