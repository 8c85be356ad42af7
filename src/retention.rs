//! Retention worker
//!
//! Periodically hard-deletes soft-deleted records once they age past the
//! retention window, along with any leftover staging files. Each tick is
//! idempotent; failures are logged and the loop continues.

use crate::config::RetentionConfig;
use crate::pipeline::remove_staging;
use crate::store::StateStore;
use chrono::{Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct RetentionWorker {
    store: Arc<dyn StateStore>,
    config: RetentionConfig,
    staging_base: PathBuf,
}

impl RetentionWorker {
    pub fn new(store: Arc<dyn StateStore>, config: RetentionConfig, staging_base: PathBuf) -> Self {
        Self {
            store,
            config,
            staging_base,
        }
    }

    /// Run until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.cleanup_interval_secs);
        info!("retention worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.sweep_once().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("retention worker stopped");
    }

    /// One retention pass; purges everything past the window.
    pub async fn sweep_once(&self) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(self.config.retention_days);
        let expired = match self.store.list_expired_deleted(cutoff).await {
            Ok(records) => records,
            Err(e) => {
                warn!("retention scan failed: {}", e);
                return 0;
            }
        };

        let mut purged = 0;
        for record in expired {
            match self.store.hard_delete_upload(&record.upload_id).await {
                Ok(()) => {
                    remove_staging(&self.staging_base, &record.upload_id).await;
                    purged += 1;
                }
                Err(e) => warn!(
                    upload_id = %record.upload_id,
                    "retention delete failed: {}",
                    e
                ),
            }
        }
        if purged > 0 {
            info!(purged, "retention sweep complete");
        }
        purged
    }
}
