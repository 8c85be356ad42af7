//! Error taxonomy for bill verification
//!
//! Every fallible operation in the crate returns [`Result`]. The worker loop
//! is the single place where errors are translated into state transitions
//! (`mark_failed`); no other component installs a blanket handler.

use thiserror::Error;

/// Error type for all core operations
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed caller input: bad employee id, empty file, unknown hospital
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The referenced upload record does not exist
    #[error("upload not found: {0}")]
    NotFound(String),

    /// The upload exists but has not reached the required stage yet
    #[error("upload not ready: {0}")]
    NotReady(String),

    /// Delete requested for a record that is already soft-deleted
    #[error("upload already deleted: {0}")]
    AlreadyDeleted(String),

    /// Restore requested for a record that is not soft-deleted
    #[error("upload not deleted: {0}")]
    NotDeleted(String),

    /// A rate-sheet file could not be loaded or validated
    #[error("catalog load error: {0}")]
    CatalogLoad(String),

    /// The asserted hospital has no rate sheet in the catalog
    #[error("hospital not found in catalog: {0}")]
    HospitalNotFound(String),

    /// Every page of the PDF failed text extraction.
    /// Partial page failures are absorbed into extraction warnings instead.
    #[error("OCR failed on all pages: {0}")]
    OcrFailure(String),

    /// Transport failure talking to the state store
    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    /// The embedding backend rejected a request
    #[error("embedding error: {0}")]
    Embedding(String),

    /// The chat backend failed after both primary and secondary attempts
    #[error("chat backend error: {0}")]
    ChatBackend(String),

    /// An upload record violated a lifecycle transition rule
    #[error("invalid state transition for {upload_id}: {detail}")]
    InvalidTransition { upload_id: String, detail: String },

    /// IO error occurred while staging or cleaning temp files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            other => Error::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::ChatBackend(err.to_string())
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Truncate an error message for persistence in `error_message`.
    /// Job failures store at most this many characters.
    pub fn truncated_message(&self, max_chars: usize) -> String {
        let msg = self.to_string();
        if msg.chars().count() <= max_chars {
            msg
        } else {
            let cut: String = msg.chars().take(max_chars).collect();
            format!("{}…", cut)
        }
    }
}
