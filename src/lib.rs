//! # tieup-rs
//!
//! A Rust library for verifying hospital bills against pre-negotiated
//! tie-up rate sheets.
//!
//! The crate has two halves:
//!
//! - An **upload pipeline**: a durable single-claim job queue inside the
//!   state store, a state machine per upload, and one background worker
//!   driving OCR → extraction → verification per job.
//! - A **verification engine**: per-hospital vector indices over the rate
//!   catalog, a hybrid matcher (embeddings + token overlap + containment),
//!   an optional LLM arbiter for borderline matches, and strict financial
//!   reconciliation of the result.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tieup_rs::catalog::CatalogHandle;
//! use tieup_rs::config::{MatchThresholds, QueueConfig};
//! use tieup_rs::embedding::{Embedder, StaticEmbedder};
//! use tieup_rs::service::BillService;
//! use tieup_rs::store::memory::MemoryStore;
//! use tieup_rs::verifier::BillVerifier;
//!
//! # fn main() -> tieup_rs::error::Result<()> {
//! let embedder: Arc<dyn Embedder> =
//!     Arc::new(StaticEmbedder::load("minishlab/potion-base-8M")?);
//! let catalog = Arc::new(CatalogHandle::load(
//!     std::path::Path::new("tieups"),
//!     Arc::clone(&embedder),
//! )?);
//! let verifier = Arc::new(BillVerifier::new(embedder, MatchThresholds::default(), None));
//! let service = BillService::new(
//!     Arc::new(MemoryStore::new()),
//!     catalog,
//!     verifier,
//!     QueueConfig::default(),
//! );
//! # let _ = service;
//! # Ok(())
//! # }
//! ```

pub mod arbiter;
pub mod artifact;
pub mod catalog;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod matcher;
pub mod normalize;
pub mod ocr;
pub mod pipeline;
pub mod pricing;
pub mod render;
pub mod retention;
pub mod service;
pub mod store;
pub mod types;
pub mod verifier;

pub use error::{Error, Result};
pub use types::{
    BillInput, ExtractedBill, FailureReason, ItemRow, ItemStatus, RateSheet, TieUpItem,
    UploadRecord, UploadStatus, VerificationResult, VerificationStatus,
};
