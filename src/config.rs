//! Configuration types for the verification pipeline
//!
//! All thresholds from the matching design are configuration defaults, not
//! hard-coded values. Components take the sub-config they need; nothing here
//! reads the environment or files on its own.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Score weights and decision thresholds for item/category/hospital matching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchThresholds {
    /// Weight of embedding cosine similarity in the hybrid score
    pub weight_semantic: f64,

    /// Weight of token-set Jaccard overlap in the hybrid score
    pub weight_token: f64,

    /// Weight of candidate-token containment in the hybrid score
    pub weight_containment: f64,

    /// Minimum top-1 similarity for the asserted hospital name.
    /// Below this every item is unclassified with `HOSPITAL_NOT_MATCHED`.
    pub hospital_threshold: f64,

    /// Category similarity at or above which the matched category's
    /// item index is used without caveats
    pub category_strong: f64,

    /// Category similarity at or above which the matched category is used
    /// with a soft-threshold warning; below it item matching searches the
    /// hospital-wide union index
    pub category_soft: f64,

    /// Semantic similarity at or above which an item match is accepted
    /// outright, with no LLM consultation
    pub semantic_autoaccept: f64,

    /// Minimum hybrid score for the lexical acceptance rule
    pub hybrid_accept: f64,

    /// Token overlap required alongside `hybrid_accept`
    pub token_overlap_accept: f64,

    /// Containment required alongside `hybrid_accept` (alternative to
    /// `token_overlap_accept`)
    pub containment_accept: f64,

    /// Lower bound (inclusive) of the semantic band that consults the LLM
    pub llm_band_low: f64,

    /// Upper bound (exclusive) of the semantic band that consults the LLM
    pub llm_band_high: f64,

    /// Best semantic similarity below which a rejected item is
    /// `NOT_IN_TIEUP` rather than `LOW_SIMILARITY`
    pub not_in_tieup_below: f64,

    /// Number of candidates returned per query
    pub top_k: usize,

    /// Absolute tolerance for financial reconciliation, in rupees
    pub reconcile_tolerance: f64,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            weight_semantic: 0.6,
            weight_token: 0.3,
            weight_containment: 0.1,
            hospital_threshold: 0.50,
            category_strong: 0.70,
            category_soft: 0.50,
            semantic_autoaccept: 0.85,
            hybrid_accept: 0.60,
            token_overlap_accept: 0.50,
            containment_accept: 0.70,
            llm_band_low: 0.70,
            llm_band_high: 0.85,
            not_in_tieup_below: 0.50,
            top_k: 3,
            reconcile_tolerance: 0.01,
        }
    }
}

/// Configuration for the LLM arbiter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// Base URL of the local chat endpoint
    pub endpoint: String,

    /// Primary model identifier
    pub primary_model: String,

    /// Secondary model tried exactly once when the primary response is
    /// malformed or below `min_confidence`
    pub secondary_model: String,

    /// Minimum confidence for a verdict to be taken as-is
    pub min_confidence: f64,

    /// Per-call timeout in seconds. The arbiter never blocks verification
    /// for longer than twice this value.
    pub timeout_secs: u64,

    /// Sampling temperature passed to the chat backend
    pub temperature: f64,

    /// Maximum tokens requested per completion
    pub max_tokens: u32,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434".to_string(),
            primary_model: "llama3.1:8b".to_string(),
            secondary_model: "qwen2.5:7b".to_string(),
            min_confidence: 0.7,
            timeout_secs: 20,
            temperature: 0.1,
            max_tokens: 256,
        }
    }
}

/// Configuration for the catalog loader and embedding cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Directory holding one rate-sheet JSON file per hospital
    pub catalog_dir: PathBuf,

    /// Directory for the on-disk embedding cache. `None` disables caching.
    pub embedding_cache_dir: Option<PathBuf>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            catalog_dir: PathBuf::from("tieups"),
            embedding_cache_dir: Some(PathBuf::from(".embedding-cache")),
        }
    }
}

/// Queue and worker timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a claimed job may run before its lease expires and the
    /// reconcile sweep returns it to the queue
    pub lease_ttl_secs: u64,

    /// Interval between reconcile sweeps; also the idle-sleep timeout of
    /// the worker loop
    pub reconcile_interval_secs: u64,

    /// PROCESSING records older than this with no lease refresh are
    /// demoted to FAILED(stale)
    pub stale_processing_secs: u64,

    /// Root directory for per-upload staging subdirectories
    pub staging_dir: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 600,
            reconcile_interval_secs: 30,
            stale_processing_secs: 3600,
            staging_dir: PathBuf::from("uploads"),
        }
    }
}

/// Retention policy for soft-deleted records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Days a soft-deleted record is kept before the retention worker
    /// hard-deletes it
    pub retention_days: i64,

    /// Interval between retention sweeps
    pub cleanup_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            cleanup_interval_secs: 3600,
        }
    }
}

/// Top-level configuration for the processing backbone
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub thresholds: MatchThresholds,
    pub arbiter: ArbiterConfig,
    pub catalog: CatalogConfig,
    pub queue: QueueConfig,
    pub retention: RetentionConfig,
}
