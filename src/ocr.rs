//! OCR collaborator contract
//!
//! The pipeline only depends on this interface: page-ordered text with
//! per-line bounding hints. Implementations may drop pages on failure and
//! must return an empty `text` for dropped pages rather than erroring;
//! only an all-pages failure is an error, raised by the caller.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Bounding box of one recognized line, in page pixel coordinates
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One recognized line of text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrLine {
    pub text: String,
    pub bbox: BoundingBox,
}

/// Recognized content of one page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageText {
    /// 1-based page number
    pub page: u32,

    /// Full page text; empty when the page failed recognition
    pub text: String,

    /// Line-level breakdown with bounding hints; may be empty even when
    /// `text` is not
    #[serde(default)]
    pub lines: Vec<OcrLine>,
}

impl PageText {
    /// Line texts, falling back to splitting `text` when the extractor
    /// provided no line breakdown.
    pub fn line_texts(&self) -> Vec<&str> {
        if self.lines.is_empty() {
            self.text.lines().collect()
        } else {
            self.lines.iter().map(|l| l.text.as_str()).collect()
        }
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty() && self.lines.is_empty()
    }
}

/// PDF text extraction backend
#[async_trait]
pub trait PdfTextExtractor: Send + Sync {
    /// Extract every page in order. Per-page failures yield blank pages.
    async fn extract_text(&self, pdf_path: &Path) -> Result<Vec<PageText>>;
}
