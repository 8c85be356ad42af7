//! Shared fixtures for integration tests
//!
//! The table embedder prescribes a unit vector per normalized text, so
//! semantic similarities in scenarios are exact by construction. Unknown
//! texts embed to a reserved axis that no catalog entry uses.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tieup_rs::arbiter::{Arbiter, ChatBackend, GenerateOptions};
use tieup_rs::catalog::CatalogHandle;
use tieup_rs::config::{ArbiterConfig, MatchThresholds};
use tieup_rs::embedding::Embedder;
use tieup_rs::error::Result;
use tieup_rs::verifier::BillVerifier;

pub const DIMS: usize = 12;

/// Axis assignments for the fixture catalog
pub const AX_HOSPITAL: usize = 0; // "apollo hospital"
pub const AX_CONSULTATION: usize = 1; // category and item "consultation"
pub const AX_RADIOLOGY: usize = 2; // category "radiology"
pub const AX_MRI: usize = 3; // item "mri brain"
pub const AX_GENERAL: usize = 4; // item "general procedure"
pub const AX_KNEE: usize = 5; // item "knee replacement package"
pub const AX_PACKAGES: usize = 6; // category "packages"
pub const AX_FREE: usize = 7; // off-catalog component for queries
pub const AX_CT: usize = 8; // item "ct head"
pub const AX_XRAY: usize = 9; // item "x ray chest"

pub fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    v[i] = 1.0;
    v
}

/// A query vector with cosine `cos` against `target`, remainder on the
/// free axis.
pub fn at_cosine(target: usize, cos: f32) -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    v[target] = cos;
    v[AX_FREE] = (1.0 - cos * cos).sqrt();
    v
}

pub struct TableEmbedder {
    table: HashMap<String, Vec<f32>>,
}

impl TableEmbedder {
    pub fn with_catalog_axes() -> Self {
        let mut table = HashMap::new();
        table.insert("apollo hospital".to_string(), axis(AX_HOSPITAL));
        table.insert("consultation".to_string(), axis(AX_CONSULTATION));
        table.insert("radiology".to_string(), axis(AX_RADIOLOGY));
        table.insert("mri brain".to_string(), axis(AX_MRI));
        table.insert("general procedure".to_string(), axis(AX_GENERAL));
        table.insert("knee replacement package".to_string(), axis(AX_KNEE));
        table.insert("packages".to_string(), axis(AX_PACKAGES));
        table.insert("ct head".to_string(), axis(AX_CT));
        table.insert("x ray chest".to_string(), axis(AX_XRAY));
        Self { table }
    }

    pub fn set(&mut self, normalized_text: &str, vector: Vec<f32>) -> &mut Self {
        self.table.insert(normalized_text.to_string(), vector);
        self
    }
}

impl Embedder for TableEmbedder {
    fn model_id(&self) -> &str {
        "table-test"
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| self.table.get(*t).cloned().unwrap_or_else(|| axis(AX_FREE)))
            .collect())
    }
}

pub const APOLLO_SHEET: &str = r#"{
    "hospital_name": "Apollo Hospital",
    "categories": [
        {"category_name": "Consultation",
         "items": [{"item_name": "Consultation", "rate": 1500, "type": "service"}]},
        {"category_name": "Radiology",
         "items": [{"item_name": "MRI Brain", "rate": 8500, "type": "service"},
                   {"item_name": "CT Head", "rate": 4000, "type": "service"},
                   {"item_name": "X-Ray Chest", "rate": 500, "type": "unit"}]},
        {"category_name": "Packages",
         "items": [{"item_name": "General Procedure", "rate": 2000, "type": "service"},
                   {"item_name": "Knee Replacement Package", "rate": 150000, "type": "bundle"}]}
    ]
}"#;

pub fn write_catalog(dir: &Path) {
    std::fs::write(dir.join("apollo-hospital.json"), APOLLO_SHEET).unwrap();
}

pub fn catalog_handle(dir: &Path, embedder: Arc<dyn Embedder>) -> Arc<CatalogHandle> {
    write_catalog(dir);
    Arc::new(CatalogHandle::load(dir, embedder).unwrap())
}

/// Chat backend that always answers with the given verdict JSON.
pub struct FixedBackend {
    pub response: String,
}

#[async_trait]
impl ChatBackend for FixedBackend {
    async fn generate(&self, _model: &str, _prompt: &str, _opts: &GenerateOptions) -> Result<String> {
        Ok(self.response.clone())
    }
}

pub fn arbiter_matching(is_match: bool) -> Arbiter {
    let response = format!(
        r#"{{"match": {}, "confidence": 0.9, "normalized_name": "x"}}"#,
        is_match
    );
    Arbiter::new(Box::new(FixedBackend { response }), ArbiterConfig::default())
}

pub fn verifier_with(embedder: Arc<dyn Embedder>, arbiter: Option<Arbiter>) -> BillVerifier {
    BillVerifier::new(embedder, MatchThresholds::default(), arbiter)
}
