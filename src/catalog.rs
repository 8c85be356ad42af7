//! Rate catalog loading and vector indices
//!
//! One tie-up JSON file per hospital, named by the slug of the hospital
//! name. Loading builds three index layers — hospital names, per-hospital
//! category names, per-category item names — by embedding each normalized
//! text once. Indices are flat: entries are scanned with a dot product,
//! which is exact cosine ranking because vectors are L2-normalized.
//!
//! `reload` builds a complete new catalog before swapping the shared
//! pointer, so readers always see either the old or the new catalog in
//! full.

use crate::embedding::{dot, Embedder};
use crate::error::{Error, Result};
use crate::normalize::{lookup_key, normalize_item};
use crate::types::{HospitalSummary, RateSheet};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// One embedded entry of a flat index.
///
/// `vectors` holds the normalized-text embedding and, when the medical core
/// differs, the core embedding as a second variant.
#[derive(Debug, Clone)]
pub struct IndexedEntry {
    pub id: usize,
    pub name: String,
    pub normalized: String,
    pub vectors: Vec<Vec<f32>>,
}

/// A named flat vector index with exact top-K search
#[derive(Debug, Clone)]
pub struct VectorIndex {
    pub name: String,
    pub entries: Vec<IndexedEntry>,
}

impl VectorIndex {
    /// Rank entries by the best dot product over all (query, entry)
    /// vector-variant pairs; return up to `k` results, best first.
    pub fn search(&self, query_vectors: &[Vec<f32>], k: usize) -> Vec<(usize, f64)> {
        let mut scored: Vec<(usize, f64)> = self
            .entries
            .iter()
            .map(|entry| {
                let best = query_vectors
                    .iter()
                    .flat_map(|q| entry.vectors.iter().map(move |v| dot(q, v)))
                    .fold(f32::MIN, f32::max);
                (entry.id, f64::from(best))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All indices for one hospital
#[derive(Debug, Clone)]
pub struct HospitalIndices {
    pub sheet: RateSheet,

    /// Category names, ids parallel to `sheet.categories`
    pub category_index: VectorIndex,

    /// Per-category item indices, ids parallel to each category's items
    pub item_indices: Vec<VectorIndex>,

    /// Union of every item across categories, for low-confidence
    /// category matches
    pub union_index: VectorIndex,

    /// Union id → (category id, item id)
    pub union_map: Vec<(usize, usize)>,
}

/// A fully-built catalog snapshot. Immutable after construction.
pub struct Catalog {
    pub hospitals: Vec<HospitalIndices>,
    pub hospital_index: VectorIndex,
    by_key: HashMap<String, usize>,
}

impl Catalog {
    /// Exact lookup by case-insensitive, whitespace-collapsed equality.
    pub fn hospital_named(&self, hospital_name: &str) -> Result<&HospitalIndices> {
        self.by_key
            .get(&lookup_key(hospital_name))
            .map(|&i| &self.hospitals[i])
            .ok_or_else(|| Error::HospitalNotFound(hospital_name.to_string()))
    }

    pub fn hospital_by_id(&self, id: usize) -> Option<&HospitalIndices> {
        self.hospitals.get(id)
    }

    pub fn summaries(&self) -> Vec<HospitalSummary> {
        self.hospitals
            .iter()
            .map(|h| HospitalSummary {
                hospital_name: h.sheet.hospital_name.clone(),
                category_count: h.sheet.categories.len(),
                item_count: h.sheet.categories.iter().map(|c| c.items.len()).sum(),
            })
            .collect()
    }
}

/// Shared catalog handle with atomic reload
pub struct CatalogHandle {
    dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    current: RwLock<Arc<Catalog>>,
}

impl CatalogHandle {
    /// Load every rate sheet under `dir` and build the initial snapshot.
    pub fn load(dir: &Path, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let catalog = load_catalog(dir, embedder.as_ref())?;
        Ok(Self {
            dir: dir.to_path_buf(),
            embedder,
            current: RwLock::new(Arc::new(catalog)),
        })
    }

    /// Current snapshot. Holders keep a consistent catalog across reloads.
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_else(|poisoned| Arc::clone(&poisoned.into_inner()))
    }

    /// Rebuild from disk, then swap. Readers see old or new, never partial.
    pub fn reload(&self) -> Result<()> {
        let fresh = load_catalog(&self.dir, self.embedder.as_ref())?;
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(fresh);
        Ok(())
    }

    pub fn list_hospitals(&self) -> Vec<HospitalSummary> {
        self.snapshot().summaries()
    }
}

/// Filesystem slug of a hospital name, used for tie-up file naming.
pub fn slug(hospital_name: &str) -> String {
    let mut out = String::with_capacity(hospital_name.len());
    let mut last_dash = true;
    for c in hospital_name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

/// Load and index every `*.json` rate sheet under `dir`.
pub fn load_catalog(dir: &Path, embedder: &dyn Embedder) -> Result<Catalog> {
    let mut sheets: Vec<(PathBuf, RateSheet)> = Vec::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::CatalogLoad(format!("cannot read {}: {}", dir.display(), e)))?;
    for entry in entries {
        let path = entry
            .map_err(|e| Error::CatalogLoad(e.to_string()))?
            .path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = std::fs::read(&path)
            .map_err(|e| Error::CatalogLoad(format!("cannot read {}: {}", path.display(), e)))?;
        let sheet: RateSheet = serde_json::from_slice(&bytes)
            .map_err(|e| Error::CatalogLoad(format!("{}: {}", path.display(), e)))?;
        validate_sheet(&path, &sheet)?;
        sheets.push((path, sheet));
    }
    // Deterministic hospital ids across identical directories.
    sheets.sort_by(|a, b| a.0.cmp(&b.0));

    let mut by_key: HashMap<String, usize> = HashMap::new();
    for (i, (path, sheet)) in sheets.iter().enumerate() {
        let key = lookup_key(&sheet.hospital_name);
        if let Some(prev) = by_key.insert(key, i) {
            return Err(Error::CatalogLoad(format!(
                "hospitals {:?} and {} share the normalized name {:?}",
                sheets[prev].1.hospital_name,
                path.display(),
                lookup_key(&sheet.hospital_name),
            )));
        }
    }

    // Embed every distinct normalized text once, across all sheets.
    let mut vector_of = EmbeddingBatch::default();
    for (_, sheet) in &sheets {
        vector_of.request(&sheet.hospital_name);
        for cat in &sheet.categories {
            vector_of.request(&cat.category_name);
            for item in &cat.items {
                vector_of.request(&item.item_name);
            }
        }
    }
    vector_of.run(embedder)?;

    let mut hospitals = Vec::with_capacity(sheets.len());
    let mut hospital_entries = Vec::with_capacity(sheets.len());
    for (id, (_, sheet)) in sheets.into_iter().enumerate() {
        hospital_entries.push(vector_of.entry(id, &sheet.hospital_name));

        let category_index = VectorIndex {
            name: format!("{}/categories", sheet.hospital_name),
            entries: sheet
                .categories
                .iter()
                .enumerate()
                .map(|(cid, cat)| vector_of.entry(cid, &cat.category_name))
                .collect(),
        };

        let mut item_indices = Vec::with_capacity(sheet.categories.len());
        let mut union_entries = Vec::new();
        let mut union_map = Vec::new();
        for (cid, cat) in sheet.categories.iter().enumerate() {
            let entries: Vec<IndexedEntry> = cat
                .items
                .iter()
                .enumerate()
                .map(|(iid, item)| vector_of.entry(iid, &item.item_name))
                .collect();
            for (iid, entry) in entries.iter().enumerate() {
                let mut union_entry = entry.clone();
                union_entry.id = union_map.len();
                union_map.push((cid, iid));
                union_entries.push(union_entry);
            }
            item_indices.push(VectorIndex {
                name: format!("{}/{}", sheet.hospital_name, cat.category_name),
                entries,
            });
        }

        hospitals.push(HospitalIndices {
            category_index,
            item_indices,
            union_index: VectorIndex {
                name: format!("{}/all-items", sheet.hospital_name),
                entries: union_entries,
            },
            union_map,
            sheet,
        });
    }

    info!(
        hospitals = hospitals.len(),
        "rate catalog loaded from {}",
        dir.display()
    );
    Ok(Catalog {
        hospital_index: VectorIndex {
            name: "hospitals".to_string(),
            entries: hospital_entries,
        },
        hospitals,
        by_key,
    })
}

fn validate_sheet(path: &Path, sheet: &RateSheet) -> Result<()> {
    if sheet.hospital_name.trim().is_empty() {
        return Err(Error::CatalogLoad(format!(
            "{}: empty hospital_name",
            path.display()
        )));
    }
    for cat in &sheet.categories {
        for item in &cat.items {
            if item.rate < 0.0 {
                return Err(Error::CatalogLoad(format!(
                    "{}: negative rate for {:?} in {:?}",
                    path.display(),
                    item.item_name,
                    cat.category_name
                )));
            }
        }
    }
    let expected = format!("{}.json", slug(&sheet.hospital_name));
    if path.file_name().and_then(|n| n.to_str()) != Some(expected.as_str()) {
        warn!(
            "rate sheet {} is not named after its hospital slug ({})",
            path.display(),
            expected
        );
    }
    Ok(())
}

/// Collects distinct texts, embeds them in one backend call, then hands out
/// [`IndexedEntry`] values.
#[derive(Default)]
struct EmbeddingBatch {
    texts: Vec<String>,
    positions: HashMap<String, usize>,
    vectors: Vec<Vec<f32>>,
}

impl EmbeddingBatch {
    fn request(&mut self, raw: &str) {
        let n = normalize_item(raw);
        for text in std::iter::once(n.normalized).chain(n.medical_core) {
            if !self.positions.contains_key(&text) {
                self.positions.insert(text.clone(), self.texts.len());
                self.texts.push(text);
            }
        }
    }

    fn run(&mut self, embedder: &dyn Embedder) -> Result<()> {
        let refs: Vec<&str> = self.texts.iter().map(String::as_str).collect();
        self.vectors = embedder.embed(&refs)?;
        Ok(())
    }

    fn entry(&self, id: usize, raw: &str) -> IndexedEntry {
        let n = normalize_item(raw);
        let mut vectors = Vec::with_capacity(2);
        if let Some(&pos) = self.positions.get(&n.normalized) {
            vectors.push(self.vectors[pos].clone());
        }
        if let Some(core) = &n.medical_core {
            if let Some(&pos) = self.positions.get(core) {
                vectors.push(self.vectors[pos].clone());
            }
        }
        IndexedEntry {
            id,
            name: raw.to_string(),
            normalized: n.normalized,
            vectors,
        }
    }
}
