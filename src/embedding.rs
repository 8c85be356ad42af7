//! Embedding backend seam
//!
//! Catalog indices and query texts are embedded through the [`Embedder`]
//! trait. The production implementation wraps a `model2vec` static model:
//! local inference, no ONNX runtime. Vectors are L2-normalized on the way
//! out so cosine similarity reduces to a dot product everywhere else in the
//! crate.
//!
//! The on-disk cache is keyed by `sha256(model_id ‖ 0x00 ‖ text)` and is
//! owned by the catalog loader; repeated process restarts re-embed nothing.

use crate::error::{Error, Result};
use model2vec_rs::model::StaticModel;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Text-to-vector backend
pub trait Embedder: Send + Sync {
    /// Identifier of the underlying model; part of every cache key
    fn model_id(&self) -> &str;

    /// Embed a batch of texts. Returned vectors are L2-normalized and all
    /// share the model's dimension.
    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embed one text
    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text])?;
        vectors
            .pop()
            .ok_or_else(|| Error::Embedding("backend returned no vector".to_string()))
    }
}

/// Dot product of two equal-length vectors.
/// With L2-normalized inputs this is the cosine similarity.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Scale a vector to unit L2 norm. Zero vectors are returned unchanged.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// `model2vec` static-model embedder
pub struct StaticEmbedder {
    model: StaticModel,
    model_id: String,
}

impl StaticEmbedder {
    /// Load a static model from a HuggingFace repo id or a local path.
    pub fn load(model_id: &str) -> Result<Self> {
        let model = StaticModel::from_pretrained(model_id, None, None, None)
            .map_err(|e| Error::Embedding(format!("cannot load model {}: {}", model_id, e)))?;
        Ok(Self {
            model,
            model_id: model_id.to_string(),
        })
    }
}

impl Embedder for StaticEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| l2_normalize(self.model.encode_single(text)))
            .collect())
    }
}

/// File-per-key embedding cache.
///
/// Writes go through a temp file and an atomic rename; concurrent first
/// populations of the same key race benignly to identical content. The
/// mutex serializes writers within the process.
pub struct DiskCache {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl DiskCache {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn key(model_id: &str, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    pub fn get(&self, model_id: &str, text: &str) -> Option<Vec<f32>> {
        let path = self.path_for(&Self::key(model_id, text));
        let bytes = std::fs::read(&path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn put(&self, model_id: &str, text: &str, vector: &[f32]) -> Result<()> {
        let key = Self::key(model_id, text);
        let path = self.path_for(&key);
        let tmp = self.dir.join(format!("{}.tmp", key));

        let _guard = self.write_lock.lock().map_err(|_| {
            Error::Embedding("embedding cache writer lock poisoned".to_string())
        })?;
        std::fs::write(&tmp, serde_json::to_vec(vector)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// An [`Embedder`] that consults a [`DiskCache`] before the inner backend
pub struct CachedEmbedder<E> {
    inner: E,
    cache: Option<DiskCache>,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E, cache_dir: Option<&Path>) -> Result<Self> {
        let cache = match cache_dir {
            Some(dir) => Some(DiskCache::open(dir)?),
            None => None,
        };
        Ok(Self { inner, cache })
    }
}

impl<E: Embedder> Embedder for CachedEmbedder<E> {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let Some(cache) = &self.cache else {
            return self.inner.embed(texts);
        };

        let mut out: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut misses: Vec<usize> = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            match cache.get(self.inner.model_id(), text) {
                Some(v) => out.push(Some(v)),
                None => {
                    out.push(None);
                    misses.push(i);
                }
            }
        }

        if !misses.is_empty() {
            debug!(misses = misses.len(), total = texts.len(), "embedding cache misses");
            let miss_texts: Vec<&str> = misses.iter().map(|&i| texts[i]).collect();
            let fresh = self.inner.embed(&miss_texts)?;
            for (&i, vector) in misses.iter().zip(fresh.into_iter()) {
                cache.put(self.inner.model_id(), texts[i], &vector)?;
                out[i] = Some(vector);
            }
        }

        Ok(out.into_iter().flatten().collect())
    }
}
