use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use radar_common::{Post, RadarError, TextEmbedder};

use crate::cancel::CancelFlag;

/// Shared, immutable embedding vector.
pub type Embedding = Arc<[f32]>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbeddingStats {
    pub hits: usize,
    pub computed: usize,
}

/// One vector per input post, same order.
#[derive(Debug, Clone)]
pub struct EmbeddedBatch {
    pub vectors: Vec<Embedding>,
    pub stats: EmbeddingStats,
}

/// Get-or-compute embedding cache held in memory for the lifetime of the analyzer.
///
/// Keyed by SHA-256 of (model_version + text), so overlapping re-runs reuse work and
/// a model change never serves vectors from another model.
pub struct EmbeddingStore {
    embedder: Arc<dyn TextEmbedder>,
    batch_size: usize,
    cache: RwLock<HashMap<String, Embedding>>,
}

impl EmbeddingStore {
    pub fn new(embedder: Arc<dyn TextEmbedder>, batch_size: usize) -> Self {
        Self {
            embedder,
            batch_size: batch_size.max(1),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn model_version(&self) -> &str {
        self.embedder.model_version()
    }

    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Embed every post's text with the store's single model.
    ///
    /// Cache misses go to the backend in chunks of `batch_size`; cancellation is checked
    /// before each chunk. Chunks that completed stay cached, but a failing chunk fails the
    /// whole call: no partially embedded batch is ever returned.
    pub async fn embed_posts(
        &self,
        posts: &[Post],
        cancel: &CancelFlag,
    ) -> Result<EmbeddedBatch, RadarError> {
        let keys: Vec<String> = posts.iter().map(|p| self.hash_key(&p.text)).collect();

        let mut missing: Vec<(String, String)> = Vec::new(); // (hash, text)
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            let mut queued: std::collections::HashSet<&str> = std::collections::HashSet::new();
            for (key, post) in keys.iter().zip(posts) {
                if !cache.contains_key(key) && queued.insert(key.as_str()) {
                    missing.push((key.clone(), post.text.clone()));
                }
            }
        }

        let computed = missing.len();
        for chunk in missing.chunks(self.batch_size) {
            cancel.check()?;
            let texts: Vec<String> = chunk.iter().map(|(_, text)| text.clone()).collect();
            let vectors = self
                .embedder
                .embed_batch(&texts)
                .await
                .map_err(|e| RadarError::EmbeddingUnavailable(format!("{e:#}")))?;

            if vectors.len() != texts.len() {
                return Err(RadarError::EmbeddingUnavailable(format!(
                    "backend returned {} vectors for {} texts",
                    vectors.len(),
                    texts.len()
                )));
            }
            let width = vectors.first().map(Vec::len).unwrap_or(0);
            if width == 0 || vectors.iter().any(|v| v.len() != width) {
                return Err(RadarError::EmbeddingUnavailable(
                    "backend returned empty or ragged vectors".into(),
                ));
            }

            let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
            for ((key, _), vector) in chunk.iter().zip(vectors) {
                cache.insert(key.clone(), Arc::from(vector));
            }
            debug!(chunk = chunk.len(), "Embedded chunk");
        }

        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        let mut vectors = Vec::with_capacity(keys.len());
        for key in &keys {
            let vector = cache.get(key).cloned().ok_or_else(|| {
                RadarError::EmbeddingUnavailable("embedding missing after backend call".into())
            })?;
            vectors.push(vector);
        }
        if let Some(first) = vectors.first() {
            let width = first.len();
            if vectors.iter().any(|v| v.len() != width) {
                return Err(RadarError::EmbeddingUnavailable(
                    "cached vectors have inconsistent dimensions".into(),
                ));
            }
        }

        let stats = EmbeddingStats {
            hits: posts.len() - computed.min(posts.len()),
            computed,
        };
        info!(
            posts = posts.len(),
            computed = stats.computed,
            model = self.model_version(),
            "Embedded posts"
        );
        Ok(EmbeddedBatch { vectors, stats })
    }

    fn hash_key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.embedder.model_version().as_bytes());
        hasher.update([0x1f]);
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }
}
