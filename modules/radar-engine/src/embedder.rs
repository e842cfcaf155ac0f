use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use radar_common::{EmbeddingBackend, EmbeddingConfig, RadarError, TextEmbedder};

/// Tokens too common to say anything about a narrative (English and French,
/// plus URL fragments).
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "with", "this", "that", "from", "have", "has",
    "of", "to", "in", "on", "is", "it", "at", "by", "an", "be", "as", "or", "les", "des",
    "est", "une", "pour", "dans", "qui", "que", "sur", "pas", "par", "aux", "avec", "de", "la",
    "le", "et", "en", "du", "un", "au", "ce", "se", "http", "https", "www", "com", "co",
];

/// Local feature-hashing embedder: unigrams and bigrams hashed into signed buckets,
/// L2-normalised. Deterministic, needs no model files and no network.
pub struct HashingEmbedder {
    model_version: String,
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(model: &str, dimension: usize) -> Self {
        Self {
            model_version: format!("{model}-{dimension}"),
            dimension: dimension.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let tokens = tokenize(text);
        let mut vector = vec![0.0f32; self.dimension];
        for token in &tokens {
            self.add_feature(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut index_bytes = [0u8; 8];
        index_bytes.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(index_bytes) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

#[async_trait]
impl TextEmbedder for HashingEmbedder {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Lowercased alphanumeric tokens, stopwords and single characters removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2 && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

// --- Remote backend ---

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

/// OpenAI-compatible `/embeddings` backend (OpenAI, Voyage, local gateways).
pub struct OpenAiEmbedder {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiEmbedder {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl TextEmbedder for OpenAiEmbedder {
    fn model_version(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let mut builder = self.http.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Embedding error ({}): {}", status, error_text));
        }

        let mut body: EmbeddingResponse = response.json().await?;
        if body.data.iter().all(|d| d.index.is_some()) {
            body.data.sort_by_key(|d| d.index);
        }
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Build the configured backend.
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn TextEmbedder>, RadarError> {
    match config.backend {
        EmbeddingBackend::Hashing => Ok(Arc::new(HashingEmbedder::new(
            &config.model,
            config.dimension,
        ))),
        EmbeddingBackend::OpenAi => {
            let base_url = config.base_url.as_deref().ok_or_else(|| {
                RadarError::Config("embedding.base_url is required for the open_ai backend".into())
            })?;
            let embedder = OpenAiEmbedder::new(base_url, &config.model, config.api_key.clone())
                .map_err(|e| RadarError::EmbeddingUnavailable(e.to_string()))?;
            Ok(Arc::new(embedder))
        }
    }
}
