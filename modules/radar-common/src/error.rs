use thiserror::Error;

use crate::types::ClusterId;

#[derive(Error, Debug)]
pub enum RadarError {
    #[error("Schema error: missing required column(s) {}", .missing.join(", "))]
    Schema { missing: Vec<String> },

    #[error(
        "Data quality error: {} of {} rows unusable (limit {:.0}%)",
        .dropped,
        .total,
        .max_rate * 100.0
    )]
    DataQuality {
        dropped: usize,
        total: usize,
        max_rate: f64,
    },

    #[error("Embedding backend unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Invalid momentum score: {0}")]
    InvalidScore(f64),

    #[error("Invalid tier: {0}")]
    InvalidTier(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown cluster: {0}")]
    UnknownCluster(ClusterId),

    #[error("Analysis cancelled")]
    Cancelled,

    #[error("Export error: {0}")]
    Export(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl RadarError {
    /// Whether the caller may retry the same run unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RadarError::EmbeddingUnavailable(_) | RadarError::Cancelled)
    }
}
