pub mod config;
pub mod embedder;
pub mod error;
pub mod types;

pub use config::{
    load_config, ClusteringConfig, EmbeddingBackend, EmbeddingConfig, EngineConfig, IngestConfig,
    MomentumConfig, TierThresholds,
};
pub use embedder::TextEmbedder;
pub use error::RadarError;
pub use types::*;
