use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::RadarError;

/// Engine configuration. Every section has defaults, so an empty TOML file is valid.
/// Secrets (embedding API key) are better supplied through the environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub ingest: IngestConfig,
    pub embedding: EmbeddingConfig,
    pub clustering: ClusteringConfig,
    pub momentum: MomentumConfig,
    pub tiers: TierThresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    /// Fraction of rows that may be dropped before the batch is rejected.
    pub max_exclusion_rate: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_exclusion_rate: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// Local feature-hashing embedder. No network.
    Hashing,
    /// OpenAI-compatible `/embeddings` endpoint.
    OpenAi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    pub model: String,
    /// Vector width of the hashing backend. Remote models report their own.
    pub dimension: usize,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Texts per backend call; also the cancellation granularity.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Hashing,
            model: "hashing-v1".to_string(),
            dimension: 512,
            base_url: None,
            api_key: None,
            batch_size: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusteringConfig {
    /// Maximum cosine distance (1 - similarity) for a post to join a cluster.
    pub max_distance: f64,
    /// Rolling window within which members must chain.
    pub window_hours: i64,
    /// Clusters smaller than this are flagged low-confidence.
    pub min_cluster_size: usize,
    /// |old ∩ new| / |old| at or above which a re-run grouping keeps an old cluster id.
    pub containment_threshold: f64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            max_distance: 0.35,
            window_hours: 72,
            min_cluster_size: 3,
            containment_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MomentumConfig {
    pub bucket_hours: i64,
    /// Buckets averaged as the growth baseline.
    pub lookback_buckets: usize,
    pub half_life_hours: f64,
    pub growth_weight: f64,
    pub source_weight: f64,
    pub volume_weight: f64,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            bucket_hours: 6,
            lookback_buckets: 4,
            half_life_hours: 24.0,
            growth_weight: 3.0,
            source_weight: 2.0,
            volume_weight: 2.0,
        }
    }
}

/// Inclusive lower bounds of the three upper tiers. Everything below `emerging`
/// is ambient noise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TierThresholds {
    pub emerging: f64,
    pub coordinated: f64,
    pub viral: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            emerging: 8.0,
            coordinated: 15.0,
            viral: 30.0,
        }
    }
}

impl EngineConfig {
    /// Parse from TOML text and validate.
    pub fn from_toml_str(content: &str) -> Result<Self, RadarError> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| RadarError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RADAR_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), RadarError> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup, then re-validate.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), RadarError> {
        if let Some(v) = lookup("RADAR_MAX_EXCLUSION_RATE") {
            self.ingest.max_exclusion_rate = parse_var("RADAR_MAX_EXCLUSION_RATE", &v)?;
        }
        if let Some(v) = lookup("RADAR_EMBEDDING_BACKEND") {
            self.embedding.backend = match v.trim() {
                "hashing" => EmbeddingBackend::Hashing,
                "open_ai" | "openai" => EmbeddingBackend::OpenAi,
                other => {
                    return Err(RadarError::Config(format!(
                        "RADAR_EMBEDDING_BACKEND must be hashing or openai, got {other}"
                    )))
                }
            };
        }
        if let Some(v) = lookup("RADAR_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Some(v) = lookup("RADAR_EMBEDDING_BASE_URL") {
            self.embedding.base_url = Some(v);
        }
        if let Some(v) = lookup("RADAR_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(v);
        }
        if let Some(v) = lookup("RADAR_SIMILARITY_MAX_DISTANCE") {
            self.clustering.max_distance = parse_var("RADAR_SIMILARITY_MAX_DISTANCE", &v)?;
        }
        if let Some(v) = lookup("RADAR_WINDOW_HOURS") {
            self.clustering.window_hours = parse_var("RADAR_WINDOW_HOURS", &v)?;
        }
        if let Some(v) = lookup("RADAR_MIN_CLUSTER_SIZE") {
            self.clustering.min_cluster_size = parse_var("RADAR_MIN_CLUSTER_SIZE", &v)?;
        }
        if let Some(v) = lookup("RADAR_BUCKET_HOURS") {
            self.momentum.bucket_hours = parse_var("RADAR_BUCKET_HOURS", &v)?;
        }
        if let Some(v) = lookup("RADAR_TIER_EMERGING") {
            self.tiers.emerging = parse_var("RADAR_TIER_EMERGING", &v)?;
        }
        if let Some(v) = lookup("RADAR_TIER_COORDINATED") {
            self.tiers.coordinated = parse_var("RADAR_TIER_COORDINATED", &v)?;
        }
        if let Some(v) = lookup("RADAR_TIER_VIRAL") {
            self.tiers.viral = parse_var("RADAR_TIER_VIRAL", &v)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), RadarError> {
        let rate = self.ingest.max_exclusion_rate;
        if !(0.0..=1.0).contains(&rate) {
            return Err(RadarError::Config(format!(
                "ingest.max_exclusion_rate must be within [0, 1], got {rate}"
            )));
        }
        if self.embedding.batch_size == 0 {
            return Err(RadarError::Config("embedding.batch_size must be > 0".into()));
        }
        if self.embedding.dimension == 0 {
            return Err(RadarError::Config("embedding.dimension must be > 0".into()));
        }
        if self.embedding.model.trim().is_empty() {
            return Err(RadarError::Config("embedding.model must not be empty".into()));
        }
        let distance = self.clustering.max_distance;
        if !(0.0..=2.0).contains(&distance) {
            return Err(RadarError::Config(format!(
                "clustering.max_distance must be within [0, 2], got {distance}"
            )));
        }
        if self.clustering.window_hours < 2 {
            return Err(RadarError::Config(
                "clustering.window_hours must be at least 2".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.clustering.containment_threshold) {
            return Err(RadarError::Config(
                "clustering.containment_threshold must be within [0, 1]".into(),
            ));
        }
        let m = &self.momentum;
        if m.bucket_hours <= 0 {
            return Err(RadarError::Config("momentum.bucket_hours must be > 0".into()));
        }
        if m.lookback_buckets == 0 {
            return Err(RadarError::Config(
                "momentum.lookback_buckets must be > 0".into(),
            ));
        }
        if !(m.half_life_hours > 0.0) {
            return Err(RadarError::Config(
                "momentum.half_life_hours must be > 0".into(),
            ));
        }
        for (name, weight) in [
            ("growth_weight", m.growth_weight),
            ("source_weight", m.source_weight),
            ("volume_weight", m.volume_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(RadarError::Config(format!(
                    "momentum.{name} must be a non-negative number, got {weight}"
                )));
            }
        }
        let t = &self.tiers;
        if !(t.emerging >= 0.0 && t.emerging < t.coordinated && t.coordinated < t.viral)
            || !t.viral.is_finite()
        {
            return Err(RadarError::Config(format!(
                "tier thresholds must be non-negative and strictly ascending, got {} / {} / {}",
                t.emerging, t.coordinated, t.viral
            )));
        }
        Ok(())
    }

    /// Log the effective configuration with secrets masked.
    pub fn log_redacted(&self) {
        info!(
            backend = ?self.embedding.backend,
            model = self.embedding.model.as_str(),
            base_url = self.embedding.base_url.as_deref().unwrap_or("-"),
            api_key = if self.embedding.api_key.is_some() { "[set]" } else { "[unset]" },
            max_distance = self.clustering.max_distance,
            window_hours = self.clustering.window_hours,
            min_cluster_size = self.clustering.min_cluster_size,
            bucket_hours = self.momentum.bucket_hours,
            tiers = format!(
                "{}/{}/{}",
                self.tiers.emerging, self.tiers.coordinated, self.tiers.viral
            ),
            "Engine configuration"
        );
    }
}

/// Load and validate a TOML config file.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config = EngineConfig::from_toml_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, RadarError> {
    value
        .trim()
        .parse()
        .map_err(|_| RadarError::Config(format!("{key} has an invalid value: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.clustering.window_hours, 72);
        assert_eq!(config.momentum.bucket_hours, 6);
        assert_eq!(config.clustering.min_cluster_size, 3);
        assert_eq!(config.ingest.max_exclusion_rate, 0.5);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = EngineConfig::from_toml_str(
            "[tiers]\nviral = 50.0\n\n[embedding]\nbackend = \"open_ai\"\nmodel = \"text-embedding-3-small\"\n",
        )
        .unwrap();
        assert_eq!(config.tiers.viral, 50.0);
        assert_eq!(config.tiers.emerging, 8.0);
        assert_eq!(config.embedding.backend, EmbeddingBackend::OpenAi);
        assert_eq!(config.embedding.batch_size, 64);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = EngineConfig::from_toml_str("[clustering]\nwindow_days = 3\n").unwrap_err();
        assert!(matches!(err, RadarError::Config(_)));
    }

    #[test]
    fn non_ascending_tiers_are_rejected() {
        let err = EngineConfig::from_toml_str("[tiers]\nemerging = 20.0\ncoordinated = 15.0\n")
            .unwrap_err();
        assert!(err.to_string().contains("strictly ascending"));
    }

    #[test]
    fn negative_weight_is_rejected() {
        let mut config = EngineConfig::default();
        config.momentum.source_weight = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrides_apply_and_revalidate() {
        let vars: HashMap<&str, &str> = [
            ("RADAR_WINDOW_HOURS", "48"),
            ("RADAR_EMBEDDING_BACKEND", "openai"),
            ("RADAR_EMBEDDING_API_KEY", "sk-test"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.clustering.window_hours, 48);
        assert_eq!(config.embedding.backend, EmbeddingBackend::OpenAi);
        assert_eq!(config.embedding.api_key.as_deref(), Some("sk-test"));

        let err = config
            .apply_overrides(|k| (k == "RADAR_BUCKET_HOURS").then(|| "six".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("RADAR_BUCKET_HOURS"));
    }

    #[test]
    fn load_config_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[clustering]\nmax_distance = 0.2").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.clustering.max_distance, 0.2);
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/radar.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read config file"));
    }
}
