//! Flat per-cluster schema shared by live results and precomputed report files.
//!
//! A live `(TrendEntry, MomentumState, Report, Tier)` maps onto one [`ClusterRecord`]
//! and a record maps back onto `(TrendEntry, Report, Tier)`, so downstream consumers
//! cannot tell the two sources apart.

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use schemars::schema::RootSchema;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

use radar_common::{ClusterId, MomentumState, RadarError, Report, Tier, TrendEntry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterRecord {
    #[serde(rename = "Cluster ID")]
    pub cluster_id: ClusterId,
    #[serde(rename = "First Detected", with = "flexible_time")]
    #[schemars(with = "DateTime<Utc>")]
    pub first_detected: DateTime<Utc>,
    #[serde(rename = "Last Updated", with = "flexible_time")]
    #[schemars(with = "DateTime<Utc>")]
    pub last_updated: DateTime<Utc>,
    #[serde(rename = "Momentum Score")]
    pub momentum_score: f64,
    #[serde(rename = "Total Posts")]
    pub total_posts: u64,
    /// Posts in the busiest bucket.
    #[serde(rename = "Peak Activity")]
    pub peak_activity: u32,
    #[serde(rename = "Unique Sources")]
    pub unique_sources: usize,
    #[serde(rename = "Report Summary")]
    pub report_summary: String,
    /// Newline-separated.
    #[serde(rename = "All URLs")]
    pub all_urls: String,
    /// Full tier label.
    #[serde(rename = "Thread Categorization")]
    pub thread_categorization: String,
}

impl ClusterRecord {
    pub fn from_live(
        cluster_id: ClusterId,
        state: &MomentumState,
        report: &Report,
        tier: Tier,
    ) -> Self {
        Self {
            cluster_id,
            first_detected: state.first_detected,
            last_updated: state.last_update,
            momentum_score: state.current_score,
            total_posts: state.total_posts(),
            peak_activity: state.peak_bucket().map(|(_, count)| count).unwrap_or(0),
            unique_sources: state.unique_sources(),
            report_summary: report.narrative_text.clone(),
            all_urls: report.sample_urls.join("\n"),
            thread_categorization: tier.label().to_string(),
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.all_urls
            .lines()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn trend(&self) -> TrendEntry {
        TrendEntry {
            cluster_id: self.cluster_id,
            score: self.momentum_score,
        }
    }

    /// The flat schema carries no sample texts.
    pub fn report(&self) -> Report {
        Report {
            cluster_id: self.cluster_id,
            narrative_text: self.report_summary.clone(),
            sample_texts: Vec::new(),
            sample_urls: self.urls(),
        }
    }

    pub fn tier(&self) -> Result<Tier, RadarError> {
        self.thread_categorization.parse()
    }

    pub fn into_parts(self) -> Result<(TrendEntry, Report, Tier), RadarError> {
        let tier = self.tier()?;
        Ok((self.trend(), self.report(), tier))
    }
}

/// UTF-8, header row, one row per record.
pub fn write_csv<W: Write>(writer: W, records: &[ClusterRecord]) -> Result<(), RadarError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for record in records {
        csv_writer
            .serialize(record)
            .map_err(|e| RadarError::Export(e.to_string()))?;
    }
    csv_writer
        .flush()
        .map_err(|e| RadarError::Export(e.to_string()))
}

pub fn read_csv<R: Read>(reader: R) -> Result<Vec<ClusterRecord>, RadarError> {
    csv::Reader::from_reader(reader)
        .deserialize()
        .map(|row| row.map_err(|e| RadarError::Export(e.to_string())))
        .collect()
}

/// JSON schema of [`ClusterRecord`] for downstream consumers.
pub fn record_schema() -> RootSchema {
    schema_for!(ClusterRecord)
}

/// Writes RFC 3339; reads anything the ingestion normalizer accepts, so hand-made
/// report files with local layouts still load.
mod flexible_time {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::normalizer::parse_timestamp;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unparseable timestamp {raw:?}")))
    }
}
