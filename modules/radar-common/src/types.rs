use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RadarError;

/// Column names the upload/fetch layer must provide. Case-sensitive.
pub const REQUIRED_COLUMNS: [&str; 4] = ["text", "Timestamp", "URL", "Source"];

// --- Raw input ---

/// Tabular record set as handed over by the upload/fetch layer, before any validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row<S: Into<String>>(&mut self, row: impl IntoIterator<Item = S>) {
        self.rows.push(row.into_iter().map(Into::into).collect());
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cell value, or "" when the row is shorter than the header.
    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// --- Posts ---

/// Position of a post in the normalized batch of one analysis run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct PostId(pub usize);

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "post#{}", self.0)
    }
}

/// A validated social-media post. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub source: String,
}

impl Post {
    /// Content fingerprint used to recognise the same post across re-runs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.source.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.url.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.text.as_bytes());
        hex::encode(hasher.finalize())
    }
}

// --- Clusters ---

pub type ClusterId = u64;

/// A narrative cluster of one analysis run. Ids are issued by the session registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub member_post_ids: BTreeSet<PostId>,
    pub created_at: DateTime<Utc>,
    pub last_post_at: DateTime<Utc>,
    /// Fewer members than the configured minimum. Kept so analysts can inspect
    /// nascent narratives.
    pub low_confidence: bool,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.member_post_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_post_ids.is_empty()
    }

    pub fn contains(&self, post: PostId) -> bool {
        self.member_post_ids.contains(&post)
    }
}

// --- Momentum ---

/// Accumulated per-cluster activity across the runs of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentumState {
    pub sources: BTreeSet<String>,
    pub last_update: DateTime<Utc>,
    /// (bucket start, post count), strictly increasing by bucket start.
    pub post_count_history: Vec<(DateTime<Utc>, u32)>,
    pub current_score: f64,
    pub first_detected: DateTime<Utc>,
    /// Fingerprints of the posts counted in each bucket, so posts seen again in a
    /// later run are not counted twice.
    #[serde(default)]
    pub bucket_posts: BTreeMap<DateTime<Utc>, BTreeSet<String>>,
}

impl MomentumState {
    pub fn unique_sources(&self) -> usize {
        self.sources.len()
    }

    pub fn total_posts(&self) -> u64 {
        self.post_count_history
            .iter()
            .map(|(_, count)| *count as u64)
            .sum()
    }

    /// Busiest bucket; the earliest one wins a tie.
    pub fn peak_bucket(&self) -> Option<(DateTime<Utc>, u32)> {
        self.post_count_history
            .iter()
            .copied()
            .fold(None, |best, (bucket, count)| match best {
                Some((_, best_count)) if best_count >= count => best,
                _ => Some((bucket, count)),
            })
    }
}

/// One row of the ranked emerging-trend list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendEntry {
    pub cluster_id: ClusterId,
    pub score: f64,
}

// --- Tiers ---

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    AmbientNoise,
    EmergingNarrative,
    CoordinatedActivity,
    ViralEmergency,
}

impl Tier {
    pub const ALL: [Tier; 4] = [
        Tier::AmbientNoise,
        Tier::EmergingNarrative,
        Tier::CoordinatedActivity,
        Tier::ViralEmergency,
    ];

    /// Analyst-facing label, also used in the `Thread Categorization` column.
    pub fn label(&self) -> &'static str {
        match self {
            Tier::AmbientNoise => "Tier 1: Ambient Noise (Normal baseline activity)",
            Tier::EmergingNarrative => "Tier 2: Emerging Narrative (Potential story development)",
            Tier::CoordinatedActivity => "Tier 3: Coordinated Activity (Organized group behavior)",
            Tier::ViralEmergency => "Tier 4: Viral Emergency (Requires immediate response)",
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            Tier::AmbientNoise => "Ambient Noise",
            Tier::EmergingNarrative => "Emerging Narrative",
            Tier::CoordinatedActivity => "Coordinated Activity",
            Tier::ViralEmergency => "Viral Emergency",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Tier {
    type Err = RadarError;

    /// Accepts the full label, the short name, or the snake_case variant name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Tier::ALL
            .into_iter()
            .find(|tier| {
                trimmed == tier.label()
                    || trimmed.eq_ignore_ascii_case(tier.short_name())
                    || trimmed.eq_ignore_ascii_case(&tier.short_name().replace(' ', "_"))
            })
            .ok_or_else(|| RadarError::InvalidTier(trimmed.to_string()))
    }
}

// --- Reports ---

/// Investigative summary for one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub cluster_id: ClusterId,
    pub narrative_text: String,
    /// At most five, most recent first.
    pub sample_texts: Vec<String>,
    pub sample_urls: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn raw_table_short_rows_read_as_empty() {
        let mut table = RawTable::new(["text", "Timestamp"]);
        table.push_row(["hello"]);
        assert_eq!(table.cell(0, 0), "hello");
        assert_eq!(table.cell(0, 1), "");
        assert_eq!(table.cell(5, 0), "");
    }

    #[test]
    fn fingerprint_changes_with_any_field() {
        let post = Post {
            text: "a".into(),
            timestamp: at(1),
            url: "u".into(),
            source: "s".into(),
        };
        let mut other = post.clone();
        other.source = "t".into();
        assert_ne!(post.fingerprint(), other.fingerprint());
        assert_eq!(post.fingerprint(), post.clone().fingerprint());
    }

    #[test]
    fn tiers_are_ordered_by_severity() {
        assert!(Tier::AmbientNoise < Tier::EmergingNarrative);
        assert!(Tier::EmergingNarrative < Tier::CoordinatedActivity);
        assert!(Tier::CoordinatedActivity < Tier::ViralEmergency);
    }

    #[test]
    fn tier_parses_from_label_and_short_name() {
        for tier in Tier::ALL {
            assert_eq!(tier.label().parse::<Tier>().unwrap(), tier);
            assert_eq!(tier.short_name().parse::<Tier>().unwrap(), tier);
        }
        assert_eq!("viral_emergency".parse::<Tier>().unwrap(), Tier::ViralEmergency);
        assert!("Tier 9".parse::<Tier>().is_err());
    }

    #[test]
    fn peak_bucket_prefers_earliest_on_tie() {
        let state = MomentumState {
            sources: BTreeSet::new(),
            last_update: at(12),
            post_count_history: vec![(at(0), 4), (at(6), 7), (at(12), 7)],
            current_score: 0.0,
            first_detected: at(0),
            bucket_posts: BTreeMap::new(),
        };
        assert_eq!(state.peak_bucket(), Some((at(6), 7)));
        assert_eq!(state.total_posts(), 18);
    }
}
