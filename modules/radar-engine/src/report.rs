//! Investigative summaries.
//!
//! Reports are assembled from the cluster's posts and momentum state only, with no
//! clock reads and no randomness, so the same inputs always give the same bytes.

use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};

use radar_common::{Cluster, MomentumConfig, MomentumState, Post, PostId, Report, Tier};

use crate::momentum::trajectory;

pub const MAX_SAMPLES: usize = 5;

/// Token overlap at or above which two samples count as the same text.
const NEAR_DUPLICATE_JACCARD: f64 = 0.8;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:https?://|www\.)\S+").expect("valid regex"));
static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@\w+").expect("valid regex"));

fn format_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M UTC").to_string()
}

/// Lowercased text without URLs, mentions or punctuation, single-spaced.
pub fn normalize_sample(text: &str) -> String {
    let stripped = URL_RE.replace_all(text, " ");
    let stripped = MENTION_RE.replace_all(&stripped, " ");
    stripped
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn jaccard(a: &HashSet<&str>, b: &HashSet<&str>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let shared = a.intersection(b).count();
    shared as f64 / (a.len() + b.len() - shared) as f64
}

pub struct ReportSynthesizer {
    momentum: MomentumConfig,
}

impl ReportSynthesizer {
    pub fn new(momentum: MomentumConfig) -> Self {
        Self { momentum }
    }

    pub fn synthesize(
        &self,
        cluster: &Cluster,
        posts: &[Post],
        state: &MomentumState,
        tier: Tier,
    ) -> Report {
        let members = members(cluster, posts);
        Report {
            cluster_id: cluster.id,
            narrative_text: self.narrative(cluster, state, tier),
            sample_texts: sample_texts(&members),
            sample_urls: sample_urls(&members),
        }
    }

    /// Content fingerprint of everything a report is built from.
    pub fn cache_key(
        &self,
        cluster: &Cluster,
        posts: &[Post],
        state: &MomentumState,
        tier: Tier,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(cluster.id.to_le_bytes());
        for (_, post) in members(cluster, posts) {
            hasher.update(post.fingerprint().as_bytes());
        }
        hasher.update(state.current_score.to_le_bytes());
        hasher.update(state.last_update.to_rfc3339().as_bytes());
        hasher.update(state.unique_sources().to_le_bytes());
        hasher.update(tier.short_name().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn narrative(&self, cluster: &Cluster, state: &MomentumState, tier: Tier) -> String {
        let trend = trajectory(
            &state.post_count_history,
            self.momentum.bucket_hours,
            self.momentum.lookback_buckets,
        );
        let mut text = format!(
            "Narrative cluster {} groups {} post{} from {} unique source{}, first detected {} and last active {}. ",
            cluster.id,
            cluster.len(),
            if cluster.len() == 1 { "" } else { "s" },
            state.unique_sources(),
            if state.unique_sources() == 1 { "" } else { "s" },
            format_time(state.first_detected),
            format_time(state.last_update),
        );
        text.push_str(&format!("Activity is {trend}"));
        if let Some((bucket, count)) = state.peak_bucket() {
            text.push_str(&format!(
                ", peaking at {count} post{} in the {}h window starting {}",
                if count == 1 { "" } else { "s" },
                self.momentum.bucket_hours,
                format_time(bucket),
            ));
        }
        text.push_str(&format!(
            ". Momentum score {:.2} places it in {}.",
            state.current_score,
            tier.label()
        ));
        if cluster.low_confidence {
            text.push_str(" Low confidence: too few posts to confirm a coordinated narrative.");
        }
        text
    }
}

/// Member posts with their ids, chronological (ties by id).
fn members<'a>(cluster: &Cluster, posts: &'a [Post]) -> Vec<(PostId, &'a Post)> {
    let mut members: Vec<(PostId, &Post)> = cluster
        .member_post_ids
        .iter()
        .filter_map(|id| posts.get(id.0).map(|p| (*id, p)))
        .collect();
    members.sort_by(|(a_id, a), (b_id, b)| a.timestamp.cmp(&b.timestamp).then(a_id.cmp(b_id)));
    members
}

/// Most recent first, near-duplicates skipped, at most [`MAX_SAMPLES`].
fn sample_texts(members: &[(PostId, &Post)]) -> Vec<String> {
    let mut ordered: Vec<&(PostId, &Post)> = members.iter().collect();
    ordered.sort_by(|(a_id, a), (b_id, b)| b.timestamp.cmp(&a.timestamp).then(a_id.cmp(b_id)));

    let mut chosen: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    for (_, post) in ordered {
        if chosen.len() == MAX_SAMPLES {
            break;
        }
        let normalized = normalize_sample(&post.text);
        let duplicate = {
            let tokens: HashSet<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();
            seen.iter().any(|prior| {
                if *prior == normalized {
                    return true;
                }
                let prior_tokens: HashSet<&str> =
                    prior.split(' ').filter(|t| !t.is_empty()).collect();
                !tokens.is_empty()
                    && !prior_tokens.is_empty()
                    && jaccard(&tokens, &prior_tokens) >= NEAR_DUPLICATE_JACCARD
            })
        };
        if duplicate {
            continue;
        }
        chosen.push(post.text.clone());
        seen.push(normalized);
    }
    chosen
}

/// Distinct non-empty URLs in order of first appearance.
fn sample_urls(members: &[(PostId, &Post)]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    members
        .iter()
        .map(|(_, p)| p.url.trim())
        .filter(|url| !url.is_empty() && seen.insert(*url))
        .map(str::to_string)
        .collect()
}
