//! Momentum: pure scoring functions plus the tracker that merges per-cluster state.
//!
//! Formula, evaluated at a reference time `now`:
//!   growth  = count(bucket containing now) / (mean(previous lookback buckets, gaps = 0) + 1)
//!   breadth = sqrt(unique_sources)
//!   volume  = Σ count · 0.5^(age / half_life)
//!   score   = w_growth · ln(1 + growth) + w_sources · breadth + w_volume · ln(1 + volume)
//!
//! `now` is the newest post time the session has seen, not the wall clock. A cluster
//! that went quiet decays against the rest of the data, and re-running stable input
//! yields the same score.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use radar_common::{Cluster, ClusterId, MomentumConfig, MomentumState, Post, TrendEntry};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MomentumComponents {
    pub growth: f64,
    pub source_breadth: f64,
    pub decayed_volume: f64,
}

/// Shape of the recent count series, for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trajectory {
    New,
    Accelerating,
    Steady,
    Declining,
}

impl fmt::Display for Trajectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trajectory::New => write!(f, "newly surfaced"),
            Trajectory::Accelerating => write!(f, "accelerating"),
            Trajectory::Steady => write!(f, "holding steady"),
            Trajectory::Declining => write!(f, "declining"),
        }
    }
}

/// Start of the epoch-aligned bucket containing `ts`.
pub fn bucket_start(ts: DateTime<Utc>, bucket_hours: i64) -> DateTime<Utc> {
    let width = bucket_hours.max(1) * 3600;
    let start = ts.timestamp().div_euclid(width) * width;
    DateTime::from_timestamp(start, 0).unwrap_or(ts)
}

/// Post fingerprints grouped by bucket.
pub fn bucket_posts<'a>(
    posts: impl IntoIterator<Item = &'a Post>,
    bucket_hours: i64,
) -> BTreeMap<DateTime<Utc>, BTreeSet<String>> {
    let mut buckets: BTreeMap<DateTime<Utc>, BTreeSet<String>> = BTreeMap::new();
    for post in posts {
        buckets
            .entry(bucket_start(post.timestamp, bucket_hours))
            .or_default()
            .insert(post.fingerprint());
    }
    buckets
}

fn count_at(history: &[(DateTime<Utc>, u32)], bucket: DateTime<Utc>) -> u32 {
    history
        .binary_search_by(|(start, _)| start.cmp(&bucket))
        .map(|i| history[i].1)
        .unwrap_or(0)
}

/// Mean count of the `lookback` buckets before `bucket`; gaps count as zero.
fn trailing_average(
    history: &[(DateTime<Utc>, u32)],
    bucket: DateTime<Utc>,
    bucket_hours: i64,
    lookback: usize,
) -> f64 {
    let width = Duration::hours(bucket_hours);
    let lookback = lookback.max(1);
    let total: u32 = (1..=lookback as i32)
        .map(|k| count_at(history, bucket - width * k))
        .sum();
    total as f64 / lookback as f64
}

/// Posts in the bucket containing `now` relative to the trailing average of the
/// buckets before it. Zero for a cluster with no posts in the current bucket.
pub fn growth_rate(
    history: &[(DateTime<Utc>, u32)],
    now: DateTime<Utc>,
    bucket_hours: i64,
    lookback: usize,
) -> f64 {
    let current = bucket_start(now, bucket_hours);
    let latest = count_at(history, current);
    if latest == 0 {
        return 0.0;
    }
    latest as f64 / (trailing_average(history, current, bucket_hours, lookback) + 1.0)
}

/// Square-root dampening so one prolific source cannot carry the score.
pub fn source_breadth(unique_sources: usize) -> f64 {
    (unique_sources as f64).sqrt()
}

/// Post volume with exponential decay by bucket age (measured from bucket end).
pub fn decayed_volume(
    history: &[(DateTime<Utc>, u32)],
    now: DateTime<Utc>,
    bucket_hours: i64,
    half_life_hours: f64,
) -> f64 {
    let width = Duration::hours(bucket_hours);
    history
        .iter()
        .map(|&(start, count)| {
            let age_hours = ((now - (start + width)).num_seconds().max(0) as f64) / 3600.0;
            count as f64 * 0.5f64.powf(age_hours / half_life_hours)
        })
        .sum()
}

pub fn components(
    state: &MomentumState,
    now: DateTime<Utc>,
    config: &MomentumConfig,
) -> MomentumComponents {
    let history = &state.post_count_history;
    MomentumComponents {
        growth: growth_rate(history, now, config.bucket_hours, config.lookback_buckets),
        source_breadth: source_breadth(state.unique_sources()),
        decayed_volume: decayed_volume(history, now, config.bucket_hours, config.half_life_hours),
    }
}

/// Weighted combination. Non-negative for non-negative weights.
pub fn momentum_score(c: &MomentumComponents, config: &MomentumConfig) -> f64 {
    config.growth_weight * c.growth.ln_1p()
        + config.source_weight * c.source_breadth
        + config.volume_weight * c.decayed_volume.ln_1p()
}

/// Shape of the cluster's own series, judged at its latest bucket.
pub fn trajectory(
    history: &[(DateTime<Utc>, u32)],
    bucket_hours: i64,
    lookback: usize,
) -> Trajectory {
    let Some(&(latest_bucket, latest)) = history.last() else {
        return Trajectory::New;
    };
    if history.len() == 1 {
        return Trajectory::New;
    }
    let baseline = trailing_average(history, latest_bucket, bucket_hours, lookback);
    if baseline == 0.0 {
        // Activity after a quiet stretch.
        return Trajectory::Accelerating;
    }
    let ratio = latest as f64 / baseline;
    if ratio > 1.25 {
        Trajectory::Accelerating
    } else if ratio < 0.75 {
        Trajectory::Declining
    } else {
        Trajectory::Steady
    }
}

/// What one run saw of one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub sources: BTreeSet<String>,
    /// Member fingerprints per bucket.
    pub buckets: BTreeMap<DateTime<Utc>, BTreeSet<String>>,
    pub first_post: DateTime<Utc>,
    pub last_post: DateTime<Utc>,
}

/// Per-cluster momentum. The session calls it while holding its state lock, which
/// makes the tracker the single writer of [`MomentumState`].
pub struct MomentumTracker {
    config: MomentumConfig,
}

impl MomentumTracker {
    pub fn new(config: MomentumConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MomentumConfig {
        &self.config
    }

    pub fn observe(&self, cluster: &Cluster, posts: &[Post]) -> Observation {
        let members: Vec<&Post> = cluster
            .member_post_ids
            .iter()
            .filter_map(|id| posts.get(id.0))
            .collect();
        Observation {
            sources: members
                .iter()
                .map(|p| p.source.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            buckets: bucket_posts(members.iter().copied(), self.config.bucket_hours),
            first_post: cluster.created_at,
            last_post: cluster.last_post_at,
        }
    }

    /// Score of `state` evaluated at `now`.
    pub fn score_at(&self, state: &MomentumState, now: DateTime<Utc>) -> f64 {
        momentum_score(&components(state, now, &self.config), &self.config)
    }

    /// Merge an observation into the previous state (if any) and score it at its own
    /// `last_update`.
    ///
    /// Each bucket counts the union of the post fingerprints seen for it, so re-reading
    /// the same data does not double count and new posts in a known bucket add up.
    /// Sources union, `last_update` only moves forward, `first_detected` only moves back.
    pub fn merge(
        &self,
        previous: Option<&MomentumState>,
        observation: Observation,
    ) -> MomentumState {
        let mut bucket_posts = previous
            .map(|s| s.bucket_posts.clone())
            .unwrap_or_default();
        for (bucket, fingerprints) in observation.buckets {
            bucket_posts.entry(bucket).or_default().extend(fingerprints);
        }

        // Snapshots written without fingerprints keep their recorded counts.
        let mut history: BTreeMap<DateTime<Utc>, u32> = previous
            .map(|s| s.post_count_history.iter().copied().collect())
            .unwrap_or_default();
        for (bucket, fingerprints) in &bucket_posts {
            let count = u32::try_from(fingerprints.len()).unwrap_or(u32::MAX);
            let slot = history.entry(*bucket).or_insert(0);
            *slot = (*slot).max(count);
        }

        let mut sources = previous.map(|s| s.sources.clone()).unwrap_or_default();
        sources.extend(observation.sources);

        let last_update = previous
            .map(|s| s.last_update.max(observation.last_post))
            .unwrap_or(observation.last_post);
        let first_detected = previous
            .map(|s| s.first_detected.min(observation.first_post))
            .unwrap_or(observation.first_post);

        let mut state = MomentumState {
            sources,
            last_update,
            post_count_history: history.into_iter().collect(),
            current_score: 0.0,
            first_detected,
            bucket_posts,
        };
        state.current_score = self.score_at(&state, last_update);
        state
    }

    /// Merge every cluster of a run into `states`, rescore every state at the newest
    /// post time seen so far, and rank the run's clusters.
    pub fn update(
        &self,
        states: &mut BTreeMap<ClusterId, MomentumState>,
        clusters: &[Cluster],
        posts: &[Post],
    ) -> Vec<TrendEntry> {
        for cluster in clusters {
            let observation = self.observe(cluster, posts);
            let merged = self.merge(states.get(&cluster.id), observation);
            states.insert(cluster.id, merged);
        }

        if let Some(now) = states.values().map(|s| s.last_update).max() {
            for state in states.values_mut() {
                state.current_score = self.score_at(state, now);
            }
            for cluster in clusters {
                if let Some(state) = states.get(&cluster.id) {
                    debug!(
                        cluster_id = cluster.id,
                        score = state.current_score,
                        sources = state.unique_sources(),
                        reference = %now,
                        "Momentum updated"
                    );
                }
            }
        }
        rank(states, clusters.iter().map(|c| c.id))
    }
}

/// Score descending; ties by more unique sources, then earlier first detection, then id.
pub fn rank(
    states: &BTreeMap<ClusterId, MomentumState>,
    ids: impl IntoIterator<Item = ClusterId>,
) -> Vec<TrendEntry> {
    let mut rows: Vec<(ClusterId, &MomentumState)> = ids
        .into_iter()
        .filter_map(|id| states.get(&id).map(|s| (id, s)))
        .collect();
    rows.sort_by(|(a_id, a), (b_id, b)| {
        b.current_score
            .total_cmp(&a.current_score)
            .then_with(|| b.unique_sources().cmp(&a.unique_sources()))
            .then_with(|| a.first_detected.cmp(&b.first_detected))
            .then_with(|| a_id.cmp(b_id))
    });
    rows.into_iter()
        .map(|(cluster_id, s)| TrendEntry {
            cluster_id,
            score: s.current_score,
        })
        .collect()
}
