//! Per-session state: cluster identities, momentum, and derived-artifact caches.
//!
//! Everything mutable sits behind one `tokio::sync::Mutex`, so concurrent analyses
//! against the same session serialise on the merge step and momentum state has a
//! single writer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use radar_common::{ClusterId, ClusteringConfig, MomentumState, Post, RadarError, Report};

use crate::activity::ActivityMatrix;
use crate::clusterer::ClusterDraft;
use crate::similarity::cosine_distance;

/// What the registry remembers about an issued cluster id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredCluster {
    /// Content fingerprints of the members seen most recently.
    pub members: BTreeSet<String>,
    pub centroid: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub last_post_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub by_members: usize,
    pub by_centroid: usize,
    pub issued: usize,
}

/// Issues cluster ids and keeps them stable across re-runs.
///
/// A new grouping inherits an old id when it contains at least `containment_threshold`
/// of the old cluster's posts. Failing that, it inherits the id of the nearest unclaimed
/// old cluster whose centroid is within `max_distance` and whose time range sits within
/// one window. Otherwise a fresh id is issued. Ids are never reused.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRegistry {
    next_id: ClusterId,
    clusters: BTreeMap<ClusterId, RegisteredCluster>,
}

impl ClusterRegistry {
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn get(&self, id: ClusterId) -> Option<&RegisteredCluster> {
        self.clusters.get(&id)
    }

    /// One id per draft, same order. Deterministic for identical inputs.
    pub fn reconcile(
        &mut self,
        drafts: &[ClusterDraft],
        posts: &[Post],
        config: &ClusteringConfig,
    ) -> (Vec<ClusterId>, ReconcileStats) {
        let fingerprints: Vec<BTreeSet<String>> = drafts
            .iter()
            .map(|d| {
                d.members
                    .iter()
                    .filter_map(|id| posts.get(id.0))
                    .map(Post::fingerprint)
                    .collect()
            })
            .collect();

        let mut assigned: Vec<Option<ClusterId>> = vec![None; drafts.len()];
        let mut claimed: BTreeSet<ClusterId> = BTreeSet::new();
        let mut stats = ReconcileStats::default();

        // Member containment, strongest overlap first.
        let mut candidates: Vec<(f64, usize, ClusterId, usize)> = Vec::new();
        for (d_idx, members) in fingerprints.iter().enumerate() {
            for (id, old) in &self.clusters {
                if old.members.is_empty() {
                    continue;
                }
                let shared = old.members.intersection(members).count();
                if shared == 0 {
                    continue;
                }
                let containment = shared as f64 / old.members.len() as f64;
                if containment >= config.containment_threshold {
                    candidates.push((containment, shared, *id, d_idx));
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(b.1.cmp(&a.1))
                .then(a.2.cmp(&b.2))
                .then(a.3.cmp(&b.3))
        });
        for (_, _, id, d_idx) in candidates {
            if assigned[d_idx].is_none() && claimed.insert(id) {
                assigned[d_idx] = Some(id);
                stats.by_members += 1;
            }
        }

        // Centroid proximity for groupings made of posts the registry has not seen.
        let window = Duration::hours(config.window_hours);
        for (d_idx, draft) in drafts.iter().enumerate() {
            if assigned[d_idx].is_some() {
                continue;
            }
            let nearest = self
                .clusters
                .iter()
                .filter(|(id, old)| {
                    !claimed.contains(*id)
                        && old.centroid.len() == draft.centroid.len()
                        && draft.created_at <= old.last_post_at + window
                        && old.created_at <= draft.last_post_at + window
                })
                .map(|(id, old)| (*id, cosine_distance(&old.centroid, &draft.centroid)))
                .filter(|(_, distance)| *distance <= config.max_distance)
                .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            if let Some((id, distance)) = nearest {
                debug!(cluster_id = id, distance, "Cluster id kept by centroid");
                claimed.insert(id);
                assigned[d_idx] = Some(id);
                stats.by_centroid += 1;
            }
        }

        let mut ids = Vec::with_capacity(drafts.len());
        for ((draft, members), slot) in drafts.iter().zip(fingerprints).zip(assigned) {
            let id = match slot {
                Some(id) => id,
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    stats.issued += 1;
                    id
                }
            };
            let entry = self.clusters.entry(id).or_insert_with(|| RegisteredCluster {
                members: BTreeSet::new(),
                centroid: Vec::new(),
                created_at: draft.created_at,
                last_post_at: draft.last_post_at,
            });
            entry.members = members;
            entry.centroid = draft.centroid.clone();
            entry.created_at = entry.created_at.min(draft.created_at);
            entry.last_post_at = entry.last_post_at.max(draft.last_post_at);
            ids.push(id);
        }
        (ids, stats)
    }
}

/// Mutable session contents. Only reachable through [`AnalysisSession::lock`].
#[derive(Debug, Default)]
pub struct SessionState {
    pub momentum: BTreeMap<ClusterId, MomentumState>,
    pub registry: ClusterRegistry,
    /// Latest report per cluster with the fingerprint of the inputs it was built from.
    pub reports: HashMap<ClusterId, (String, Report)>,
    /// Activity matrix of the most recently inspected run, with its run fingerprint.
    pub matrix: Option<(String, Arc<ActivityMatrix>)>,
    pub runs: usize,
}

/// Serialisable session contents. Derived caches are not included; they are rebuilt
/// on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub runs: usize,
    pub momentum: BTreeMap<ClusterId, MomentumState>,
    pub registry: ClusterRegistry,
}

impl SessionSnapshot {
    pub fn to_json(&self) -> Result<String, RadarError> {
        serde_json::to_string_pretty(self)
            .context("Failed to serialize session snapshot")
            .map_err(RadarError::from)
    }

    pub fn from_json(json: &str) -> Result<Self, RadarError> {
        serde_json::from_str(json)
            .context("Failed to parse session snapshot")
            .map_err(RadarError::from)
    }
}

/// One analyst session. Created at session start and dropped at its end; nothing
/// outlives it unless snapshotted.
pub struct AnalysisSession {
    id: Uuid,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

impl AnalysisSession {
    pub fn new() -> Self {
        let id = Uuid::new_v4();
        info!(session_id = %id, "Session started");
        Self {
            id,
            created_at: Utc::now(),
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    pub async fn momentum_state(&self, id: ClusterId) -> Option<MomentumState> {
        self.state.lock().await.momentum.get(&id).cloned()
    }

    pub async fn momentum_states(&self) -> BTreeMap<ClusterId, MomentumState> {
        self.state.lock().await.momentum.clone()
    }

    pub async fn runs(&self) -> usize {
        self.state.lock().await.runs
    }

    pub async fn cached_reports(&self) -> usize {
        self.state.lock().await.reports.len()
    }

    pub async fn cached_matrices(&self) -> usize {
        usize::from(self.state.lock().await.matrix.is_some())
    }

    /// Forget everything: ids, momentum, caches.
    pub async fn reset(&self) {
        *self.state.lock().await = SessionState::default();
        info!(session_id = %self.id, "Session reset");
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        SessionSnapshot {
            session_id: self.id,
            created_at: self.created_at,
            runs: state.runs,
            momentum: state.momentum.clone(),
            registry: state.registry.clone(),
        }
    }

    /// Replace the session contents with a snapshot. Caches are dropped.
    pub async fn restore(&self, snapshot: SessionSnapshot) {
        let mut state = self.state.lock().await;
        *state = SessionState {
            momentum: snapshot.momentum,
            registry: snapshot.registry,
            runs: snapshot.runs,
            ..SessionState::default()
        };
        info!(
            session_id = %self.id,
            from = %snapshot.session_id,
            clusters = state.momentum.len(),
            "Session restored"
        );
    }

    pub async fn save_snapshot(&self, path: &Path) -> Result<(), RadarError> {
        let json = self.snapshot().await.to_json()?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write snapshot {}", path.display()))?;
        Ok(())
    }

    pub async fn load_snapshot(&self, path: &Path) -> Result<(), RadarError> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        self.restore(SessionSnapshot::from_json(&json)?).await;
        Ok(())
    }
}

impl Default for AnalysisSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use radar_common::PostId;

    fn at(hour: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap() + Duration::hours(hour)
    }

    fn post(hour: i64, text: &str) -> Post {
        Post {
            text: text.into(),
            timestamp: at(hour),
            url: String::new(),
            source: "s".into(),
        }
    }

    fn draft(members: &[usize], posts: &[Post], centroid: Vec<f32>) -> ClusterDraft {
        ClusterDraft {
            members: members.iter().copied().map(PostId).collect(),
            centroid,
            created_at: members.iter().map(|&i| posts[i].timestamp).min().unwrap(),
            last_post_at: members.iter().map(|&i| posts[i].timestamp).max().unwrap(),
            low_confidence: false,
        }
    }

    // --- registry ---

    #[test]
    fn identical_rerun_keeps_every_id() {
        let posts: Vec<Post> = (0..6).map(|i| post(i, &format!("p{i}"))).collect();
        let drafts = vec![
            draft(&[0, 1, 2], &posts, vec![1.0, 0.0]),
            draft(&[3, 4, 5], &posts, vec![0.0, 1.0]),
        ];
        let config = ClusteringConfig::default();
        let mut registry = ClusterRegistry::default();
        let (first, stats) = registry.reconcile(&drafts, &posts, &config);
        assert_eq!(first, vec![0, 1]);
        assert_eq!(stats.issued, 2);

        let (second, stats) = registry.reconcile(&drafts, &posts, &config);
        assert_eq!(second, first);
        assert_eq!(stats.by_members, 2);
        assert_eq!(stats.issued, 0);
    }

    #[test]
    fn grown_cluster_keeps_its_id_even_when_reordered() {
        let posts: Vec<Post> = (0..8).map(|i| post(i, &format!("p{i}"))).collect();
        let config = ClusteringConfig::default();
        let mut registry = ClusterRegistry::default();
        registry.reconcile(
            &[
                draft(&[0, 1], &posts, vec![1.0, 0.0]),
                draft(&[2, 3], &posts, vec![0.0, 1.0]),
            ],
            &posts,
            &config,
        );

        // Second run: the second story grew and now sorts first.
        let (ids, _) = registry.reconcile(
            &[
                draft(&[2, 3, 4, 5], &posts, vec![0.0, 1.0]),
                draft(&[1, 6], &posts, vec![1.0, 0.0]),
            ],
            &posts,
            &config,
        );
        assert_eq!(ids, vec![1, 0]);
    }

    #[test]
    fn unseen_posts_near_an_old_centroid_inherit_its_id() {
        let posts = vec![post(0, "a"), post(1, "b"), post(30, "c"), post(31, "d")];
        let config = ClusteringConfig::default();
        let mut registry = ClusterRegistry::default();
        registry.reconcile(&[draft(&[0, 1], &posts, vec![1.0, 0.1])], &posts, &config);

        let (ids, stats) =
            registry.reconcile(&[draft(&[2, 3], &posts, vec![1.0, 0.0])], &posts, &config);
        assert_eq!(ids, vec![0]);
        assert_eq!(stats.by_centroid, 1);
    }

    #[test]
    fn distant_or_dissimilar_groupings_get_fresh_ids() {
        let posts = vec![post(0, "a"), post(1, "b"), post(500, "c"), post(2, "d")];
        let config = ClusteringConfig::default();
        let mut registry = ClusterRegistry::default();
        registry.reconcile(&[draft(&[0, 1], &posts, vec![1.0, 0.0])], &posts, &config);

        let (ids, _) = registry.reconcile(
            &[
                draft(&[3], &posts, vec![0.0, 1.0]),
                draft(&[2], &posts, vec![1.0, 0.0]),
            ],
            &posts,
            &config,
        );
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn two_groupings_never_share_an_id() {
        let posts: Vec<Post> = (0..4).map(|i| post(i, &format!("p{i}"))).collect();
        let config = ClusteringConfig::default();
        let mut registry = ClusterRegistry::default();
        registry.reconcile(&[draft(&[0, 1, 2, 3], &posts, vec![1.0, 0.0])], &posts, &config);

        // The old cluster splits in half; only one half can keep the id.
        let (ids, _) = registry.reconcile(
            &[
                draft(&[0, 1], &posts, vec![1.0, 0.0]),
                draft(&[2, 3], &posts, vec![1.0, 0.0]),
            ],
            &posts,
            &config,
        );
        assert_eq!(ids, vec![0, 1]);
    }

    // --- session ---

    fn state(score: f64) -> MomentumState {
        MomentumState {
            sources: BTreeSet::from(["a".to_string()]),
            last_update: at(5),
            post_count_history: vec![(at(0), 3)],
            current_score: score,
            first_detected: at(1),
            bucket_posts: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let session = AnalysisSession::new();
        {
            let mut s = session.lock().await;
            s.momentum.insert(0, state(4.0));
            s.runs = 2;
        }
        session.reset().await;
        assert!(session.momentum_states().await.is_empty());
        assert_eq!(session.runs().await, 0);
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_json() {
        let session = AnalysisSession::new();
        {
            let mut s = session.lock().await;
            s.momentum.insert(3, state(7.5));
            s.runs = 1;
            s.reports.insert(
                3,
                (
                    "k".into(),
                    Report {
                        cluster_id: 3,
                        narrative_text: "n".into(),
                        sample_texts: vec![],
                        sample_urls: vec![],
                    },
                ),
            );
        }
        let json = session.snapshot().await.to_json().unwrap();

        let other = AnalysisSession::new();
        other.restore(SessionSnapshot::from_json(&json).unwrap()).await;
        assert_eq!(other.momentum_state(3).await, Some(state(7.5)));
        assert_eq!(other.runs().await, 1);
        assert_eq!(other.cached_reports().await, 0);
    }

    #[tokio::test]
    async fn snapshot_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let session = AnalysisSession::new();
        session.lock().await.momentum.insert(1, state(2.0));
        session.save_snapshot(&path).await.unwrap();

        let restored = AnalysisSession::new();
        restored.load_snapshot(&path).await.unwrap();
        assert_eq!(restored.momentum_states().await, session.momentum_states().await);
    }

    #[tokio::test]
    async fn missing_snapshot_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let session = AnalysisSession::new();
        let err = session
            .load_snapshot(&dir.path().join("nope.json"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read snapshot"));
    }

    #[test]
    fn malformed_snapshot_is_rejected() {
        assert!(SessionSnapshot::from_json("{not json").is_err());
    }
}
