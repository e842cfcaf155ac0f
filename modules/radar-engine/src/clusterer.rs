//! Temporal-semantic clustering.
//!
//! Two phases:
//! - **Window grouping:** posts are bucketed into overlapping windows (length
//!   `window_hours`, stride half of that). Inside a window, posts are visited in time
//!   order and join the nearest fragment centroid within `max_distance`, or seed a new
//!   fragment. Windows are independent and run on blocking tasks.
//! - **Merge:** fragments from the same or adjacent windows are joined with union-find
//!   when their centroids are within `max_distance` and their time ranges overlap or sit
//!   within one window of each other.
//!
//! Every post is labelled from its home window (the one whose first half holds it), so
//! the output is a hard partition even though windows overlap.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tracing::{debug, info};

use radar_common::{ClusteringConfig, Post, PostId, RadarError};

use crate::cancel::CancelFlag;
use crate::embedding_store::Embedding;
use crate::similarity::{cosine_distance, mean_vector, update_centroid};
use crate::union_find::UnionFind;

/// Distances closer than this count as a tie.
const TIE_EPSILON: f64 = 1e-9;

/// A cluster before the session has issued it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterDraft {
    pub members: BTreeSet<PostId>,
    pub centroid: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub last_post_at: DateTime<Utc>,
    pub low_confidence: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClusterStats {
    pub windows: usize,
    pub fragments: usize,
    pub merges: usize,
    pub clusters: usize,
    pub low_confidence: usize,
}

impl fmt::Display for ClusterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Clusterer: {} windows, {} fragments, {} merges, {} clusters ({} low-confidence)",
            self.windows, self.fragments, self.merges, self.clusters, self.low_confidence,
        )
    }
}

#[derive(Debug, Clone)]
pub struct ClusteringOutcome {
    /// Ordered by first post time, then lowest member id.
    pub drafts: Vec<ClusterDraft>,
    pub stats: ClusterStats,
}

#[derive(Debug, Clone)]
struct Point {
    id: PostId,
    timestamp: DateTime<Utc>,
    vector: Embedding,
    home_window: usize,
}

#[derive(Debug, Clone)]
struct Fragment {
    window: usize,
    /// Indices into the point list.
    members: Vec<usize>,
    centroid: Vec<f32>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Points sorted chronologically and the point indices of every non-empty window.
struct WindowPlan {
    points: Arc<Vec<Point>>,
    windows: BTreeMap<usize, Vec<usize>>,
}

pub struct Clusterer {
    config: ClusteringConfig,
}

impl Clusterer {
    pub fn new(config: ClusteringConfig) -> Self {
        Self { config }
    }

    /// Cluster sequentially, checking cancellation between windows.
    pub fn cluster(
        &self,
        posts: &[Post],
        embeddings: &[Embedding],
        cancel: &CancelFlag,
    ) -> Result<ClusteringOutcome, RadarError> {
        let plan = self.plan(posts, embeddings)?;
        let mut fragments = Vec::new();
        for (window, indices) in &plan.windows {
            cancel.check()?;
            fragments.extend(group_window(
                &plan.points,
                *window,
                indices,
                self.config.max_distance,
            ));
        }
        Ok(self.merge(&plan, fragments))
    }

    /// Cluster with one blocking task per window. The merge waits for every window.
    pub async fn cluster_concurrent(
        &self,
        posts: &[Post],
        embeddings: &[Embedding],
        cancel: &CancelFlag,
    ) -> Result<ClusteringOutcome, RadarError> {
        let plan = self.plan(posts, embeddings)?;
        let max_distance = self.config.max_distance;

        let tasks = plan.windows.iter().map(|(window, indices)| {
            let points = Arc::clone(&plan.points);
            let indices = indices.clone();
            let window = *window;
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                cancel.check()?;
                Ok::<_, RadarError>(group_window(&points, window, &indices, max_distance))
            })
        });

        let mut fragments = Vec::new();
        for joined in join_all(tasks).await {
            let window_fragments =
                joined.map_err(|e| RadarError::Anyhow(anyhow!("window task failed: {e}")))??;
            fragments.extend(window_fragments);
        }
        cancel.check()?;
        Ok(self.merge(&plan, fragments))
    }

    fn plan(&self, posts: &[Post], embeddings: &[Embedding]) -> Result<WindowPlan, RadarError> {
        if posts.len() != embeddings.len() {
            return Err(RadarError::Anyhow(anyhow!(
                "{} posts but {} embeddings",
                posts.len(),
                embeddings.len()
            )));
        }

        let stride_secs = (self.config.window_hours * 3600 / 2).max(1);
        let origin = posts.iter().map(|p| p.timestamp).min();
        let mut points: Vec<Point> = posts
            .iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (post, vector))| {
                let offset = origin
                    .map(|o| (post.timestamp - o).num_seconds())
                    .unwrap_or(0);
                Point {
                    id: PostId(i),
                    timestamp: post.timestamp,
                    vector: Arc::clone(vector),
                    home_window: (offset / stride_secs) as usize,
                }
            })
            .collect();
        points.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        let mut windows: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (idx, point) in points.iter().enumerate() {
            // A post lies in the first half of its home window and the second half
            // of the previous one.
            if point.home_window > 0 {
                windows.entry(point.home_window - 1).or_default().push(idx);
            }
            windows.entry(point.home_window).or_default().push(idx);
        }

        Ok(WindowPlan {
            points: Arc::new(points),
            windows,
        })
    }

    fn merge(&self, plan: &WindowPlan, fragments: Vec<Fragment>) -> ClusteringOutcome {
        let points = &plan.points;
        let window_span = Duration::hours(self.config.window_hours);
        let mut stats = ClusterStats {
            windows: plan.windows.len(),
            fragments: fragments.len(),
            ..ClusterStats::default()
        };

        // Fragments arrive in window order.
        let mut uf = UnionFind::new(fragments.len());
        for i in 0..fragments.len() {
            for j in (i + 1)..fragments.len() {
                let (a, b) = (&fragments[i], &fragments[j]);
                if b.window > a.window + 1 {
                    break;
                }
                let gap = if b.start > a.end {
                    b.start - a.end
                } else if a.start > b.end {
                    a.start - b.end
                } else {
                    Duration::zero()
                };
                if gap <= window_span
                    && cosine_distance(&a.centroid, &b.centroid) <= self.config.max_distance
                    && uf.union(i, j)
                {
                    stats.merges += 1;
                }
            }
        }

        // Home-window labelling: each point takes the fragment from its home window.
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (f_idx, fragment) in fragments.iter().enumerate() {
            let root = uf.find(f_idx);
            for &p in &fragment.members {
                if points[p].home_window == fragment.window {
                    groups.entry(root).or_default().push(p);
                }
            }
        }

        let dimension = points.first().map(|p| p.vector.len()).unwrap_or(0);
        let mut drafts: Vec<ClusterDraft> = groups
            .into_values()
            .filter(|members| !members.is_empty())
            .map(|members| {
                let created_at = members.iter().map(|&p| points[p].timestamp).min();
                let last_post_at = members.iter().map(|&p| points[p].timestamp).max();
                let centroid = mean_vector(members.iter().map(|&p| &*points[p].vector), dimension);
                let ids: BTreeSet<PostId> = members.iter().map(|&p| points[p].id).collect();
                ClusterDraft {
                    low_confidence: ids.len() < self.config.min_cluster_size,
                    members: ids,
                    centroid,
                    // Groups are non-empty, so both bounds exist.
                    created_at: created_at.unwrap_or_default(),
                    last_post_at: last_post_at.unwrap_or_default(),
                }
            })
            .collect();
        drafts.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.members.first().cmp(&b.members.first()))
        });

        stats.clusters = drafts.len();
        stats.low_confidence = drafts.iter().filter(|d| d.low_confidence).count();
        info!(
            windows = stats.windows,
            fragments = stats.fragments,
            merges = stats.merges,
            clusters = stats.clusters,
            low_confidence = stats.low_confidence,
            "Clustering complete"
        );
        ClusteringOutcome { drafts, stats }
    }
}

/// Density grouping inside one window. `indices` are chronological.
fn group_window(
    points: &[Point],
    window: usize,
    indices: &[usize],
    max_distance: f64,
) -> Vec<Fragment> {
    let mut fragments: Vec<Fragment> = Vec::new();
    for &p in indices {
        let point = &points[p];

        let mut best: Option<(usize, f64)> = None;
        for (f_idx, fragment) in fragments.iter().enumerate() {
            let distance = cosine_distance(&point.vector, &fragment.centroid);
            best = match best {
                None => Some((f_idx, distance)),
                Some((b_idx, b_dist)) => {
                    if distance < b_dist - TIE_EPSILON {
                        Some((f_idx, distance))
                    } else if (distance - b_dist).abs() <= TIE_EPSILON
                        && fragment.members.len() > fragments[b_idx].members.len()
                    {
                        // Stability bias: equidistant goes to the larger cluster.
                        Some((f_idx, distance))
                    } else {
                        Some((b_idx, b_dist))
                    }
                }
            };
        }

        match best {
            Some((f_idx, distance)) if distance <= max_distance => {
                let fragment = &mut fragments[f_idx];
                update_centroid(&mut fragment.centroid, &point.vector, fragment.members.len());
                fragment.members.push(p);
                fragment.end = fragment.end.max(point.timestamp);
            }
            _ => fragments.push(Fragment {
                window,
                members: vec![p],
                centroid: point.vector.to_vec(),
                start: point.timestamp,
                end: point.timestamp,
            }),
        }
    }
    debug!(window, posts = indices.len(), fragments = fragments.len(), "Window grouped");
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn post(hours: i64) -> Post {
        Post {
            text: format!("post at {hours}"),
            timestamp: base() + Duration::hours(hours),
            url: String::new(),
            source: "s".into(),
        }
    }

    fn vec2(x: f32, y: f32) -> Embedding {
        Arc::from(vec![x, y])
    }

    fn clusterer() -> Clusterer {
        Clusterer::new(ClusteringConfig::default())
    }

    fn member_sets(outcome: &ClusteringOutcome) -> Vec<Vec<usize>> {
        outcome
            .drafts
            .iter()
            .map(|d| d.members.iter().map(|p| p.0).collect())
            .collect()
    }

    #[test]
    fn empty_input_yields_no_clusters() {
        let outcome = clusterer().cluster(&[], &[], &CancelFlag::new()).unwrap();
        assert!(outcome.drafts.is_empty());
    }

    #[test]
    fn mismatched_embeddings_are_rejected() {
        let result = clusterer().cluster(&[post(0)], &[], &CancelFlag::new());
        assert!(result.is_err());
    }

    #[test]
    fn similar_posts_group_and_dissimilar_split() {
        let posts = vec![post(0), post(1), post(2), post(3)];
        let vectors = vec![vec2(1.0, 0.0), vec2(0.0, 1.0), vec2(0.99, 0.05), vec2(1.0, 0.02)];
        let outcome = clusterer().cluster(&posts, &vectors, &CancelFlag::new()).unwrap();
        assert_eq!(member_sets(&outcome), vec![vec![0, 2, 3], vec![1]]);
        assert!(!outcome.drafts[0].low_confidence);
        assert!(outcome.drafts[1].low_confidence);
    }

    #[test]
    fn equidistant_post_joins_larger_cluster() {
        // Fragment A = {0, 2} at (1,0), fragment B = {1} at (0,1); post 3 is equidistant.
        let posts = vec![post(0), post(1), post(2), post(3)];
        let vectors = vec![vec2(1.0, 0.0), vec2(0.0, 1.0), vec2(1.0, 0.0), vec2(1.0, 1.0)];
        let config = ClusteringConfig {
            max_distance: 0.35,
            ..ClusteringConfig::default()
        };
        let outcome = Clusterer::new(config)
            .cluster(&posts, &vectors, &CancelFlag::new())
            .unwrap();
        assert_eq!(member_sets(&outcome), vec![vec![0, 2, 3], vec![1]]);

        // Mirrored geometry: the larger fragment now sits at (0,1).
        let vectors = vec![vec2(0.0, 1.0), vec2(1.0, 0.0), vec2(0.0, 1.0), vec2(1.0, 1.0)];
        let outcome = clusterer().cluster(&posts, &vectors, &CancelFlag::new()).unwrap();
        assert_eq!(member_sets(&outcome), vec![vec![0, 2, 3], vec![1]]);
    }

    #[test]
    fn narrative_spanning_windows_is_merged() {
        // Window 72h, stride 36h: posts every 20h for 10 days, all on one topic.
        let posts: Vec<Post> = (0..12).map(|i| post(i * 20)).collect();
        let vectors: Vec<Embedding> = (0..12).map(|_| vec2(1.0, 0.1)).collect();
        let outcome = clusterer().cluster(&posts, &vectors, &CancelFlag::new()).unwrap();
        assert!(outcome.stats.windows > 2);
        assert_eq!(outcome.drafts.len(), 1);
        assert_eq!(outcome.drafts[0].members.len(), 12);
        assert_eq!(outcome.drafts[0].created_at, base());
        assert_eq!(outcome.drafts[0].last_post_at, base() + Duration::hours(220));
    }

    #[test]
    fn same_topic_far_apart_in_time_stays_separate() {
        let posts = vec![post(0), post(1), post(400), post(401)];
        let vectors: Vec<Embedding> = (0..4).map(|_| vec2(1.0, 0.0)).collect();
        let outcome = clusterer().cluster(&posts, &vectors, &CancelFlag::new()).unwrap();
        assert_eq!(member_sets(&outcome), vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn every_post_lands_in_exactly_one_cluster() {
        let posts: Vec<Post> = (0..40).map(|i| post(i * 7)).collect();
        let vectors: Vec<Embedding> = (0..40)
            .map(|i| match i % 3 {
                0 => vec2(1.0, 0.0),
                1 => vec2(0.0, 1.0),
                _ => vec2(-1.0, 0.2),
            })
            .collect();
        let outcome = clusterer().cluster(&posts, &vectors, &CancelFlag::new()).unwrap();
        let mut seen: Vec<usize> = outcome
            .drafts
            .iter()
            .flat_map(|d| d.members.iter().map(|p| p.0))
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn input_order_does_not_change_grouping() {
        let posts = vec![post(5), post(0), post(3)];
        let vectors = vec![vec2(1.0, 0.0), vec2(1.0, 0.05), vec2(0.0, 1.0)];
        let outcome = clusterer().cluster(&posts, &vectors, &CancelFlag::new()).unwrap();
        assert_eq!(member_sets(&outcome), vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn cancellation_stops_between_windows() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result = clusterer().cluster(&[post(0)], &[vec2(1.0, 0.0)], &cancel);
        assert!(matches!(result, Err(RadarError::Cancelled)));
    }

    #[tokio::test]
    async fn concurrent_and_sequential_agree() {
        let posts: Vec<Post> = (0..30).map(|i| post(i * 11)).collect();
        let vectors: Vec<Embedding> = (0..30)
            .map(|i| if i % 2 == 0 { vec2(1.0, 0.0) } else { vec2(0.1, 1.0) })
            .collect();
        let c = clusterer();
        let sequential = c.cluster(&posts, &vectors, &CancelFlag::new()).unwrap();
        let concurrent = c
            .cluster_concurrent(&posts, &vectors, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(sequential.drafts, concurrent.drafts);
        assert_eq!(sequential.stats, concurrent.stats);
    }
}
