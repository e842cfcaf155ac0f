use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use radar_common::{Cluster, ClusterId, Post, TrendEntry};

use crate::momentum::bucket_start;

/// Cluster × time-bucket post counts for one run, the shape a heatmap or stacked
/// timeline needs. Rows follow emerging-trend order; columns cover the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActivityMatrix {
    pub cluster_ids: Vec<ClusterId>,
    pub buckets: Vec<DateTime<Utc>>,
    /// `counts[row][column]`.
    pub counts: Vec<Vec<u32>>,
    pub scores: Vec<f64>,
}

impl ActivityMatrix {
    pub fn build(
        trends: &[TrendEntry],
        clusters: &[Cluster],
        posts: &[Post],
        bucket_hours: i64,
    ) -> Self {
        let buckets = span_buckets(posts, bucket_hours);
        let column: HashMap<DateTime<Utc>, usize> =
            buckets.iter().enumerate().map(|(i, b)| (*b, i)).collect();
        let by_id: HashMap<ClusterId, &Cluster> = clusters.iter().map(|c| (c.id, c)).collect();

        let mut cluster_ids = Vec::with_capacity(trends.len());
        let mut counts = Vec::with_capacity(trends.len());
        let mut scores = Vec::with_capacity(trends.len());
        for trend in trends {
            let Some(cluster) = by_id.get(&trend.cluster_id) else {
                continue;
            };
            let mut row = vec![0u32; buckets.len()];
            for id in &cluster.member_post_ids {
                let Some(post) = posts.get(id.0) else { continue };
                if let Some(&col) = column.get(&bucket_start(post.timestamp, bucket_hours)) {
                    row[col] += 1;
                }
            }
            cluster_ids.push(trend.cluster_id);
            counts.push(row);
            scores.push(trend.score);
        }

        Self {
            cluster_ids,
            buckets,
            counts,
            scores,
        }
    }

    pub fn row(&self, cluster_id: ClusterId) -> Option<&[u32]> {
        self.cluster_ids
            .iter()
            .position(|id| *id == cluster_id)
            .map(|i| self.counts[i].as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.cluster_ids.is_empty()
    }
}

/// Every bucket from the earliest to the latest post, gaps included.
fn span_buckets(posts: &[Post], bucket_hours: i64) -> Vec<DateTime<Utc>> {
    let (Some(first), Some(last)) = (
        posts.iter().map(|p| p.timestamp).min(),
        posts.iter().map(|p| p.timestamp).max(),
    ) else {
        return Vec::new();
    };
    let width = Duration::hours(bucket_hours.max(1));
    let end = bucket_start(last, bucket_hours);
    let mut buckets = Vec::new();
    let mut cursor = bucket_start(first, bucket_hours);
    while cursor <= end {
        buckets.push(cursor);
        cursor += width;
    }
    buckets
}
