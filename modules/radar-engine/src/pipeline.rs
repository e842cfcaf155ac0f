//! End-to-end analysis: normalize → embed → cluster → reconcile ids → momentum → trends.
//!
//! The [`Analyzer`] holds the stateless stages and the embedding cache; everything that
//! must survive between runs lives in the [`AnalysisSession`] passed to each call.

use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use radar_common::{
    Cluster, ClusterId, EngineConfig, MomentumState, Post, PostId, RadarError, RawTable, Report,
    TextEmbedder, Tier, TrendEntry,
};

use crate::activity::ActivityMatrix;
use crate::cancel::CancelFlag;
use crate::clusterer::{ClusterStats, Clusterer};
use crate::embedder::build_embedder;
use crate::embedding_store::{EmbeddingStats, EmbeddingStore};
use crate::interchange::ClusterRecord;
use crate::momentum::MomentumTracker;
use crate::normalizer::{normalize, DroppedRow};
use crate::report::ReportSynthesizer;
use crate::session::{AnalysisSession, ReconcileStats, SessionState};
use crate::tier::TierClassifier;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AnalysisStats {
    pub rows: usize,
    pub posts: usize,
    pub dropped: usize,
    pub embeddings: EmbeddingStats,
    pub clustering: ClusterStats,
    pub ids: ReconcileStats,
}

impl fmt::Display for AnalysisStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Analysis: {} rows, {} posts, {} dropped, {} embedded, {} cache hits, \
             {} clusters ({} low-confidence), {} ids kept, {} ids issued",
            self.rows,
            self.posts,
            self.dropped,
            self.embeddings.computed,
            self.embeddings.hits,
            self.clustering.clusters,
            self.clustering.low_confidence,
            self.ids.by_members + self.ids.by_centroid,
            self.ids.issued,
        )
    }
}

/// Result of one analysis trigger.
#[derive(Debug, Clone)]
pub struct AnalysisRun {
    /// Content fingerprint of the run's clusters and scores.
    pub fingerprint: String,
    pub posts: Vec<Post>,
    /// Cluster id of every post, indexed like `posts`.
    pub labels: Vec<ClusterId>,
    /// Ordered by first post time.
    pub clusters: Vec<Cluster>,
    pub dropped: Vec<DroppedRow>,
    /// Ranked emerging trends for this run's clusters.
    pub trends: Vec<TrendEntry>,
    pub stats: AnalysisStats,
}

impl AnalysisRun {
    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.id == id)
    }

    pub fn label_of(&self, post: PostId) -> Option<ClusterId> {
        self.labels.get(post.0).copied()
    }

    pub fn low_confidence(&self) -> Vec<ClusterId> {
        self.clusters
            .iter()
            .filter(|c| c.low_confidence)
            .map(|c| c.id)
            .collect()
    }

    pub fn score_of(&self, id: ClusterId) -> Option<f64> {
        self.trends
            .iter()
            .find(|t| t.cluster_id == id)
            .map(|t| t.score)
    }
}

pub struct Analyzer {
    config: EngineConfig,
    store: EmbeddingStore,
    clusterer: Clusterer,
    tracker: MomentumTracker,
    tiers: TierClassifier,
    reports: ReportSynthesizer,
}

impl Analyzer {
    /// Validate the configuration and build the configured embedding backend.
    pub fn new(config: EngineConfig) -> Result<Self, RadarError> {
        config.validate()?;
        let embedder = build_embedder(&config.embedding)?;
        Ok(Self::with_embedder(config, embedder))
    }

    pub fn with_embedder(config: EngineConfig, embedder: Arc<dyn TextEmbedder>) -> Self {
        Self {
            store: EmbeddingStore::new(embedder, config.embedding.batch_size),
            clusterer: Clusterer::new(config.clustering.clone()),
            tracker: MomentumTracker::new(config.momentum.clone()),
            tiers: TierClassifier::new(config.tiers),
            reports: ReportSynthesizer::new(config.momentum.clone()),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn embedding_store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub async fn analyze(
        &self,
        session: &AnalysisSession,
        table: &RawTable,
        cancel: &CancelFlag,
    ) -> Result<AnalysisRun, RadarError> {
        let batch = normalize(table, self.config.ingest.max_exclusion_rate)?;
        cancel.check()?;

        let embedded = self.store.embed_posts(&batch.posts, cancel).await?;
        let outcome = self
            .clusterer
            .cluster_concurrent(&batch.posts, &embedded.vectors, cancel)
            .await?;
        cancel.check()?;

        // Past this point the run commits: ids and momentum change together.
        let mut state = session.lock().await;
        let (ids, id_stats) =
            state
                .registry
                .reconcile(&outcome.drafts, &batch.posts, &self.config.clustering);
        let clusters: Vec<Cluster> = outcome
            .drafts
            .iter()
            .zip(&ids)
            .map(|(draft, id)| Cluster {
                id: *id,
                member_post_ids: draft.members.clone(),
                created_at: draft.created_at,
                last_post_at: draft.last_post_at,
                low_confidence: draft.low_confidence,
            })
            .collect();
        let trends = self
            .tracker
            .update(&mut state.momentum, &clusters, &batch.posts);
        state.runs += 1;
        drop(state);

        let labels = label_posts(batch.posts.len(), &clusters)?;
        let low_confidence = clusters.iter().filter(|c| c.low_confidence).count();
        if low_confidence > 0 {
            warn!(
                low_confidence,
                min_size = self.config.clustering.min_cluster_size,
                "Low-confidence clusters retained"
            );
        }

        let stats = AnalysisStats {
            rows: batch.total_rows(),
            posts: batch.posts.len(),
            dropped: batch.dropped.len(),
            embeddings: embedded.stats,
            clustering: outcome.stats,
            ids: id_stats,
        };
        info!(
            session_id = %session.id(),
            posts = stats.posts,
            clusters = clusters.len(),
            top_score = trends.first().map(|t| t.score).unwrap_or(0.0),
            "Analysis complete"
        );

        Ok(AnalysisRun {
            fingerprint: run_fingerprint(&batch.posts, &clusters, &trends),
            posts: batch.posts,
            labels,
            clusters,
            dropped: batch.dropped,
            trends,
            stats,
        })
    }

    pub fn tier(&self, score: f64) -> Result<Tier, RadarError> {
        self.tiers.classify(score)
    }

    /// Report for one cluster of `run`, built against the session's current momentum
    /// state and cached for the session's lifetime.
    pub async fn report(
        &self,
        session: &AnalysisSession,
        run: &AnalysisRun,
        cluster_id: ClusterId,
    ) -> Result<Report, RadarError> {
        let mut state = session.lock().await;
        let (report, _, _) = self.report_locked(&mut state, run, cluster_id)?;
        Ok(report)
    }

    /// Cluster × bucket counts for `run`. The session keeps the latest run's matrix, so
    /// repeated requests for the same run reuse it.
    pub async fn activity_matrix(
        &self,
        session: &AnalysisSession,
        run: &AnalysisRun,
    ) -> Arc<ActivityMatrix> {
        let mut state = session.lock().await;
        if let Some((fingerprint, matrix)) = &state.matrix {
            if *fingerprint == run.fingerprint {
                return Arc::clone(matrix);
            }
        }
        let matrix = Arc::new(ActivityMatrix::build(
            &run.trends,
            &run.clusters,
            &run.posts,
            self.config.momentum.bucket_hours,
        ));
        state.matrix = Some((run.fingerprint.clone(), Arc::clone(&matrix)));
        matrix
    }

    /// One flat record per cluster of `run`, in trend order.
    pub async fn export(
        &self,
        session: &AnalysisSession,
        run: &AnalysisRun,
    ) -> Result<Vec<ClusterRecord>, RadarError> {
        let mut state = session.lock().await;
        let mut records = Vec::with_capacity(run.trends.len());
        for trend in &run.trends {
            let (report, momentum, tier) = self.report_locked(&mut state, run, trend.cluster_id)?;
            records.push(ClusterRecord::from_live(
                trend.cluster_id,
                &momentum,
                &report,
                tier,
            ));
        }
        info!(records = records.len(), "Export prepared");
        Ok(records)
    }

    fn report_locked(
        &self,
        state: &mut SessionState,
        run: &AnalysisRun,
        cluster_id: ClusterId,
    ) -> Result<(Report, MomentumState, Tier), RadarError> {
        let cluster = run
            .cluster(cluster_id)
            .ok_or(RadarError::UnknownCluster(cluster_id))?;
        let momentum = state
            .momentum
            .get(&cluster_id)
            .cloned()
            .ok_or(RadarError::UnknownCluster(cluster_id))?;
        let tier = self.tier(momentum.current_score)?;

        let key = self.reports.cache_key(cluster, &run.posts, &momentum, tier);
        if let Some((cached_key, cached)) = state.reports.get(&cluster_id) {
            if *cached_key == key {
                return Ok((cached.clone(), momentum, tier));
            }
        }
        let report = self.reports.synthesize(cluster, &run.posts, &momentum, tier);
        state.reports.insert(cluster_id, (key, report.clone()));
        Ok((report, momentum, tier))
    }
}

fn label_posts(post_count: usize, clusters: &[Cluster]) -> Result<Vec<ClusterId>, RadarError> {
    let mut labels: Vec<Option<ClusterId>> = vec![None; post_count];
    for cluster in clusters {
        for post in &cluster.member_post_ids {
            let Some(slot) = labels.get_mut(post.0) else {
                return Err(RadarError::Anyhow(anyhow!("{post} is out of range")));
            };
            if let Some(other) = *slot {
                return Err(RadarError::Anyhow(anyhow!(
                    "{post} assigned to clusters {other} and {}",
                    cluster.id
                )));
            }
            *slot = Some(cluster.id);
        }
    }
    labels
        .into_iter()
        .enumerate()
        .map(|(i, label)| {
            label.ok_or_else(|| RadarError::Anyhow(anyhow!("{} has no cluster", PostId(i))))
        })
        .collect()
}

fn run_fingerprint(posts: &[Post], clusters: &[Cluster], trends: &[TrendEntry]) -> String {
    let mut hasher = Sha256::new();
    for post in posts {
        hasher.update(post.fingerprint().as_bytes());
    }
    for cluster in clusters {
        hasher.update(cluster.id.to_le_bytes());
        for member in &cluster.member_post_ids {
            hasher.update(member.0.to_le_bytes());
        }
    }
    for trend in trends {
        hasher.update(trend.cluster_id.to_le_bytes());
        hasher.update(trend.score.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}
