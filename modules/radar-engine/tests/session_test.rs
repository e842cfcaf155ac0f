//! Session behaviour across runs: id stability, monotonic momentum state,
//! serialised concurrent runs, and snapshot/restore.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use radar_common::{EngineConfig, RawTable};
use radar_engine::{AnalysisSession, Analyzer, CancelFlag};

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, d, 0, 0, 0).unwrap()
}

/// One narrative, `range` selects the posts, two minutes apart from `start`.
fn narrative(range: std::ops::Range<usize>, start: DateTime<Utc>, source: &str) -> RawTable {
    let mut t = RawTable::new(["text", "Timestamp", "URL", "Source"]);
    for (k, i) in range.enumerate() {
        t.push_row([
            format!("Ballot boxes found burned near the capital stadium #{i}"),
            (start + Duration::minutes(2 * k as i64)).to_rfc3339(),
            format!("https://claims.example/{i}"),
            format!("{source}_{}", i % 3),
        ]);
    }
    t
}

fn analyzer() -> Analyzer {
    Analyzer::new(EngineConfig::default()).unwrap()
}

// =========================================================================
// Monotonic state
// =========================================================================

#[tokio::test]
async fn later_data_extends_the_same_cluster() {
    let analyzer = analyzer();
    let session = AnalysisSession::new();
    let cancel = CancelFlag::new();

    let first = analyzer
        .analyze(&session, &narrative(0..12, day(3), "early"), &cancel)
        .await
        .unwrap();
    let id = first.trends[0].cluster_id;
    let before = session.momentum_state(id).await.unwrap();

    // Fresh posts, fresh accounts, next day.
    let second = analyzer
        .analyze(&session, &narrative(50..62, day(4), "late"), &cancel)
        .await
        .unwrap();
    assert_eq!(second.trends[0].cluster_id, id);
    assert_eq!(second.stats.ids.by_centroid, 1);

    let after = session.momentum_state(id).await.unwrap();
    assert!(after.sources.is_superset(&before.sources));
    assert_eq!(after.unique_sources(), 6);
    assert!(after.last_update > before.last_update);
    assert_eq!(after.first_detected, before.first_detected);
    assert_eq!(after.post_count_history.len(), 2);
    assert!(after.current_score >= 0.0);
}

#[tokio::test]
async fn replaying_older_data_never_moves_state_backward() {
    let analyzer = analyzer();
    let session = AnalysisSession::new();
    let cancel = CancelFlag::new();

    let early = narrative(0..12, day(3), "early");
    let late = narrative(50..62, day(4), "late");
    analyzer.analyze(&session, &early, &cancel).await.unwrap();
    let run = analyzer.analyze(&session, &late, &cancel).await.unwrap();
    let id = run.trends[0].cluster_id;
    let latest = session.momentum_state(id).await.unwrap();

    let replay = analyzer.analyze(&session, &early, &cancel).await.unwrap();
    assert_eq!(replay.trends[0].cluster_id, id);

    let after = session.momentum_state(id).await.unwrap();
    assert_eq!(after.last_update, latest.last_update);
    assert_eq!(after.sources, latest.sources);
    assert_eq!(after.post_count_history, latest.post_count_history);
    assert_eq!(after.current_score, latest.current_score);
}

#[tokio::test]
async fn posts_split_across_runs_in_one_bucket_all_count() {
    let analyzer = analyzer();
    let session = AnalysisSession::new();
    let cancel = CancelFlag::new();

    let first_half = narrative(0..10, day(3), "a");
    let second_half = narrative(10..20, day(3) + Duration::minutes(30), "b");
    let first = analyzer.analyze(&session, &first_half, &cancel).await.unwrap();
    let id = first.trends[0].cluster_id;
    let second = analyzer.analyze(&session, &second_half, &cancel).await.unwrap();
    assert_eq!(second.trends[0].cluster_id, id);

    let state = session.momentum_state(id).await.unwrap();
    assert_eq!(state.post_count_history, vec![(day(3), 20)]);
    assert_eq!(state.unique_sources(), 6);
    assert!(state.total_posts() >= state.unique_sources() as u64);

    // Reading the first half again adds nothing.
    analyzer.analyze(&session, &first_half, &cancel).await.unwrap();
    let replayed = session.momentum_state(id).await.unwrap();
    assert_eq!(replayed.post_count_history, vec![(day(3), 20)]);
    assert_eq!(replayed.current_score, state.current_score);
}

#[tokio::test]
async fn reset_starts_over() {
    let analyzer = analyzer();
    let session = AnalysisSession::new();
    let cancel = CancelFlag::new();
    let table = narrative(0..5, day(3), "a");
    analyzer.analyze(&session, &table, &cancel).await.unwrap();

    session.reset().await;
    assert!(session.momentum_states().await.is_empty());

    let run = analyzer.analyze(&session, &table, &cancel).await.unwrap();
    assert_eq!(run.trends[0].cluster_id, 0);
    assert_eq!(run.stats.ids.issued, 1);
}

// =========================================================================
// Concurrency
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_on_one_session_agree_on_ids() {
    let analyzer = Arc::new(analyzer());
    let session = Arc::new(AnalysisSession::new());
    let table = Arc::new(narrative(0..20, day(3), "a"));

    let spawn = |analyzer: Arc<Analyzer>, session: Arc<AnalysisSession>, table: Arc<RawTable>| {
        tokio::spawn(async move {
            analyzer
                .analyze(&session, &table, &CancelFlag::new())
                .await
                .unwrap()
        })
    };
    let a = spawn(analyzer.clone(), session.clone(), table.clone());
    let b = spawn(analyzer.clone(), session.clone(), table.clone());
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert_eq!(a.trends, b.trends);
    assert_eq!(session.runs().await, 2);
    assert_eq!(session.momentum_states().await.len(), 1);
}

// =========================================================================
// Snapshot
// =========================================================================

#[tokio::test]
async fn restored_session_keeps_issuing_the_same_ids() {
    let analyzer = analyzer();
    let cancel = CancelFlag::new();
    let original = AnalysisSession::new();
    let table = narrative(0..12, day(3), "a");
    let first = analyzer.analyze(&original, &table, &cancel).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");
    original.save_snapshot(&path).await.unwrap();

    let resumed = AnalysisSession::new();
    resumed.load_snapshot(&path).await.unwrap();
    let again = analyzer.analyze(&resumed, &table, &cancel).await.unwrap();

    assert_eq!(again.trends, first.trends);
    assert_eq!(again.stats.ids.issued, 0);
    assert_eq!(resumed.runs().await, 2);
}
