//! Live results and the flat report schema are interchangeable.

use std::fs::File;

use chrono::{Duration, TimeZone, Utc};
use radar_common::{EngineConfig, RawTable, Tier};
use radar_engine::interchange::{read_csv, write_csv};
use radar_engine::{AnalysisSession, Analyzer, CancelFlag};

fn table() -> RawTable {
    let start = Utc.with_ymd_and_hms(2025, 3, 31, 6, 0, 0).unwrap();
    let mut t = RawTable::new(["text", "Timestamp", "URL", "Source"]);
    for i in 0..30 {
        t.push_row([
            format!("Fuel convoy hijacked on the eastern corridor, drivers missing #{i}"),
            (start + Duration::minutes(4 * i)).to_rfc3339(),
            format!("https://wire.example/{}", i % 4),
            format!("channel_{}", i % 6),
        ]);
    }
    t.push_row([
        "Community radio launches evening poetry hour".to_string(),
        start.to_rfc3339(),
        String::new(),
        "radio".to_string(),
    ]);
    t
}

#[tokio::test]
async fn export_round_trips_through_a_csv_file() {
    let analyzer = Analyzer::new(EngineConfig::default()).unwrap();
    let session = AnalysisSession::new();
    let run = analyzer
        .analyze(&session, &table(), &CancelFlag::new())
        .await
        .unwrap();

    let records = analyzer.export(&session, &run).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].cluster_id, run.trends[0].cluster_id);
    assert_eq!(records[0].total_posts, 30);
    assert_eq!(records[0].unique_sources, 6);
    assert_eq!(records[0].urls().len(), 4);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("threat_report.csv");
    write_csv(File::create(&path).unwrap(), &records).unwrap();
    let loaded = read_csv(File::open(&path).unwrap()).unwrap();
    assert_eq!(loaded, records);

    for (record, trend) in loaded.into_iter().zip(&run.trends) {
        let (loaded_trend, report, tier) = record.into_parts().unwrap();
        assert_eq!(loaded_trend, *trend);
        assert_eq!(tier, analyzer.tier(trend.score).unwrap());
        let live = analyzer.report(&session, &run, trend.cluster_id).await.unwrap();
        assert_eq!(report.narrative_text, live.narrative_text);
        assert_eq!(report.sample_urls, live.sample_urls);
    }
}

#[tokio::test]
async fn precomputed_records_rank_like_live_ones() {
    let analyzer = Analyzer::new(EngineConfig::default()).unwrap();
    let session = AnalysisSession::new();
    let run = analyzer
        .analyze(&session, &table(), &CancelFlag::new())
        .await
        .unwrap();
    let records = analyzer.export(&session, &run).await.unwrap();

    let tiers: Vec<Tier> = records.iter().map(|r| r.tier().unwrap()).collect();
    assert!(tiers.windows(2).all(|w| w[0] >= w[1]));
    assert_eq!(tiers[1], Tier::AmbientNoise);
    assert!(records[1].all_urls.is_empty());
}
