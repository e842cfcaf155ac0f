//! Post ingestion: validates the raw table and turns rows into [`Post`]s.
//!
//! Missing columns fail the whole batch. Individual bad rows are dropped with a
//! reason, and the batch is rejected if too many of them go.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tracing::{info, warn};

use radar_common::{Post, RadarError, RawTable, REQUIRED_COLUMNS};

/// Why a row was excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    EmptyText,
    UnparseableTimestamp(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::EmptyText => write!(f, "empty text"),
            DropReason::UnparseableTimestamp(raw) => {
                write!(f, "unparseable timestamp {raw:?}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedRow {
    /// Zero-based data row index (header excluded).
    pub row: usize,
    pub reason: DropReason,
}

/// Posts in original row order plus the rows that did not make it.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub posts: Vec<Post>,
    pub dropped: Vec<DroppedRow>,
}

impl NormalizedBatch {
    pub fn total_rows(&self) -> usize {
        self.posts.len() + self.dropped.len()
    }
}

/// Validate and normalize a raw table.
pub fn normalize(table: &RawTable, max_exclusion_rate: f64) -> Result<NormalizedBatch, RadarError> {
    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|col| table.column_index(col).is_none())
        .map(|col| col.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(RadarError::Schema { missing });
    }

    // Presence checked above.
    let col = |name: &str| table.column_index(name).unwrap_or_default();
    let (text_col, ts_col, url_col, source_col) =
        (col("text"), col("Timestamp"), col("URL"), col("Source"));

    let mut batch = NormalizedBatch::default();
    for row in 0..table.len() {
        let text = table.cell(row, text_col).trim();
        if text.is_empty() {
            batch.dropped.push(DroppedRow {
                row,
                reason: DropReason::EmptyText,
            });
            continue;
        }
        let raw_ts = table.cell(row, ts_col);
        let Some(timestamp) = parse_timestamp(raw_ts) else {
            batch.dropped.push(DroppedRow {
                row,
                reason: DropReason::UnparseableTimestamp(raw_ts.to_string()),
            });
            continue;
        };
        batch.posts.push(Post {
            text: text.to_string(),
            timestamp,
            url: table.cell(row, url_col).trim().to_string(),
            source: table.cell(row, source_col).trim().to_string(),
        });
    }

    let total = batch.total_rows();
    let dropped = batch.dropped.len();
    if total > 0 && dropped as f64 / total as f64 > max_exclusion_rate {
        return Err(RadarError::DataQuality {
            dropped,
            total,
            max_rate: max_exclusion_rate,
        });
    }

    if dropped > 0 {
        warn!(dropped, total, "Dropped unusable rows during ingestion");
        for d in batch.dropped.iter().take(10) {
            warn!(row = d.row, reason = %d.reason, "Row dropped");
        }
    }
    info!(posts = batch.posts.len(), dropped, "Normalized input table");
    Ok(batch)
}

const NAIVE_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

/// Parse ISO-8601 / RFC 3339 and common locale layouts. Values without an
/// offset are read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(stripped) = raw.strip_suffix(" UTC").or_else(|| raw.strip_suffix('Z')) {
        if let Some(dt) = parse_naive(stripped) {
            return Some(dt);
        }
    }
    parse_naive(raw)
}

fn parse_naive(raw: &str) -> Option<DateTime<Utc>> {
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}
