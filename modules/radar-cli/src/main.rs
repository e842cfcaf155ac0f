//! `radar`: batch narrative analysis from the command line.
//!
//! `analyze` reads a post table (CSV with `text`, `Timestamp`, `URL`, `Source`), runs one
//! analysis, prints the emerging trends and writes the flat threat report. `show` prints
//! the same view from a precomputed threat report.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use radar_common::{load_config, ClusterId, EngineConfig, RadarError, RawTable, Report, Tier};
use radar_engine::{
    read_csv, record_schema, write_csv, AnalysisSession, Analyzer, CancelFlag, ClusterRecord,
};

#[derive(Parser)]
#[command(name = "radar")]
#[command(about = "Narrative clustering and momentum scoring for social-media posts")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a post table and write the threat report
    Analyze {
        /// Input CSV with text, Timestamp, URL and Source columns
        input: PathBuf,

        /// Engine configuration (TOML). RADAR_* variables override it.
        #[arg(short, long, env = "RADAR_CONFIG")]
        config: Option<PathBuf>,

        /// Where to write the flat report CSV
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Resume from a session snapshot
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Save the session snapshot after the run
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Write the cluster × time activity matrix as JSON
        #[arg(long)]
        activity: Option<PathBuf>,

        /// Print the full report for these clusters
        #[arg(long = "report")]
        reports: Vec<ClusterId>,

        /// Rows to show in the trend table
        #[arg(long, default_value_t = 20)]
        top: usize,
    },

    /// Show trends and tiers from a precomputed threat report
    Show {
        /// Threat report CSV in the flat record schema
        input: PathBuf,

        /// Print the summary and URLs for these clusters
        #[arg(long = "report")]
        reports: Vec<ClusterId>,

        /// Rows to show in the trend table
        #[arg(long, default_value_t = 20)]
        top: usize,
    },

    /// Print the JSON schema of the flat report record
    Schema,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.json_logs) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(2);
    }

    if let Err(e) = run(cli.command).await {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("radar=info".parse()?);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Analyze {
            input,
            config,
            output,
            resume,
            snapshot,
            activity,
            reports,
            top,
        } => {
            cmd_analyze(AnalyzeArgs {
                input,
                config,
                output,
                resume,
                snapshot,
                activity,
                reports,
                top,
            })
            .await
        }
        Commands::Show {
            input,
            reports,
            top,
        } => cmd_show(&input, &reports, top),
        Commands::Schema => {
            println!("{}", serde_json::to_string_pretty(&record_schema())?);
            Ok(())
        }
    }
}

struct AnalyzeArgs {
    input: PathBuf,
    config: Option<PathBuf>,
    output: Option<PathBuf>,
    resume: Option<PathBuf>,
    snapshot: Option<PathBuf>,
    activity: Option<PathBuf>,
    reports: Vec<ClusterId>,
    top: usize,
}

async fn cmd_analyze(args: AnalyzeArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    config.apply_env()?;
    config.log_redacted();

    let analyzer = Analyzer::new(config)?;
    let session = AnalysisSession::new();
    if let Some(path) = &args.resume {
        session.load_snapshot(path).await?;
    }

    let table = read_table(&args.input)?;
    info!(rows = table.len(), input = %args.input.display(), "Input loaded");

    let cancel = CancelFlag::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let run = analyzer.analyze(&session, &table, &cancel).await?;
    info!("{}", run.stats);

    print_trend_header();
    for trend in run.trends.iter().take(args.top) {
        let Some(state) = session.momentum_state(trend.cluster_id).await else {
            continue;
        };
        let tier = analyzer.tier(trend.score)?;
        print_trend_row(
            trend.cluster_id,
            trend.score,
            state.unique_sources(),
            state.last_update,
            tier,
        );
    }

    for id in &args.reports {
        print_report(&analyzer.report(&session, &run, *id).await?);
    }

    if let Some(path) = &args.activity {
        let matrix = analyzer.activity_matrix(&session, &run).await;
        let json = serde_json::to_string_pretty(&*matrix)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write activity matrix {}", path.display()))?;
        info!(
            clusters = matrix.cluster_ids.len(),
            buckets = matrix.buckets.len(),
            output = %path.display(),
            "Activity matrix written"
        );
    }

    if let Some(path) = &args.output {
        let records = analyzer.export(&session, &run).await?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        write_csv(file, &records)?;
        info!(records = records.len(), output = %path.display(), "Threat report written");
    }

    if let Some(path) = &args.snapshot {
        session.save_snapshot(path).await?;
        info!(snapshot = %path.display(), "Session snapshot saved");
    }
    Ok(())
}

fn cmd_show(input: &Path, reports: &[ClusterId], top: usize) -> Result<()> {
    let records = load_records(input)?;
    info!(records = records.len(), input = %input.display(), "Threat report loaded");

    print_trend_header();
    for record in records.iter().take(top) {
        print_trend_row(
            record.cluster_id,
            record.momentum_score,
            record.unique_sources,
            record.last_updated,
            record.tier()?,
        );
    }

    for id in reports {
        let record = records
            .iter()
            .find(|r| r.cluster_id == *id)
            .ok_or(RadarError::UnknownCluster(*id))?;
        print_report(&record.report());
    }
    Ok(())
}

/// Precomputed records in trend order: score, then sources, then first detection.
fn load_records(path: &Path) -> Result<Vec<ClusterRecord>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open report {}", path.display()))?;
    let mut records = read_csv(file)
        .with_context(|| format!("Failed to read report {}", path.display()))?;
    records.sort_by(|a, b| {
        b.momentum_score
            .total_cmp(&a.momentum_score)
            .then_with(|| b.unique_sources.cmp(&a.unique_sources))
            .then_with(|| a.first_detected.cmp(&b.first_detected))
            .then_with(|| a.cluster_id.cmp(&b.cluster_id))
    });
    Ok(records)
}

fn print_trend_header() {
    println!(
        "{:>8}  {:>9}  {:>7}  {:<16}  {}",
        "Cluster", "Momentum", "Sources", "Last Active", "Tier"
    );
}

fn print_trend_row(
    cluster_id: ClusterId,
    score: f64,
    sources: usize,
    last_active: DateTime<Utc>,
    tier: Tier,
) {
    println!(
        "{:>8}  {:>9.2}  {:>7}  {:<16}  {}",
        cluster_id,
        score,
        sources,
        last_active.format("%Y-%m-%d %H:%M"),
        tier.short_name(),
    );
}

fn print_report(report: &Report) {
    println!(
        "\n#### Cluster {} Analysis\n{}",
        report.cluster_id, report.narrative_text
    );
    for (i, text) in report.sample_texts.iter().enumerate() {
        println!("  {}. {}", i + 1, text);
    }
    for url in &report.sample_urls {
        println!("  - {url}");
    }
}

/// Load a delimited table. Short rows are kept; the normalizer reads missing cells
/// as empty.
fn read_table(path: &Path) -> Result<RawTable> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open input {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("Failed to read header of {}", path.display()))?
        .clone();

    let mut table = RawTable::new(headers.iter().map(|h| h.trim_start_matches('\u{feff}')));
    for (i, record) in reader.records().enumerate() {
        let record =
            record.with_context(|| format!("Malformed row {} in {}", i + 1, path.display()))?;
        table.push_row(record.iter());
    }
    Ok(table)
}
