//! Drift CLI - Inspect the local mirror from the command line
//!
//! Read-only views over the mirror database plus initialization. The
//! engine itself lives in drift-core; rendering here stays thin.

use std::env;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use drift_core::db::{Database, MirrorStore};
use drift_core::models::{MirrorRecord, SyncLogEntry, SyncLogSummary};
use serde::Serialize;
use thiserror::Error;

#[derive(Parser)]
#[command(name = "drift")]
#[command(about = "Inspect a Drift mirror database")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional path to local database file
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and migrate the mirror database
    Init,
    /// List children of a parent path
    Ls {
        /// Parent path, e.g. "/" or "/photos"
        parent: String,
        /// Only items modified within the last N hours
        #[arg(long, value_name = "HOURS")]
        since: Option<i64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Search items by name within a parent path
    Search {
        /// Parent path to search under
        parent: String,
        /// Name substring
        needle: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show recent sync history
    Log {
        /// Number of rows to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Aggregate sync counts over a recent window
    Stats {
        /// Window size in hours
        #[arg(long, default_value = "24")]
        hours: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] drift_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Search needle cannot be empty")]
    EmptySearchNeedle,
    #[error("Hours must be positive, got {0}")]
    NonPositiveHours(i64),
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("drift=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Init => run_init(&db_path).await?,
        Commands::Ls {
            parent,
            since,
            json,
        } => run_ls(&parent, since, json, &db_path).await?,
        Commands::Search {
            parent,
            needle,
            json,
        } => run_search(&parent, &needle, json, &db_path).await?,
        Commands::Log { limit, json } => run_log(limit, json, &db_path).await?,
        Commands::Stats { hours, json } => run_stats(hours, json, &db_path).await?,
    }

    Ok(())
}

async fn run_init(db_path: &Path) -> Result<(), CliError> {
    open_database(db_path).await?;
    println!("{}", db_path.display());
    Ok(())
}

async fn run_ls(
    parent: &str,
    since_hours: Option<i64>,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let since = since_hours.map(hours_to_cutoff).transpose()?;
    let records = list_children(parent, since, db_path).await?;
    print_records(&records, as_json)
}

async fn run_search(
    parent: &str,
    needle: &str,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let needle = needle.trim();
    if needle.is_empty() {
        return Err(CliError::EmptySearchNeedle);
    }

    let db = open_database(db_path).await?;
    let store = MirrorStore::new(db.connection().clone());
    let records = store.search(parent, needle).await?;
    print_records(&records, as_json)
}

async fn run_log(limit: usize, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let store = MirrorStore::new(db.connection().clone());
    let entries = store.recent_log(limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for line in format_log_lines(&entries) {
            println!("{line}");
        }
    }
    Ok(())
}

async fn run_stats(hours: i64, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    if hours <= 0 {
        return Err(CliError::NonPositiveHours(hours));
    }

    let db = open_database(db_path).await?;
    let store = MirrorStore::new(db.connection().clone());
    let summary = store.log_summary(Duration::hours(hours)).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", format_summary(&summary, hours));
    }
    Ok(())
}

async fn list_children(
    parent: &str,
    since: Option<DateTime<Utc>>,
    db_path: &Path,
) -> Result<Vec<MirrorRecord>, CliError> {
    let db = open_database(db_path).await?;
    let store = MirrorStore::new(db.connection().clone());
    Ok(store.children(parent, since).await?)
}

fn hours_to_cutoff(hours: i64) -> Result<DateTime<Utc>, CliError> {
    if hours <= 0 {
        return Err(CliError::NonPositiveHours(hours));
    }
    Ok(Utc::now() - Duration::hours(hours))
}

fn print_records(records: &[MirrorRecord], as_json: bool) -> Result<(), CliError> {
    if as_json {
        let items = records
            .iter()
            .map(record_to_list_item)
            .collect::<Vec<RecordListItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for line in format_record_lines(records) {
            println!("{line}");
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct RecordListItem {
    id: String,
    name: String,
    is_folder: bool,
    parent_path: Option<String>,
    downloaded: bool,
    last_modified: String,
    relative_time: String,
}

fn record_to_list_item(record: &MirrorRecord) -> RecordListItem {
    let now_ms = Utc::now().timestamp_millis();
    RecordListItem {
        id: record.id.clone(),
        name: record.name.clone(),
        is_folder: record.is_folder,
        parent_path: record.parent_path.clone(),
        downloaded: record.downloaded,
        last_modified: record.last_modified.to_rfc3339(),
        relative_time: format_relative_time(record.last_modified.timestamp_millis(), now_ms),
    }
}

fn format_record_lines(records: &[MirrorRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let kind = if record.is_folder { 'd' } else { 'f' };
            let mark = if record.downloaded { '*' } else { ' ' };
            let relative_time = format_relative_time(record.last_modified.timestamp_millis(), now_ms);
            format!("{kind} {mark} {:<32}  {relative_time}", record.name)
        })
        .collect()
}

fn format_log_lines(entries: &[SyncLogEntry]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    entries
        .iter()
        .map(|entry| {
            let token = entry.token.as_deref().unwrap_or("-");
            let relative_time = format_relative_time(entry.last_synced.timestamp_millis(), now_ms);
            format!(
                "{:>4}  {:<12}  +{} ~{} -{}  {token}  {relative_time}",
                entry.id, entry.container_id, entry.inserted, entry.updated, entry.deleted,
            )
        })
        .collect()
}

fn format_summary(summary: &SyncLogSummary, hours: i64) -> String {
    format!(
        "last {hours}h: {} runs, +{} ~{} -{}",
        summary.runs, summary.inserted, summary.updated, summary.deleted,
    )
}

fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}

fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("DRIFT_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("drift.db"))
}

async fn open_database(path: &Path) -> Result<Database, CliError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    tracing::debug!(path = %path.display(), "Opening mirror database");
    Ok(Database::open(path).await?)
}
