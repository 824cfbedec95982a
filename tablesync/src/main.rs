//! Replication and analytics load tool.
//!
//! Copies MySQL tables into an exact replica, then loads them into a
//! PostgreSQL analytics store in full or incrementally.
//!
//! # Guarantees
//! - The source database is only read
//! - No credentials are logged
//! - The exit status is non-zero whenever any table failed

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tablesync_core::{
    PipelineConfig, TableImportance, logging::init_logging, pipeline::Pipeline,
};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "tablesync")]
#[command(about = "Replicate MySQL tables and load them into PostgreSQL")]
#[command(version)]
#[command(long_about = "
tablesync - schema-aware replication and incremental loading

Tables are copied from the source MySQL database into an exact replica,
verified, and loaded into a PostgreSQL analytics store. Structural changes
are detected through fingerprints and force a full rebuild.

Database URLs may be overridden with TABLESYNC_SOURCE_URL,
TABLESYNC_REPLICATION_URL and TABLESYNC_ANALYTICS_URL.

EXAMPLES:
  tablesync sync
  tablesync sync --tier critical --force-full
  tablesync sync --table patient
  tablesync discover
  tablesync fingerprint patient
")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    /// Configuration file
    #[arg(
        short,
        long,
        env = "TABLESYNC_CONFIG",
        default_value = "tablesync.json",
        global = true,
        help = "Pipeline configuration file (JSON)"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replicate and load configured tables
    Sync(SyncArgs),
    /// List source tables with fingerprints and sizes
    Discover,
    /// Test all three database connections
    Check,
    /// Print the structure fingerprint of a source table
    Fingerprint(FingerprintArgs),
}

#[derive(Args)]
struct SyncArgs {
    /// Force full replication and load
    #[arg(long, help = "Rebuild replicas and reload every row")]
    force_full: bool,

    /// Only process one tier
    #[arg(long, conflicts_with = "table", help = "Only process this importance tier")]
    tier: Option<TableImportance>,

    /// Only process one table
    #[arg(long, help = "Only process this configured table")]
    table: Option<String>,
}

#[derive(Args)]
struct FingerprintArgs {
    /// Source table name
    table: String,
}

#[derive(Args)]
struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        global = true,
        help = "Increase verbosity (-v, -vv)"
    )]
    verbose: u8,

    /// Suppress output
    #[arg(short, long, global = true, help = "Suppress all output except errors")]
    quiet: bool,

    /// JSON log lines
    #[arg(long, global = true, help = "Write logs as JSON lines")]
    json_logs: bool,
}

/// One row of `discover` output.
#[derive(Serialize)]
struct DiscoveredTable {
    table: String,
    configured: bool,
    fingerprint: Option<String>,
    rows: u64,
    total_mb: f64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.global.verbose, cli.global.quiet, cli.global.json_logs) {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(&cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Runs the selected command; `Ok(false)` means some table failed.
async fn run(cli: &Cli) -> anyhow::Result<bool> {
    let config = PipelineConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let pipeline = Pipeline::new(config).context("Failed to build pipeline")?;

    let result = match &cli.command {
        Command::Sync(args) => sync(&pipeline, args).await,
        Command::Discover => discover(&pipeline).await,
        Command::Check => check(&pipeline).await,
        Command::Fingerprint(args) => fingerprint(&pipeline, &args.table).await,
    };
    pipeline.close().await;
    result
}

async fn sync(pipeline: &Pipeline, args: &SyncArgs) -> anyhow::Result<bool> {
    if let Some(table) = &args.table {
        let outcome = pipeline.run_table(table, args.force_full).await?;
        print_json(&outcome)?;
        return Ok(outcome.success);
    }
    if let Some(tier) = args.tier {
        let result = pipeline.run_tier(tier, args.force_full).await?;
        print_json(&result)?;
        return Ok(result.is_success());
    }

    let report = pipeline.run(args.force_full).await?;
    info!(
        "Run {} finished in {:.1}s with {} failed table(s)",
        report.run_id,
        report.duration_secs,
        report.failed_count()
    );
    print_json(&report)?;
    Ok(report.is_success())
}

async fn discover(pipeline: &Pipeline) -> anyhow::Result<bool> {
    let mut discovery = pipeline.source_discovery();
    let tables = discovery.discover_all_tables().await;
    if tables.is_empty() {
        anyhow::bail!("No source tables found (or the source could not be listed)");
    }

    let mut rows = Vec::with_capacity(tables.len());
    for table in tables {
        let fingerprint = match discovery.current_fingerprint(&table).await {
            Ok(fingerprint) => Some(fingerprint),
            Err(e) => {
                error!("Could not fingerprint '{}': {}", table, e);
                None
            }
        };
        let size = discovery.get_table_size_info(&table).await;
        rows.push(DiscoveredTable {
            configured: pipeline.config().tables.contains_key(&table),
            table,
            fingerprint,
            rows: size.row_count,
            total_mb: size.total_mb,
        });
    }
    discovery.manager().close_connection();

    print_json(&rows)?;
    Ok(rows.iter().all(|row| row.fingerprint.is_some()))
}

async fn check(pipeline: &Pipeline) -> anyhow::Result<bool> {
    pipeline
        .factory()
        .test_connections()
        .await
        .context("Connection check failed")?;
    println!("All database connections OK");
    Ok(true)
}

async fn fingerprint(pipeline: &Pipeline, table: &str) -> anyhow::Result<bool> {
    let mut discovery = pipeline.source_discovery();
    let fingerprint = discovery.current_fingerprint(table).await;
    discovery.manager().close_connection();
    println!("{}", fingerprint?);
    Ok(true)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize report")?
    );
    Ok(())
}
