//! execsync: reconcile an execution-system tree with the record store.
//!
//! Prints a JSON run report on stdout; logs go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use execsync::{Config, ConfigError, JsonFileStore, parse_override, sync_tree};
use execsync_core::detect::Direction;
use execsync_core::record::RecordKey;
use execsync_core::reconcile::{RunReport, SyncError, SyncOptions};

const EXIT_RECORD_ERRORS: u8 = 1;
const EXIT_CONFIGURATION: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "execsync")]
#[command(about = "Bidirectional sync between an execution-system tree and the record store")]
struct Args {
    /// Root of the execution-system tree
    #[arg(short, long)]
    source: PathBuf,

    /// Principal whose records are synced
    #[arg(short, long, env = "EXECSYNC_PRINCIPAL")]
    principal: String,

    /// JSON store file (default: platform data dir)
    #[arg(long, env = "EXECSYNC_STORE")]
    store: Option<String>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Report what would change without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Copy every record present on both sides in one direction
    #[arg(long)]
    force: bool,

    /// Direction used by --force (default: file-to-store)
    #[arg(long, requires = "force")]
    direction: Option<Direction>,

    /// Per-record direction, e.g. projects/learn-rust=store-to-file (repeatable)
    #[arg(long = "override", value_name = "KEY=DIRECTION", value_parser = parse_override)]
    overrides: Vec<(RecordKey, Direction)>,

    /// Records reconciled concurrently
    #[arg(long)]
    workers: Option<usize>,

    /// Stop scheduling new records after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Register the principal in the store if it is missing
    #[arg(long)]
    init_principal: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

async fn run(args: Args) -> Result<RunReport> {
    let config = Config::load(args.config.as_deref())?;
    let store_path = config.store_path(args.store.as_deref())?;
    info!(source = %args.source.display(), store = %store_path.display(), "Starting execsync");

    let store = JsonFileStore::open(store_path.clone())
        .await
        .map_err(SyncError::from)
        .with_context(|| format!("opening store {}", store_path.display()))?;
    if args.init_principal {
        store
            .add_principal(&args.principal)
            .await
            .map_err(SyncError::from)
            .context("registering principal")?;
    }

    let force = args
        .force
        .then(|| args.direction.unwrap_or(Direction::FileToStore));
    let options = SyncOptions {
        dry_run: args.dry_run,
        force,
        overrides: args.overrides.into_iter().collect(),
        workers: args.workers.unwrap_or(config.workers).max(1),
        timeout: args
            .timeout_secs
            .map(std::time::Duration::from_secs)
            .or(config.timeout()),
        retry: config.retry_policy(),
    };

    let report = sync_tree(&args.source, Arc::new(store), &args.principal, &options).await?;
    Ok(report)
}

fn is_configuration_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<ConfigError>().is_some()
            || cause.downcast_ref::<SyncError>().is_some_and(SyncError::is_fatal)
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,execsync=debug,execsync_core=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let report = match run(args).await {
        Ok(report) => report,
        Err(e) => {
            error!("{:#}", e);
            return if is_configuration_error(&e) {
                ExitCode::from(EXIT_CONFIGURATION)
            } else {
                ExitCode::from(EXIT_RECORD_ERRORS)
            };
        }
    };

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            error!("Failed to serialize report: {}", e);
            return ExitCode::from(EXIT_RECORD_ERRORS);
        }
    }

    if report.timed_out {
        warn!(unprocessed = report.unprocessed, "Timed out; remaining records left for the next run");
    }
    if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_RECORD_ERRORS)
    }
}
