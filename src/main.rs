use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};

use cmass_backfill::backfill::{backfill_docs, backfill_entries, BackfillOptions};
use cmass_backfill::checkpoint;
use cmass_backfill::migrate::{migrate_docs, MigrateOptions};
use cmass_backfill::models::CostModel;
use cmass_backfill::progress::set_log_only;
use cmass_backfill::roster::{load_roster, RosterSource};
use cmass_backfill::scoring::DEFAULT_THRESHOLD;
use cmass_backfill::store::{VisitStore, MAX_BATCH_WRITES};

#[derive(Parser)]
#[command(name = "cmass-backfill")]
#[command(about = "Backfill missing school regions and flatten visit documents")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Match unmapped school names against the roster and fill regions
    Backfill(BackfillArgs),
    /// Flatten aggregated visit documents into per-subject entries
    Migrate(MigrateArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Target {
    Entries,
    Docs,
    Both,
}

#[derive(Parser)]
struct BackfillArgs {
    /// Visit database
    db: PathBuf,

    /// Roster CSV: a local path or an http(s) URL
    #[arg(long)]
    roster: String,

    /// Apply the planned changes (default is a dry run)
    #[arg(long)]
    apply: bool,

    #[arg(long, value_enum, default_value = "entries")]
    target: Target,

    /// Scorer acceptance cutoff in [0, 1]
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: f64,

    /// Only consider visits on or after this date (YYYY-MM-DD)
    #[arg(long)]
    since: Option<NaiveDate>,

    /// Scope the run to one staff member
    #[arg(long)]
    staff: Option<String>,

    /// Stop after examining this many records
    #[arg(long)]
    scan_limit: Option<usize>,

    #[arg(long, default_value = "500")]
    page_size: usize,

    #[arg(long, default_value_t = MAX_BATCH_WRITES)]
    batch_size: usize,

    #[arg(long, default_value = "backfill_checkpoint.json")]
    checkpoint_file: PathBuf,

    /// Continue from the last checkpoint
    #[arg(long)]
    resume: bool,

    /// Cap on planned changes included in the report
    #[arg(long, default_value = "200")]
    sample_limit: usize,

    /// USD per 100k reads, for the cost estimate
    #[arg(long, default_value = "0.06")]
    price_reads: f64,

    /// USD per 100k writes, for the cost estimate
    #[arg(long, default_value = "0.18")]
    price_writes: f64,

    /// Suppress progress bars for tail-friendly output
    #[arg(long)]
    log_only: bool,

    /// Also write the report JSON to this file
    #[arg(long)]
    stats_file: Option<PathBuf>,
}

#[derive(Parser)]
struct MigrateArgs {
    /// Visit database
    db: PathBuf,

    /// Apply the migration (default is a dry run)
    #[arg(long)]
    apply: bool,

    /// Probe for existing entries before writing
    #[arg(long)]
    idempotent: bool,

    /// Ledger of already-written ids; listed ids skip the probes
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Only migrate visits on or after this date (YYYY-MM-DD)
    #[arg(long)]
    since: Option<NaiveDate>,

    /// Stop after scanning this many documents
    #[arg(long)]
    scan_limit: Option<usize>,

    #[arg(long, default_value = "500")]
    page_size: usize,

    #[arg(long, default_value_t = MAX_BATCH_WRITES)]
    batch_size: usize,

    #[arg(long, default_value = "migrate_checkpoint.json")]
    checkpoint_file: PathBuf,

    /// Continue from the last checkpoint
    #[arg(long)]
    resume: bool,

    /// Cap on would-be entries included in the report
    #[arg(long, default_value = "200")]
    sample_limit: usize,

    /// USD per 100k reads, for the cost estimate
    #[arg(long, default_value = "0.06")]
    price_reads: f64,

    /// USD per 100k writes, for the cost estimate
    #[arg(long, default_value = "0.18")]
    price_writes: f64,

    /// Suppress progress bars for tail-friendly output
    #[arg(long)]
    log_only: bool,

    /// Also write the report JSON to this file
    #[arg(long)]
    stats_file: Option<PathBuf>,
}

fn run_backfill(args: BackfillArgs) -> Result<()> {
    set_log_only(args.log_only);
    if !(0.0..=1.0).contains(&args.threshold) {
        bail!("--threshold must be between 0 and 1, got {}", args.threshold);
    }
    if args.apply {
        checkpoint::ensure_writable(&args.checkpoint_file)?;
    }

    let source = RosterSource::parse(&args.roster);
    eprintln!("Loading roster from {}", source);
    let roster = load_roster(&source)?;
    eprintln!("Roster loaded: {} schools", roster.len());

    let mut store = VisitStore::open(&args.db)?;
    let opts = BackfillOptions {
        dry_run: !args.apply,
        threshold: args.threshold,
        page_size: args.page_size,
        batch_size: args.batch_size,
        scan_limit: args.scan_limit,
        since: args.since,
        staff: args.staff.clone(),
        sample_limit: args.sample_limit,
        checkpoint_file: Some(args.checkpoint_file.clone()),
        resume: args.resume,
        costs: CostModel {
            per_100k_reads: args.price_reads,
            per_100k_writes: args.price_writes,
        },
    };

    let mut reports = Vec::new();
    if matches!(args.target, Target::Entries | Target::Both) {
        reports.push(backfill_entries(&mut store, &roster, &opts)?);
    }
    if matches!(args.target, Target::Docs | Target::Both) {
        reports.push(backfill_docs(&mut store, &roster, &opts)?);
    }

    for report in &reports {
        report.stats.log_phase(&report.collection);
        println!("{}", serde_json::to_string_pretty(report)?);
    }
    if let Some(path) = &args.stats_file {
        let json = serde_json::to_string_pretty(&reports)?;
        std::fs::write(path, json)?;
        eprintln!("Report written to {}", path.display());
    }
    Ok(())
}

fn run_migrate(args: MigrateArgs) -> Result<()> {
    set_log_only(args.log_only);
    if args.apply {
        checkpoint::ensure_writable(&args.checkpoint_file)?;
    }

    let mut store = VisitStore::open(&args.db)?;
    let opts = MigrateOptions {
        dry_run: !args.apply,
        idempotent: args.idempotent,
        since: args.since,
        page_size: args.page_size,
        batch_size: args.batch_size,
        scan_limit: args.scan_limit,
        manifest_file: args.manifest.clone(),
        checkpoint_file: Some(args.checkpoint_file.clone()),
        resume: args.resume,
        sample_limit: args.sample_limit,
        costs: CostModel {
            per_100k_reads: args.price_reads,
            per_100k_writes: args.price_writes,
        },
    };

    let report = migrate_docs(&mut store, &opts)?;
    report.stats.log_phase("migrate");
    println!("{}", serde_json::to_string_pretty(&report)?);
    if let Some(path) = &args.stats_file {
        report.write_to_file(path)?;
        eprintln!("Report written to {}", path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Backfill(a) => run_backfill(a),
        Command::Migrate(a) => run_migrate(a),
    }
}
