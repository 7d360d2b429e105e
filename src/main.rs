//! # Usage Ledger CLI (`uledger`)
//!
//! Wires the sync engine, the evaluation orchestrator, and the read-side
//! reports to the command line. Scheduling is left to cron or whatever
//! invokes these commands.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `uledger init` | Create the SQLite database and run schema migrations |
//! | `uledger sync incremental` | Mirror the next page of raw rows |
//! | `uledger sync recompute [--date D]` | Rebuild one day's daily counter (default: yesterday) |
//! | `uledger sync status` | Show both channels' checkpoints |
//! | `uledger eval run` | Trigger and execute an evaluation job |
//! | `uledger eval status <JOB_ID>` | Show a job's ledger entry |
//! | `uledger eval list` | Most recent jobs |
//! | `uledger report <kind>` | Daily, hourly, owners, trends, evaluations, owner |
//!
//! Logs go to stderr and honour `RUST_LOG` (default `info`).

use anyhow::{bail, Result};
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use usage_ledger::config::{self, Config};
use usage_ledger::evaluate::EvaluationOrchestrator;
use usage_ledger::models::Selection;
use usage_ledger::report;
use usage_ledger::sync::{SyncEngine, SyncStatus};
use usage_ledger::{db, jobs, migrate, raw_source};

/// Usage Ledger CLI: usage-event mirroring, counters, and retrieval-quality
/// evaluation.
#[derive(Parser)]
#[command(
    name = "uledger",
    about = "Usage Ledger: usage-event mirroring, counters, and retrieval-quality evaluation",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/uledger.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Run or inspect the sync channels.
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },

    /// Trigger evaluation jobs or inspect their progress.
    Eval {
        #[command(subcommand)]
        action: EvalAction,
    },

    /// Print read-side summaries.
    Report {
        #[command(subcommand)]
        kind: ReportKind,
    },
}

#[derive(Subcommand)]
enum SyncAction {
    /// Mirror raw rows after the stored cursor and fold them into counters.
    Incremental,

    /// Rebuild a day's daily counter from reference rows and refresh owner
    /// names.
    Recompute {
        /// Day to rebuild (YYYY-MM-DD). Defaults to yesterday (UTC).
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
    },

    /// Show the last run of each channel.
    Status,
}

#[derive(Subcommand)]
enum EvalAction {
    /// Select eligible rows, record a job, and run it to completion.
    Run {
        /// Only rows owned by this entity.
        #[arg(long)]
        owner: Option<i64>,

        /// Only rows recorded on or after this date (YYYY-MM-DD).
        #[arg(long, value_parser = parse_date)]
        since: Option<NaiveDate>,

        /// Only rows recorded on or before this date (YYYY-MM-DD).
        #[arg(long, value_parser = parse_date)]
        until: Option<NaiveDate>,

        /// Re-evaluate rows that already completed.
        #[arg(long)]
        force: bool,
    },

    /// Show a job's status and counters.
    Status { job_id: String },

    /// List the most recent jobs.
    List {
        #[arg(long, default_value = "10")]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum ReportKind {
    /// Counters and evaluation coverage for one day.
    Daily {
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
    },
    /// Per-hour counters for one day.
    Hourly {
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
    },
    /// Busiest owners for one day.
    Owners {
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Daily totals for the last N days.
    Trends {
        #[arg(long, default_value = "14")]
        days: u32,
    },
    /// Judgment and score summary over a date range (default: last 7 days).
    Evaluations {
        #[arg(long, value_parser = parse_date)]
        since: Option<NaiveDate>,
        #[arg(long, value_parser = parse_date)]
        until: Option<NaiveDate>,
    },
    /// Metadata and recent activity of one owner.
    Owner { id: i64 },
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync { action } => run_sync(&cfg, action).await?,
        Commands::Eval { action } => run_eval(&cfg, action).await?,
        Commands::Report { kind } => run_report(&cfg, kind).await?,
    }

    Ok(())
}

async fn run_sync(cfg: &Config, action: SyncAction) -> Result<()> {
    let pool = db::connect(cfg).await?;
    let raw = raw_source::connect(&cfg.raw_source).await?;
    let engine = SyncEngine::new(pool.clone(), raw, cfg);

    let outcome = match action {
        SyncAction::Incremental => {
            let report = engine.run_incremental().await?;
            println!("sync incremental");
            println!("  status:  {}", report.status.as_str());
            println!("  synced:  {}", report.rows_synced);
            println!("  skipped: {}", report.rows_skipped);
            println!("  cursor:  {}", report.new_cursor);
            (report.status, report.error)
        }
        SyncAction::Recompute { date } => {
            let report = engine.run_recompute(date).await?;
            println!("sync recompute {}", report.date);
            println!("  status:           {}", report.status.as_str());
            println!("  rows scanned:     {}", report.rows_scanned);
            println!("  total:            {}", report.total);
            println!("  rag_retrieval:    {}", report.counts.rag_retrieval);
            println!("  direct_injection: {}", report.counts.direct_injection);
            println!("  selected_docs:    {}", report.counts.selected_documents);
            println!("  owners refreshed: {}", report.owners_refreshed);
            (report.status, report.error)
        }
        SyncAction::Status => {
            let overview = engine.sync_status().await?;
            println!(
                "raw source: {}",
                if overview.raw_source_configured {
                    "configured"
                } else {
                    "not configured"
                }
            );
            for (name, cp) in [
                (cfg.sync.incremental_channel.as_str(), &overview.incremental),
                (cfg.sync.recompute_channel.as_str(), &overview.recompute),
            ] {
                match cp {
                    Some(cp) => println!(
                        "  {:<12} cursor={} status={} rows={} last run {}{}",
                        name,
                        cp.last_cursor,
                        cp.last_status.map(|s| s.as_str()).unwrap_or("-"),
                        cp.rows_processed,
                        cp.last_run_at
                            .map(report::format_ts_relative)
                            .unwrap_or_else(|| "never".to_string()),
                        cp.last_error
                            .as_deref()
                            .map(|e| format!(" error: {}", e))
                            .unwrap_or_default()
                    ),
                    None => println!("  {:<12} never run", name),
                }
            }
            (SyncStatus::Success, None)
        }
    };

    pool.close().await;

    match outcome {
        (SyncStatus::Failed, error) => bail!("sync failed: {}", error.unwrap_or_default()),
        _ => {
            println!("ok");
            Ok(())
        }
    }
}

async fn run_eval(cfg: &Config, action: EvalAction) -> Result<()> {
    let pool = db::connect(cfg).await?;
    let raw = raw_source::connect(&cfg.raw_source).await?;
    let orchestrator = EvaluationOrchestrator::from_config(pool.clone(), raw, cfg)?;

    match action {
        EvalAction::Run {
            owner,
            since,
            until,
            force,
        } => {
            let selection = Selection {
                owner_id: owner,
                start_date: since,
                end_date: until,
            };
            let receipt = orchestrator.trigger(&selection, force).await?;
            println!("eval run");
            println!("  job:      {}", receipt.job_id);
            println!("  eligible: {}", receipt.total_eligible);
            println!("  pending:  {}", receipt.pending);

            let job = orchestrator.execute(&receipt.job_id).await?;
            println!("  completed: {}", job.completed);
            println!("  failed:    {}", job.failed);
            println!("  skipped:   {}", job.skipped);
            println!("ok");
        }
        EvalAction::Status { job_id } => match orchestrator.status(&job_id).await? {
            Some(job) => {
                println!("job {}", job.job_id);
                println!("  status:    {}", job.status);
                println!("  total:     {}", job.total);
                println!("  completed: {}", job.completed);
                println!("  failed:    {}", job.failed);
                println!("  skipped:   {}", job.skipped);
                println!("  updated:   {}", report::format_ts_relative(job.updated_at));
            }
            None => {
                pool.close().await;
                bail!("Unknown evaluation job: {}", job_id);
            }
        },
        EvalAction::List { limit } => {
            for job in jobs::recent(&pool, limit).await? {
                println!(
                    "{}  {:<9} {}/{} done ({} failed, {} skipped)  {}",
                    job.job_id,
                    job.status,
                    job.processed(),
                    job.total,
                    job.failed,
                    job.skipped,
                    report::format_ts_relative(job.created_at)
                );
            }
        }
    }

    pool.close().await;
    Ok(())
}

async fn run_report(cfg: &Config, kind: ReportKind) -> Result<()> {
    let pool = db::connect(cfg).await?;

    match kind {
        ReportKind::Daily { date } => {
            let overview = report::daily_overview(&pool, date.unwrap_or_else(today)).await?;
            report::print_daily(&overview);
        }
        ReportKind::Hourly { date } => {
            let date = date.unwrap_or_else(today);
            println!("hourly {}", date);
            report::print_hourly(&report::hourly_breakdown(&pool, date).await?);
        }
        ReportKind::Owners { date, limit } => {
            let date = date.unwrap_or_else(today);
            println!("owners {}", date);
            report::print_owners(&report::top_owners(&pool, date, limit).await?);
        }
        ReportKind::Trends { days } => {
            println!("trends (last {} days)", days);
            report::print_trends(&report::trends(&pool, today(), days).await?);
        }
        ReportKind::Evaluations { since, until } => {
            let until = until.unwrap_or_else(today);
            let since = since.unwrap_or(until - Duration::days(6));
            let summary = report::evaluation_summary(&pool, since, until).await?;
            report::print_evaluation_summary(since, until, &summary);
        }
        ReportKind::Owner { id } => {
            let raw = raw_source::connect(&cfg.raw_source).await?;
            let detail = report::owner_detail(&pool, raw.as_ref(), id, today()).await?;
            report::print_owner_detail(&detail);
        }
    }

    pool.close().await;
    Ok(())
}
