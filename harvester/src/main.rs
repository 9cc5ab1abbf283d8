//! Thin command-line entrypoint for the harvesting pipeline.
//!
//! Wires the store, tracker, API client, and collector together and exposes
//! the cleanup utility. Anything interactive (the cold-start backfill
//! prompt) lives here; the library never blocks on stdin.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use metrics_harvester::api::HttpMonitoringApi;
use metrics_harvester::cleanup::DuplicateCleaner;
use metrics_harvester::collector::MetricsCollector;
use metrics_harvester::config::HarvestConfig;
use metrics_harvester::config::ProjectRef;
use metrics_harvester::ingest::MetricsStorage;
use metrics_harvester::store::MeasurementStore;
use metrics_harvester::tracker::{
    BackfillDecision, BackfillPlan, BackfillPolicy, HeadlessBackfill, TimestampTracker,
};

/// Harvest fleet telemetry into a local time-series store
#[derive(Parser, Debug)]
#[command(name = "metrics-harvester")]
#[command(about = "Harvest fleet telemetry into a local time-series store")]
struct Args {
    /// Path to the measurement store
    #[arg(long, default_value = "harvest.db")]
    store: PathBuf,

    /// Monitoring API base URL
    #[arg(long, default_value = "https://monitoring.example.com/api/v1")]
    base_url: String,

    /// Monitoring API token
    #[arg(long, env = "HARVEST_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// Project to harvest, as id=name (repeatable)
    #[arg(long = "project", value_parser = parse_project)]
    projects: Vec<ProjectRef>,

    /// Metric names to harvest (comma separated; defaults to a standard set)
    #[arg(long, value_delimiter = ',')]
    metrics: Vec<String>,

    /// Lookback in hours for series with no prior data
    #[arg(long, default_value = "8")]
    period_hours: i64,

    /// Sampling granularity requested from the monitoring API
    #[arg(long, default_value = "PT1M")]
    granularity: String,

    /// Never prompt; large checkpoint backfills run in the background
    #[arg(long)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Collect new measurements for the configured projects
    Collect {
        /// Only collect the named project
        #[arg(long)]
        project: Option<String>,
        /// Ingest without computing in-memory aggregates
        #[arg(long)]
        collect_only: bool,
    },
    /// Remove duplicate measurements that slipped past live dedup
    Cleanup {
        /// Report what would be removed without deleting anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Print duplicate statistics for the store
    Stats,
    /// Show the largest duplicate groups
    Duplicates {
        #[arg(long, default_value = "10")]
        limit: usize,
        /// Include full member documents per group
        #[arg(long)]
        detailed: bool,
    },
}

fn parse_project(raw: &str) -> Result<ProjectRef, String> {
    let (id, name) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected id=name, got {raw:?}"))?;
    if id.is_empty() || name.is_empty() {
        return Err(format!("expected id=name, got {raw:?}"));
    }
    Ok(ProjectRef {
        id: id.to_string(),
        name: name.to_string(),
    })
}

/// Interactive backfill policy: asks on stderr, cancels on Ctrl-C.
struct PromptBackfill {
    cancelled: Arc<AtomicBool>,
}

impl BackfillPolicy for PromptBackfill {
    fn decide(&self, plan: &BackfillPlan) -> BackfillDecision {
        eprintln!(
            "Tracker cold start: {} series need checkpoint backfill.",
            plan.len()
        );
        eprint!("[f]oreground / [b]ackground / [s]kip / [a]bort? ");
        let _ = io::stderr().flush();
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line).is_err() {
            return BackfillDecision::Background;
        }
        match line.trim().to_ascii_lowercase().as_str() {
            "f" | "foreground" => BackfillDecision::Foreground,
            "s" | "skip" => BackfillDecision::Skip,
            "a" | "abort" => BackfillDecision::Abort,
            _ => BackfillDecision::Background,
        }
    }

    fn on_progress(&self, done: usize, total: usize) {
        if done % 25 == 0 || done == total {
            eprintln!("backfill {done}/{total}");
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Command::Collect {
            ref project,
            collect_only,
        } => run_collect(&args, project.clone(), collect_only).await,
        Command::Cleanup { dry_run } => {
            let cleaner = open_cleaner(&args)?;
            let result = cleaner.cleanup_duplicates(dry_run)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Stats => {
            let cleaner = open_cleaner(&args)?;
            let stats = cleaner.duplicate_stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Duplicates { limit, detailed } => {
            let cleaner = open_cleaner(&args)?;
            if detailed {
                let groups = cleaner.detailed_sample_duplicates(limit)?;
                println!("{}", serde_json::to_string_pretty(&groups)?);
            } else {
                let groups = cleaner.sample_duplicates(limit)?;
                println!("{}", serde_json::to_string_pretty(&groups)?);
            }
            Ok(())
        }
    }
}

fn open_cleaner(args: &Args) -> anyhow::Result<DuplicateCleaner> {
    let store = Arc::new(MeasurementStore::open(&args.store)?);
    Ok(DuplicateCleaner::new(store))
}

async fn run_collect(
    args: &Args,
    project: Option<String>,
    collect_only: bool,
) -> anyhow::Result<()> {
    let token = args
        .api_token
        .clone()
        .context("monitoring API token missing; set --api-token or HARVEST_API_TOKEN")?;
    let api = HttpMonitoringApi::new(&args.base_url, &token)?;

    let defaults = HarvestConfig::default();
    let config = HarvestConfig {
        projects: args.projects.clone(),
        metrics: if args.metrics.is_empty() {
            defaults.metrics.clone()
        } else {
            args.metrics.clone()
        },
        period_hours: args.period_hours,
        granularity: args.granularity.clone(),
        collect_only,
        ..defaults
    };

    let store = Arc::new(MeasurementStore::open(&args.store)?);

    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let cancelled = Arc::clone(&cancelled);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancelled.store(true, Ordering::Relaxed);
            }
        });
    }
    let policy: Arc<dyn BackfillPolicy> = if args.non_interactive {
        Arc::new(HeadlessBackfill)
    } else {
        Arc::new(PromptBackfill { cancelled })
    };

    let bootstrap_store = Arc::clone(&store);
    let tracker =
        tokio::task::spawn_blocking(move || TimestampTracker::bootstrap(bootstrap_store, policy.as_ref()))
            .await
            .context("checkpoint bootstrap task failed")??;
    tracing::info!(tracked_series = tracker.len(), "tracker ready");

    let storage = MetricsStorage::new(store, tracker);
    let mut collector = MetricsCollector::new(api, storage, config)?;
    let report = collector.collect_metrics(project.as_deref()).await?;

    println!(
        "projects: {}  processes: {}  partitions: {}  collected: {}  stored: {}  failed units: {}",
        report.stats.projects,
        report.stats.processes_scanned,
        report.stats.partitions_scanned,
        report.stats.points_collected,
        report.stats.points_stored,
        report.stats.units_failed,
    );
    if !report.results.is_empty() {
        println!("{}", serde_json::to_string_pretty(&report.results)?);
    }
    Ok(())
}
