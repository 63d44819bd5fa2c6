//! Runs a pipeline job once, outside the scheduler, and inspects results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tracksignal_server::background_jobs::jobs::{
    ArtistSnapshotsJob, ChartScrapeJob, ViralDetectionJob,
};
use tracksignal_server::background_jobs::{BackgroundJob, JobContext, JobError, JobSchedule};
use tracksignal_server::config::{self, AppConfig, ClassifierKind};
use tracksignal_server::inference::load_classifier;
use tracksignal_server::job_store::{JobRunStatus, JobStore, SqliteJobStore};
use tracksignal_server::signal_store::{SignalStore, SqliteSignalStore};
use tracksignal_server::sources::SourceRegistry;

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Directory containing database files (signals.db, jobs.db).
    #[clap(long)]
    pub db_dir: Option<PathBuf>,

    /// Classifier used to enrich alert evidence.
    #[clap(long, value_enum, default_value_t = ClassifierKind::None)]
    pub classifier: ClassifierKind,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Collect one Spotify and Last.fm snapshot per tracked artist.
    CollectArtists,
    /// Record chart positions and popularity for tracked tracks.
    ScrapeCharts,
    /// Scan recently snapshotted tracks for viral signals.
    DetectViral,
    /// Show recent runs of a job.
    History {
        job_id: String,
        #[clap(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show persisted next/last run times and runs still in progress.
    Schedule,
    /// Show the most recent alerts.
    Alerts {
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },
}

struct Stores {
    signal_store: Arc<dyn SignalStore>,
    job_store: Arc<dyn JobStore>,
}

fn open_stores(app_config: &AppConfig) -> Result<Stores> {
    Ok(Stores {
        signal_store: Arc::new(SqliteSignalStore::new(app_config.signals_db_path())?),
        job_store: Arc::new(SqliteJobStore::new(app_config.jobs_db_path())?),
    })
}

fn build_job(command: &Command, app_config: &AppConfig) -> Option<Arc<dyn BackgroundJob>> {
    // Cadences are irrelevant here; a job that is "off" in the config still runs.
    let job: Arc<dyn BackgroundJob> = match command {
        Command::CollectArtists => Arc::new(ArtistSnapshotsJob::new(
            JobSchedule::manual(),
            app_config.collector.clone(),
        )),
        Command::ScrapeCharts => Arc::new(ChartScrapeJob::new(
            JobSchedule::manual(),
            app_config.collector.clone(),
        )),
        Command::DetectViral => Arc::new(ViralDetectionJob::new(
            JobSchedule::manual(),
            app_config.detector.clone(),
        )),
        Command::History { .. } | Command::Schedule | Command::Alerts { .. } => return None,
    };
    Some(job)
}

/// Runs the job to completion, recording the run like the scheduler does.
async fn run_job(job: Arc<dyn BackgroundJob>, stores: Stores, app_config: &AppConfig) -> Result<bool> {
    let sources = SourceRegistry::from_settings(&app_config.sources)?;
    let classifier = load_classifier(&app_config.inference)?;

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, cancelling job");
            ctrl_c_token.cancel();
        }
    });

    let ctx = JobContext::new(
        cancel,
        stores.signal_store,
        stores.job_store.clone(),
        sources,
        classifier,
    );

    let job_id = job.id();
    let run_id = stores
        .job_store
        .record_job_start(job_id, "cli")
        .context("Failed to record job start")?;
    info!("Running {} ({})", job.name(), job_id);

    let result = tokio::task::spawn_blocking(move || job.execute(&ctx)).await;

    let (status, error_message, stats) = match result {
        Ok(Ok(stats)) => (JobRunStatus::Completed, None, Some(stats)),
        Ok(Err(JobError::Cancelled { stats })) => {
            (JobRunStatus::Failed, Some("Cancelled".to_string()), stats)
        }
        Ok(Err(e)) => {
            let stats = e.stats().cloned();
            (JobRunStatus::Failed, Some(e.to_string()), stats)
        }
        Err(e) => (JobRunStatus::Failed, Some(format!("Task panic: {}", e)), None),
    };
    let stats = stats.filter(|s| !s.is_null());

    stores
        .job_store
        .record_job_finish(run_id, status, error_message.clone(), stats.as_ref())
        .context("Failed to record job finish")?;

    if let Some(stats) = &stats {
        println!("{}", serde_json::to_string_pretty(stats)?);
    }
    match error_message {
        Some(message) => {
            eprintln!("{} failed: {}", job_id, message);
            Ok(false)
        }
        None => {
            println!("{} completed.", job_id);
            Ok(true)
        }
    }
}

fn print_history(job_store: &dyn JobStore, job_id: &str, limit: usize) -> Result<()> {
    let runs = job_store.get_job_history(job_id, limit)?;
    if runs.is_empty() {
        println!("No runs recorded for {}.", job_id);
        return Ok(());
    }
    for run in runs {
        let finished = run
            .finished_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "#{} {} -> {} [{}] via {}{}",
            run.id,
            run.started_at.to_rfc3339(),
            finished,
            run.status.as_str(),
            run.triggered_by,
            run.error_message
                .map(|e| format!(" error: {}", e))
                .unwrap_or_default(),
        );
        if let Some(stats) = run.stats {
            println!("    {}", stats);
        }
    }
    Ok(())
}

fn print_schedule(job_store: &dyn JobStore) -> Result<()> {
    let states = job_store.get_all_schedule_states()?;
    let running = job_store.get_running_jobs()?;
    if states.is_empty() && running.is_empty() {
        println!("No schedule state recorded.");
        return Ok(());
    }
    for state in &states {
        println!(
            "{}: next {} last {}",
            state.job_id,
            state.next_run_at.to_rfc3339(),
            state
                .last_run_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    for run in running {
        println!(
            "{} running since {} (run #{}, via {})",
            run.job_id,
            run.started_at.to_rfc3339(),
            run.id,
            run.triggered_by
        );
    }
    Ok(())
}

fn print_alerts(signal_store: &dyn SignalStore, limit: usize) -> Result<()> {
    let alerts = signal_store.list_alerts(limit)?;
    if alerts.is_empty() {
        println!("No alerts.");
        return Ok(());
    }
    for alert in alerts {
        let name = signal_store
            .get_entity(alert.entity_id)?
            .map(|e| e.name)
            .unwrap_or_else(|| format!("entity {}", alert.entity_id));
        let evidence: &JsonValue = &alert.evidence;
        println!(
            "#{} {} {} ({}) by {}: {}",
            alert.id,
            alert.detected_at.to_rfc3339(),
            alert.kind.as_str(),
            name,
            alert.rule,
            evidence
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => Some(config::FileConfig::load(path)?),
        None => None,
    };
    let cli_config = config::CliConfig {
        db_dir: cli_args.db_dir.clone(),
        metrics_port: 0,
        classifier: cli_args.classifier,
    };
    let app_config = AppConfig::resolve(&cli_config, file_config)?;
    let stores = open_stores(&app_config)?;

    match &cli_args.command {
        Command::History { job_id, limit } => print_history(stores.job_store.as_ref(), job_id, *limit),
        Command::Schedule => print_schedule(stores.job_store.as_ref()),
        Command::Alerts { limit } => print_alerts(stores.signal_store.as_ref(), *limit),
        command => {
            let Some(job) = build_job(command, &app_config) else {
                return Ok(());
            };
            if !run_job(job, stores, &app_config).await? {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
