use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tracksignal_server::background_jobs::jobs::{
    ArtistSnapshotsJob, ChartScrapeJob, ViralDetectionJob,
};
use tracksignal_server::background_jobs::{create_scheduler, JobContext};
use tracksignal_server::config::{self, ClassifierKind};
use tracksignal_server::inference::load_classifier;
use tracksignal_server::job_store::{JobStore, SqliteJobStore};
use tracksignal_server::{admin, metrics};
use tracksignal_server::signal_store::{SignalStore, SqliteSignalStore};
use tracksignal_server::sources::SourceRegistry;

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = parse_path(s)?;
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory containing database files (signals.db, jobs.db).
    /// Can also be specified in config file.
    #[clap(long, value_parser = parse_dir)]
    pub db_dir: Option<PathBuf>,

    /// The port for /metrics (Prometheus scraping) and the /jobs endpoints. 0 disables it.
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// Classifier used to enrich alert evidence.
    #[clap(long, value_enum, default_value_t = ClassifierKind::None)]
    pub classifier: ClassifierKind,
}

impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_dir: args.db_dir.clone(),
            metrics_port: args.metrics_port,
            classifier: args.classifier,
        }
    }
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

    info!(
        "Starting tracksignal-server {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  db_dir: {:?}", app_config.db_dir);
    info!("  metrics_port: {}", app_config.metrics_port);

    info!("Opening signals database at {:?}", app_config.signals_db_path());
    let signal_store: Arc<dyn SignalStore> =
        Arc::new(SqliteSignalStore::new(app_config.signals_db_path())?);
    info!("Opening jobs database at {:?}", app_config.jobs_db_path());
    let job_store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(app_config.jobs_db_path())?);

    let sources = SourceRegistry::from_settings(&app_config.sources)?;
    info!(
        "Configured sources: {:?}",
        sources.platforms().collect::<Vec<_>>()
    );

    let classifier = load_classifier(&app_config.inference)?;

    metrics::init_metrics();

    let shutdown_token = CancellationToken::new();
    let job_context = JobContext::new(
        shutdown_token.child_token(),
        signal_store,
        job_store.clone(),
        sources,
        classifier,
    );
    let (mut scheduler, scheduler_handle) =
        create_scheduler(job_store, shutdown_token.clone(), job_context);

    let jobs = &app_config.jobs;
    match &jobs.collect_artists {
        Some(schedule) => {
            scheduler
                .register_job(Arc::new(ArtistSnapshotsJob::new(
                    schedule.clone(),
                    app_config.collector.clone(),
                )))
                .await
        }
        None => info!("Job {} is off", ArtistSnapshotsJob::ID),
    }
    match &jobs.scrape_charts {
        Some(schedule) => {
            scheduler
                .register_job(Arc::new(ChartScrapeJob::new(
                    schedule.clone(),
                    app_config.collector.clone(),
                )))
                .await
        }
        None => info!("Job {} is off", ChartScrapeJob::ID),
    }
    match &jobs.detect_viral {
        Some(schedule) => {
            scheduler
                .register_job(Arc::new(ViralDetectionJob::new(
                    schedule.clone(),
                    app_config.detector.clone(),
                )))
                .await
        }
        None => info!("Job {} is off", ViralDetectionJob::ID),
    }

    info!(
        "Job scheduler initialized with {} job(s)",
        scheduler.job_count().await
    );

    let admin_task = tokio::spawn(admin::serve(
        app_config.metrics_port,
        scheduler_handle,
        shutdown_token.clone(),
    ));

    let ctrl_c_token = shutdown_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, initiating graceful shutdown");
            ctrl_c_token.cancel();
        }
    });

    // Returns once the shutdown token is cancelled and running jobs are drained.
    scheduler.run().await;
    info!("Scheduler stopped");

    shutdown_token.cancel();
    match admin_task.await {
        Ok(Err(e)) => error!("Operator endpoint failed: {:#}", e),
        Err(e) => error!("Operator endpoint task failed: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(())
}
