mod file_config;

pub use file_config::{
    ChartConfig, CollectorConfig, DetectorConfig, FileConfig, InferenceConfig, JobsConfig,
    LastFmConfig, SourcesConfig, SpotifyConfig,
};

use crate::background_jobs::{parse_cadence, JobSchedule};
use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub metrics_port: u16,
    pub classifier: ClassifierKind,
}

/// Which classifier enriches alert evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ClassifierKind {
    #[default]
    None,
    Momentum,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    /// 0 disables the metrics listener.
    pub metrics_port: u16,

    pub collector: CollectorSettings,
    pub detector: DetectorSettings,
    pub sources: SourcesSettings,
    pub jobs: JobsSettings,
    pub inference: InferenceSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| anyhow!("db_dir must be specified via --db-dir or in config file"))?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let collector = CollectorSettings::from_file(file.collector.unwrap_or_default())?;
        let detector = DetectorSettings::from_file(file.detector.unwrap_or_default())?;
        let sources = SourcesSettings::from_file(file.sources.unwrap_or_default());
        let jobs = JobsSettings::from_file(file.jobs.unwrap_or_default())?;

        let classifier = match file.inference.and_then(|i| i.classifier) {
            Some(name) => parse_classifier(&name)
                .ok_or_else(|| anyhow!("Unknown classifier in [inference]: {}", name))?,
            None => cli.classifier,
        };

        Ok(Self {
            db_dir,
            metrics_port,
            collector,
            detector,
            sources,
            jobs,
            inference: InferenceSettings { classifier },
        })
    }

    pub fn signals_db_path(&self) -> PathBuf {
        self.db_dir.join("signals.db")
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.db_dir.join("jobs.db")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectorSettings {
    /// Delay between external calls. 0 disables pacing.
    pub pacing_delay_ms: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            pacing_delay_ms: 250,
            max_retries: 2,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
        }
    }
}

impl CollectorSettings {
    fn from_file(file: CollectorConfig) -> Result<Self> {
        let defaults = Self::default();
        let settings = Self {
            pacing_delay_ms: file.pacing_delay_ms.unwrap_or(defaults.pacing_delay_ms),
            max_retries: file.max_retries.unwrap_or(defaults.max_retries),
            initial_backoff_ms: file
                .initial_backoff_ms
                .unwrap_or(defaults.initial_backoff_ms),
            backoff_multiplier: file
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
            max_backoff_ms: file.max_backoff_ms.unwrap_or(defaults.max_backoff_ms),
        };
        if settings.backoff_multiplier < 1.0 {
            bail!(
                "collector.backoff_multiplier must be >= 1.0, got {}",
                settings.backoff_multiplier
            );
        }
        Ok(settings)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    /// How many recently snapshotted tracks one scan looks at.
    pub cohort_limit: usize,
    pub lookback_hours: u64,
    pub velocity_threshold: i64,
    pub popularity_gain_threshold: i64,
    /// 0 disables the time window.
    pub dedup_window_hours: u64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            cohort_limit: 100,
            lookback_hours: 48,
            velocity_threshold: 500,
            popularity_gain_threshold: 15,
            dedup_window_hours: 24,
        }
    }
}

impl DetectorSettings {
    fn from_file(file: DetectorConfig) -> Result<Self> {
        let defaults = Self::default();
        let settings = Self {
            cohort_limit: file.cohort_limit.unwrap_or(defaults.cohort_limit),
            lookback_hours: file.lookback_hours.unwrap_or(defaults.lookback_hours),
            velocity_threshold: file
                .velocity_threshold
                .unwrap_or(defaults.velocity_threshold),
            popularity_gain_threshold: file
                .popularity_gain_threshold
                .unwrap_or(defaults.popularity_gain_threshold),
            dedup_window_hours: file
                .dedup_window_hours
                .unwrap_or(defaults.dedup_window_hours),
        };
        if settings.lookback_hours == 0 {
            bail!("detector.lookback_hours must be positive");
        }
        Ok(settings)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourcesSettings {
    pub spotify: Option<SpotifySettings>,
    pub lastfm: Option<LastFmSettings>,
    pub chart: Option<ChartSettings>,
}

#[derive(Debug, Clone)]
pub struct SpotifySettings {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct LastFmSettings {
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct ChartSettings {
    pub base_url: String,
    pub chart: String,
    pub cache_ttl_secs: u64,
}

impl SourcesSettings {
    fn from_file(file: SourcesConfig) -> Self {
        Self {
            spotify: file.spotify.map(|s| SpotifySettings {
                client_id: s.client_id,
                client_secret: s.client_secret,
            }),
            lastfm: file.lastfm.map(|l| LastFmSettings { api_key: l.api_key }),
            chart: file.chart.map(|c| ChartSettings {
                base_url: c.base_url,
                chart: c.chart,
                cache_ttl_secs: c.cache_ttl_secs.unwrap_or(3600),
            }),
        }
    }
}

/// Resolved cadence per job. `None` means the job is not scheduled
/// (it can still be run through `cli-jobs`).
#[derive(Debug, Clone, PartialEq)]
pub struct JobsSettings {
    pub collect_artists: Option<JobSchedule>,
    pub scrape_charts: Option<JobSchedule>,
    pub detect_viral: Option<JobSchedule>,
}

pub const DEFAULT_COLLECT_ARTISTS_CADENCE: &str = "0 */4 * * *";
pub const DEFAULT_SCRAPE_CHARTS_CADENCE: &str = "daily 06:00";
pub const DEFAULT_DETECT_VIRAL_CADENCE: &str = "30 */4 * * *";

impl JobsSettings {
    fn from_file(file: JobsConfig) -> Result<Self> {
        let cadence = |job_id: &str, value: Option<String>, default: &str| {
            let value = value.unwrap_or_else(|| default.to_string());
            parse_cadence(&value).with_context(|| format!("Invalid cadence for job {}", job_id))
        };

        Ok(Self {
            collect_artists: cadence(
                "collect_artists",
                file.collect_artists,
                DEFAULT_COLLECT_ARTISTS_CADENCE,
            )?,
            scrape_charts: cadence(
                "scrape_charts",
                file.scrape_charts,
                DEFAULT_SCRAPE_CHARTS_CADENCE,
            )?,
            detect_viral: cadence(
                "detect_viral",
                file.detect_viral,
                DEFAULT_DETECT_VIRAL_CADENCE,
            )?,
        })
    }
}

impl Default for JobsSettings {
    fn default() -> Self {
        // The default cadences are constants known to parse.
        Self::from_file(JobsConfig::default()).unwrap_or(Self {
            collect_artists: None,
            scrape_charts: None,
            detect_viral: None,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct InferenceSettings {
    pub classifier: ClassifierKind,
}

/// Uses clap's ValueEnum trait for parsing.
fn parse_classifier(s: &str) -> Option<ClassifierKind> {
    ClassifierKind::from_str(s, true).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn cli_for(temp_dir: &TempDir) -> CliConfig {
        CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_classifier() {
        assert_eq!(parse_classifier("none"), Some(ClassifierKind::None));
        assert_eq!(parse_classifier("MOMENTUM"), Some(ClassifierKind::Momentum));
        assert!(parse_classifier("bert").is_none());
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            metrics_port: 9091,
            classifier: ClassifierKind::Momentum,
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.inference.classifier, ClassifierKind::Momentum);
        assert_eq!(config.collector, CollectorSettings::default());
        assert_eq!(config.detector, DetectorSettings::default());
        assert!(config.sources.spotify.is_none());
        assert_eq!(config.jobs, JobsSettings::default());
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            metrics_port: 9091,
            classifier: ClassifierKind::Momentum,
        };

        let file_config = FileConfig {
            db_dir: Some(temp_dir.path().to_string_lossy().to_string()),
            collector: Some(CollectorConfig {
                pacing_delay_ms: Some(0),
                ..Default::default()
            }),
            detector: Some(DetectorConfig {
                dedup_window_hours: Some(0),
                ..Default::default()
            }),
            inference: Some(InferenceConfig {
                classifier: Some("none".to_string()),
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.collector.pacing_delay_ms, 0);
        assert_eq!(config.collector.max_retries, 2);
        assert_eq!(config.detector.dedup_window_hours, 0);
        assert_eq!(config.detector.velocity_threshold, 500);
        assert_eq!(config.inference.classifier, ClassifierKind::None);
        // CLI value used when TOML doesn't specify
        assert_eq!(config.metrics_port, 9091);
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let result = AppConfig::resolve(&CliConfig::default(), None);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_db_dir_not_directory_error() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(temp_file.path().to_path_buf()),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("not a directory"));
    }

    #[test]
    fn test_resolve_job_cadences() {
        let temp_dir = TempDir::new().unwrap();
        let file_config = FileConfig {
            jobs: Some(JobsConfig {
                collect_artists: Some("every 4h".to_string()),
                scrape_charts: Some("off".to_string()),
                detect_viral: None,
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli_for(&temp_dir), Some(file_config)).unwrap();

        assert_eq!(
            config.jobs.collect_artists,
            Some(JobSchedule::Interval(Duration::from_secs(4 * 3600)))
        );
        assert!(config.jobs.scrape_charts.is_none());
        match config.jobs.detect_viral {
            Some(JobSchedule::Cron(cron)) => {
                assert_eq!(cron.expression(), DEFAULT_DETECT_VIRAL_CADENCE)
            }
            other => panic!("unexpected schedule {:?}", other),
        }
    }

    #[test]
    fn test_resolve_rejects_bad_cadence() {
        let temp_dir = TempDir::new().unwrap();
        let file_config = FileConfig {
            jobs: Some(JobsConfig {
                detect_viral: Some("whenever".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let err = AppConfig::resolve(&cli_for(&temp_dir), Some(file_config)).unwrap_err();
        assert!(err.to_string().contains("detect_viral"));
    }

    #[test]
    fn test_resolve_rejects_unknown_classifier() {
        let temp_dir = TempDir::new().unwrap();
        let file_config = FileConfig {
            inference: Some(InferenceConfig {
                classifier: Some("bert".to_string()),
            }),
            ..Default::default()
        };

        let err = AppConfig::resolve(&cli_for(&temp_dir), Some(file_config)).unwrap_err();
        assert!(err.to_string().contains("Unknown classifier"));
    }

    #[test]
    fn test_chart_ttl_default() {
        let temp_dir = TempDir::new().unwrap();
        let file_config = FileConfig {
            sources: Some(SourcesConfig {
                chart: Some(ChartConfig {
                    base_url: "http://localhost".to_string(),
                    chart: "top".to_string(),
                    cache_ttl_secs: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli_for(&temp_dir), Some(file_config)).unwrap();
        assert_eq!(config.sources.chart.unwrap().cache_ttl_secs, 3600);
    }

    #[test]
    fn test_db_path_helpers() {
        let temp_dir = TempDir::new().unwrap();
        let config = AppConfig::resolve(&cli_for(&temp_dir), None).unwrap();

        assert_eq!(config.signals_db_path(), temp_dir.path().join("signals.db"));
        assert_eq!(config.jobs_db_path(), temp_dir.path().join("jobs.db"));
    }
}
