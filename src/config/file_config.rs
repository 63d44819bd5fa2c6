use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub metrics_port: Option<u16>,

    // Pipeline sections
    pub collector: Option<CollectorConfig>,
    pub detector: Option<DetectorConfig>,
    pub sources: Option<SourcesConfig>,
    pub jobs: Option<JobsConfig>,
    pub inference: Option<InferenceConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct CollectorConfig {
    pub pacing_delay_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub max_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct DetectorConfig {
    pub cohort_limit: Option<usize>,
    pub lookback_hours: Option<u64>,
    pub velocity_threshold: Option<i64>,
    pub popularity_gain_threshold: Option<i64>,
    /// 0 disables the time window; same-snapshot suppression still applies.
    pub dedup_window_hours: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SourcesConfig {
    pub spotify: Option<SpotifyConfig>,
    pub lastfm: Option<LastFmConfig>,
    pub chart: Option<ChartConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LastFmConfig {
    pub api_key: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChartConfig {
    pub base_url: String,
    /// Chart name appended to the base URL, e.g. "global-top-100".
    pub chart: String,
    pub cache_ttl_secs: Option<u64>,
}

/// Cadence per job id: cron expression, "every 4h", "daily 06:00" or "off".
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct JobsConfig {
    pub collect_artists: Option<String>,
    pub scrape_charts: Option<String>,
    pub detect_viral: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct InferenceConfig {
    /// "none" or "momentum"
    pub classifier: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
db_dir = "/var/lib/tracksignal"
metrics_port = 9100

[collector]
pacing_delay_ms = 0
max_retries = 4

[detector]
velocity_threshold = 800
dedup_window_hours = 0

[sources.spotify]
client_id = "id"
client_secret = "secret"

[sources.chart]
base_url = "https://charts.example.com/api"
chart = "global-top-100"

[jobs]
collect_artists = "every 4h"
detect_viral = "off"

[inference]
classifier = "momentum"
"#
        )
        .unwrap();

        let config = FileConfig::load(file.path()).unwrap();

        assert_eq!(config.db_dir.as_deref(), Some("/var/lib/tracksignal"));
        assert_eq!(config.metrics_port, Some(9100));
        let collector = config.collector.unwrap();
        assert_eq!(collector.pacing_delay_ms, Some(0));
        assert_eq!(collector.max_retries, Some(4));
        assert!(collector.initial_backoff_ms.is_none());
        assert_eq!(config.detector.unwrap().velocity_threshold, Some(800));
        let sources = config.sources.unwrap();
        assert_eq!(sources.spotify.unwrap().client_secret, "secret");
        assert!(sources.lastfm.is_none());
        assert!(sources.chart.unwrap().cache_ttl_secs.is_none());
        let jobs = config.jobs.unwrap();
        assert_eq!(jobs.collect_artists.as_deref(), Some("every 4h"));
        assert_eq!(jobs.detect_viral.as_deref(), Some("off"));
        assert!(jobs.scrape_charts.is_none());
        assert_eq!(config.inference.unwrap().classifier.as_deref(), Some("momentum"));
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "db_dir = [").unwrap();
        let err = FileConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = FileConfig::load(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
