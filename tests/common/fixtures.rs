//! Temporary databases and pipeline wiring for tests.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracksignal_server::background_jobs::JobContext;
use tracksignal_server::config::CollectorSettings;
use tracksignal_server::inference::{NoOpClassifier, TrackClassifier};
use tracksignal_server::job_store::SqliteJobStore;
use tracksignal_server::signal_store::{
    Entity, EntityKind, Platform, SignalStore, SqliteSignalStore,
};
use tracksignal_server::sources::{SourceAdapter, SourceRegistry};

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(hours)
}

/// No pacing and millisecond backoff so tests run fast.
pub fn fast_collector_settings() -> CollectorSettings {
    CollectorSettings {
        pacing_delay_ms: 0,
        max_retries: 1,
        initial_backoff_ms: 1,
        backoff_multiplier: 2.0,
        max_backoff_ms: 5,
    }
}

/// Signal and job stores in a temporary directory.
pub struct TestPipeline {
    _temp_dir: TempDir,
    pub signal_store: Arc<SqliteSignalStore>,
    pub job_store: Arc<SqliteJobStore>,
}

#[allow(dead_code)]
impl TestPipeline {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let signal_store = Arc::new(
            SqliteSignalStore::new(temp_dir.path().join("signals.db"))
                .expect("Failed to create signal store"),
        );
        let job_store = Arc::new(
            SqliteJobStore::new(temp_dir.path().join("jobs.db")).expect("Failed to create job store"),
        );
        Self {
            _temp_dir: temp_dir,
            signal_store,
            job_store,
        }
    }

    pub fn add_track(&self, name: &str, chart_id: &str) -> Entity {
        let mut ids = BTreeMap::new();
        ids.insert(Platform::Chart, chart_id.to_string());
        self.signal_store
            .create_entity(EntityKind::Track, name, &ids)
            .expect("Failed to create track")
    }

    /// A job context over these stores with the given chart adapter.
    pub fn context(&self, chart: Arc<dyn SourceAdapter>) -> JobContext {
        self.context_with(
            self.signal_store.clone(),
            chart,
            Arc::new(NoOpClassifier),
            CancellationToken::new(),
        )
    }

    pub fn context_with(
        &self,
        signal_store: Arc<dyn SignalStore>,
        chart: Arc<dyn SourceAdapter>,
        classifier: Arc<dyn TrackClassifier>,
        cancellation_token: CancellationToken,
    ) -> JobContext {
        let mut sources = SourceRegistry::new();
        sources.register(chart);
        JobContext::new(
            cancellation_token,
            signal_store,
            self.job_store.clone(),
            sources,
            classifier,
        )
    }
}
