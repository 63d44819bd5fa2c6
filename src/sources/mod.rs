//! Per-platform source adapters.
//!
//! Adapters are blocking clients: they are only ever called from job bodies,
//! which run on the blocking thread pool. Each adapter owns its credentials
//! and its own request throttle.

mod chart;
mod error;
mod lastfm;
mod retry;
mod spotify;

pub use chart::ChartAdapter;
pub use error::SourceError;
pub use lastfm::LastFmAdapter;
pub use retry::RetryPolicy;
pub use spotify::SpotifyAdapter;

use crate::config::SourcesSettings;
use crate::signal_store::{EntityKind, Platform};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// An unnormalized record as returned by a platform.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub platform: Platform,
    pub kind: EntityKind,
    pub platform_id: String,
    pub fetched_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

pub trait SourceAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Fetches the current record for `platform_id`.
    ///
    /// `Ok(None)` means the platform has nothing for this id right now (for
    /// instance a track that is not charting) and is not a failure.
    fn fetch(&self, kind: EntityKind, platform_id: &str) -> Result<Option<RawRecord>, SourceError>;
}

/// Configured adapters keyed by platform.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: HashMap<Platform, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry holding an adapter for every configured platform.
    pub fn from_settings(settings: &SourcesSettings) -> Result<Self> {
        let mut registry = Self::new();

        if let Some(spotify) = &settings.spotify {
            registry.register(Arc::new(SpotifyAdapter::new(
                &spotify.client_id,
                &spotify.client_secret,
            )?));
        }
        if let Some(lastfm) = &settings.lastfm {
            registry.register(Arc::new(LastFmAdapter::new(&lastfm.api_key)?));
        }
        if let Some(chart) = &settings.chart {
            registry.register(Arc::new(ChartAdapter::new(
                &chart.base_url,
                &chart.chart,
                std::time::Duration::from_secs(chart.cache_ttl_secs),
            )?));
        }

        info!(
            "Source adapters configured: {:?}",
            registry.platforms().collect::<Vec<_>>()
        );
        Ok(registry)
    }

    /// Registers an adapter, replacing any previous one for the same platform.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    pub fn platforms(&self) -> impl Iterator<Item = Platform> + '_ {
        let mut platforms: Vec<Platform> = self.adapters.keys().copied().collect();
        platforms.sort();
        platforms.into_iter()
    }
}

/// Sleeps until at least `interval` has passed since the previous request
/// made through `last`.
pub(crate) fn throttle(last: &std::sync::Mutex<std::time::Instant>, interval: std::time::Duration) {
    let mut last = last.lock().unwrap();
    let elapsed = last.elapsed();
    if elapsed < interval {
        std::thread::sleep(interval - elapsed);
    }
    *last = std::time::Instant::now();
}
