//! Chart provider adapter.
//!
//! The provider serves a whole chart as one JSON document:
//! `{"entries": [{"id": "...", "rank": 1, ...}, ...]}`. The listing is
//! fetched once and served from memory until the TTL expires, so a chart
//! scrape costs one request however many tracks are tracked.

use super::{throttle, RawRecord, SourceAdapter, SourceError};
use crate::signal_store::{EntityKind, Platform};
use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

const RATE_LIMIT_INTERVAL: Duration = Duration::from_millis(500);

struct ChartListing {
    entries: HashMap<String, Value>,
    fetched_at: DateTime<Utc>,
    loaded: Instant,
}

pub struct ChartAdapter {
    client: Client,
    url: String,
    ttl: Duration,
    listing: Mutex<Option<ChartListing>>,
    last_request: Mutex<Instant>,
}

impl ChartAdapter {
    pub fn new(base_url: &str, chart: &str, ttl: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            url: format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                urlencoding::encode(chart)
            ),
            ttl,
            listing: Mutex::new(None),
            last_request: Mutex::new(Instant::now() - RATE_LIMIT_INTERVAL),
        })
    }

    fn load_listing(&self) -> Result<ChartListing, SourceError> {
        throttle(&self.last_request, RATE_LIMIT_INTERVAL);
        debug!("Fetching chart listing from {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .send()
            .map_err(|e| SourceError::from_reqwest(Platform::Chart, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::from_status(Platform::Chart, status));
        }
        let body: Value = response
            .json()
            .map_err(|e| SourceError::from_reqwest(Platform::Chart, e))?;

        Ok(ChartListing {
            entries: index_entries(body)?,
            fetched_at: Utc::now(),
            loaded: Instant::now(),
        })
    }
}

/// Indexes chart entries by id. Entries without a usable id are dropped.
fn index_entries(body: Value) -> Result<HashMap<String, Value>, SourceError> {
    let entries = match body {
        Value::Object(mut map) => map.remove("entries"),
        _ => None,
    };
    let Some(Value::Array(entries)) = entries else {
        return Err(SourceError::transient(
            Platform::Chart,
            "chart listing has no entries array",
        ));
    };

    Ok(entries
        .into_iter()
        .filter_map(|entry| {
            let id = match entry.get("id")? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            Some((id, entry))
        })
        .collect())
}

impl SourceAdapter for ChartAdapter {
    fn platform(&self) -> Platform {
        Platform::Chart
    }

    fn fetch(&self, kind: EntityKind, platform_id: &str) -> Result<Option<RawRecord>, SourceError> {
        if kind != EntityKind::Track {
            return Err(SourceError::permanent(
                Platform::Chart,
                "charts only list tracks",
            ));
        }

        let mut listing = self.listing.lock().unwrap();
        let stale = listing
            .as_ref()
            .map_or(true, |l| l.loaded.elapsed() >= self.ttl);
        if stale {
            *listing = Some(self.load_listing()?);
        }
        let Some(listing) = listing.as_ref() else {
            return Ok(None);
        };

        Ok(listing.entries.get(platform_id).map(|entry| RawRecord {
            platform: Platform::Chart,
            kind,
            platform_id: platform_id.to_string(),
            fetched_at: listing.fetched_at,
            payload: entry.clone(),
        }))
    }
}
