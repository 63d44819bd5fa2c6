//! Fake source adapters and store wrappers.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracksignal_server::signal_store::{
    Alert, AlertKind, ChartEntry, Entity, EntityKind, MetricKind, NewAlert, Platform, SignalStore,
    Snapshot,
};
use tracksignal_server::sources::{RawRecord, SourceAdapter, SourceError};

/// A chart whose current listing is set by the test.
///
/// Ids missing from the listing are "not charting". Ids registered with
/// [`ChartTable::reject`] fail with a permanent error.
pub struct ChartTable {
    listing: Mutex<(DateTime<Utc>, HashMap<String, i64>)>,
    rejected: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl ChartTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listing: Mutex::new((Utc::now(), HashMap::new())),
            rejected: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Replaces the listing with one published at `published_at`.
    pub fn publish(&self, published_at: DateTime<Utc>, ranks: &[(&str, i64)]) {
        let mut listing = self.listing.lock().unwrap();
        listing.0 = published_at;
        listing.1 = ranks
            .iter()
            .map(|(id, rank)| (id.to_string(), *rank))
            .collect();
    }

    pub fn reject(&self, chart_id: &str) {
        self.rejected.lock().unwrap().insert(chart_id.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SourceAdapter for ChartTable {
    fn platform(&self) -> Platform {
        Platform::Chart
    }

    fn fetch(&self, kind: EntityKind, platform_id: &str) -> Result<Option<RawRecord>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.rejected.lock().unwrap().contains(platform_id) {
            return Err(SourceError::permanent(Platform::Chart, "HTTP 404 Not Found"));
        }

        let listing = self.listing.lock().unwrap();
        Ok(listing.1.get(platform_id).map(|rank| RawRecord {
            platform: Platform::Chart,
            kind,
            platform_id: platform_id.to_string(),
            fetched_at: listing.0,
            payload: serde_json::json!({ "rank": rank, "id": platform_id }),
        }))
    }
}

/// Delegates to an inner store except for snapshot writes, which always fail.
pub struct FailingWritesStore {
    inner: Arc<dyn SignalStore>,
}

#[allow(dead_code)]
impl FailingWritesStore {
    pub fn wrap(inner: Arc<dyn SignalStore>) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

impl SignalStore for FailingWritesStore {
    fn create_entity(
        &self,
        kind: EntityKind,
        name: &str,
        platform_ids: &BTreeMap<Platform, String>,
    ) -> Result<Entity> {
        self.inner.create_entity(kind, name, platform_ids)
    }

    fn get_entity(&self, id: i64) -> Result<Option<Entity>> {
        self.inner.get_entity(id)
    }

    fn list_entities_with_platform(
        &self,
        kind: EntityKind,
        platform: Platform,
    ) -> Result<Vec<Entity>> {
        self.inner.list_entities_with_platform(kind, platform)
    }

    fn mark_platform_id_invalid(
        &self,
        entity_id: i64,
        platform: Platform,
        reason: &str,
    ) -> Result<()> {
        self.inner.mark_platform_id_invalid(entity_id, platform, reason)
    }

    fn set_platform_id(&self, entity_id: i64, platform: Platform, platform_id: &str) -> Result<()> {
        self.inner.set_platform_id(entity_id, platform, platform_id)
    }

    fn insert_snapshot(&self, _entry: &ChartEntry) -> Result<Option<Snapshot>> {
        Err(anyhow!("disk I/O error"))
    }

    fn previous_snapshot(
        &self,
        entity_id: i64,
        platform: Platform,
        metric: MetricKind,
        before: DateTime<Utc>,
    ) -> Result<Option<Snapshot>> {
        self.inner.previous_snapshot(entity_id, platform, metric, before)
    }

    fn snapshot_history(&self, entity_id: i64, since: DateTime<Utc>) -> Result<Vec<Snapshot>> {
        self.inner.snapshot_history(entity_id, since)
    }

    fn recently_snapshotted_entities(&self, kind: EntityKind, limit: usize) -> Result<Vec<Entity>> {
        self.inner.recently_snapshotted_entities(kind, limit)
    }

    fn count_snapshots(&self, entity_id: i64) -> Result<usize> {
        self.inner.count_snapshots(entity_id)
    }

    fn insert_alert(&self, alert: &NewAlert) -> Result<Alert> {
        self.inner.insert_alert(alert)
    }

    fn latest_alert(&self, entity_id: i64, kind: AlertKind) -> Result<Option<Alert>> {
        self.inner.latest_alert(entity_id, kind)
    }

    fn list_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        self.inner.list_alerts(limit)
    }
}
