//! Persistence boundary for entities, snapshots and alerts.

mod models;
mod schema;
mod sqlite_signal_store;

pub use models::*;
pub use schema::SIGNAL_VERSIONED_SCHEMAS;
pub use sqlite_signal_store::SqliteSignalStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub trait SignalStore: Send + Sync {
    // Entities
    fn create_entity(
        &self,
        kind: EntityKind,
        name: &str,
        platform_ids: &BTreeMap<Platform, String>,
    ) -> Result<Entity>;
    fn get_entity(&self, id: i64) -> Result<Option<Entity>>;
    /// Entities of `kind` holding a valid identifier for `platform`, by id.
    fn list_entities_with_platform(&self, kind: EntityKind, platform: Platform)
        -> Result<Vec<Entity>>;
    /// Flags an identifier so collectors stop using it until it is replaced.
    fn mark_platform_id_invalid(&self, entity_id: i64, platform: Platform, reason: &str)
        -> Result<()>;
    /// Sets (or replaces) an identifier, clearing any invalid flag.
    fn set_platform_id(&self, entity_id: i64, platform: Platform, platform_id: &str)
        -> Result<()>;

    // Snapshots
    /// Appends a snapshot in its own transaction. Returns `None` when the
    /// (entity, platform, observed_at) observation is already recorded.
    fn insert_snapshot(&self, entry: &ChartEntry) -> Result<Option<Snapshot>>;
    /// The newest snapshot strictly older than `before` for the series.
    fn previous_snapshot(
        &self,
        entity_id: i64,
        platform: Platform,
        metric: MetricKind,
        before: DateTime<Utc>,
    ) -> Result<Option<Snapshot>>;
    /// Snapshots of an entity observed at or after `since`, oldest first.
    fn snapshot_history(&self, entity_id: i64, since: DateTime<Utc>) -> Result<Vec<Snapshot>>;
    /// Entities of `kind` ordered by their most recent snapshot, newest first.
    fn recently_snapshotted_entities(&self, kind: EntityKind, limit: usize) -> Result<Vec<Entity>>;
    fn count_snapshots(&self, entity_id: i64) -> Result<usize>;

    // Alerts
    fn insert_alert(&self, alert: &NewAlert) -> Result<Alert>;
    fn latest_alert(&self, entity_id: i64, kind: AlertKind) -> Result<Option<Alert>>;
    /// Newest first.
    fn list_alerts(&self, limit: usize) -> Result<Vec<Alert>>;
}
