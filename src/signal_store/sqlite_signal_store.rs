use super::models::{
    Alert, AlertKind, Anomaly, ChartEntry, Entity, EntityKind, MetricKind, NewAlert, Platform,
    Snapshot,
};
use super::schema::SIGNAL_VERSIONED_SCHEMAS;
use super::SignalStore;
use crate::sqlite_persistence::open_versioned;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

const SNAPSHOT_COLUMNS: &str =
    "id, entity_id, platform, metric, value, observed_at, raw, anomalies";
const ALERT_COLUMNS: &str = "id, entity_id, kind, rule, detected_at, snapshot_id, evidence";

pub struct SqliteSignalStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSignalStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path.as_ref(), SIGNAL_VERSIONED_SCHEMAS, "signals")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn from_millis(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap_or_default()
    }

    fn invalid_column<E>(idx: usize, err: E) -> rusqlite::Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    }

    fn unknown_value(idx: usize, what: &str, value: String) -> rusqlite::Error {
        Self::invalid_column(
            idx,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown {} '{}'", what, value),
            ),
        )
    }

    fn load_platform_ids(conn: &Connection, entity_id: i64) -> Result<BTreeMap<Platform, String>> {
        let mut stmt = conn.prepare_cached(
            "SELECT platform, platform_id FROM entity_platform_ids
             WHERE entity_id = ?1 AND invalid_reason IS NULL",
        )?;
        let rows = stmt
            .query_map(params![entity_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(platform, id)| Platform::parse(&platform).map(|p| (p, id)))
            .collect())
    }

    /// Builds entities from `(id, kind, name)` rows.
    fn hydrate_entities(conn: &Connection, rows: Vec<(i64, String, String)>) -> Result<Vec<Entity>> {
        let mut entities = Vec::with_capacity(rows.len());
        for (id, kind, name) in rows {
            let Some(kind) = EntityKind::parse(&kind) else {
                continue;
            };
            entities.push(Entity {
                id,
                kind,
                name,
                platform_ids: Self::load_platform_ids(conn, id)?,
            });
        }
        Ok(entities)
    }

    fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<Snapshot> {
        let platform: String = row.get("platform")?;
        let metric: String = row.get("metric")?;
        let raw: String = row.get("raw")?;
        let anomalies: Option<String> = row.get("anomalies")?;

        Ok(Snapshot {
            id: row.get("id")?,
            entry: ChartEntry {
                entity_id: row.get("entity_id")?,
                platform: Platform::parse(&platform)
                    .ok_or_else(|| Self::unknown_value(2, "platform", platform.clone()))?,
                metric: MetricKind::parse(&metric)
                    .ok_or_else(|| Self::unknown_value(3, "metric", metric.clone()))?,
                value: row.get("value")?,
                observed_at: Self::from_millis(row.get("observed_at")?),
                raw: serde_json::from_str(&raw).map_err(|e| Self::invalid_column(6, e))?,
                anomalies: anomalies
                    .and_then(|s| serde_json::from_str::<Vec<Anomaly>>(&s).ok())
                    .unwrap_or_default(),
            },
        })
    }

    fn row_to_alert(row: &rusqlite::Row) -> rusqlite::Result<Alert> {
        let kind: String = row.get("kind")?;
        let evidence: String = row.get("evidence")?;

        Ok(Alert {
            id: row.get("id")?,
            alert: NewAlert {
                entity_id: row.get("entity_id")?,
                kind: AlertKind::parse(&kind)
                    .ok_or_else(|| Self::unknown_value(2, "alert kind", kind.clone()))?,
                rule: row.get("rule")?,
                detected_at: Self::from_millis(row.get("detected_at")?),
                snapshot_id: row.get("snapshot_id")?,
                evidence: serde_json::from_str(&evidence)
                    .map_err(|e| Self::invalid_column(6, e))?,
            },
        })
    }
}

impl SignalStore for SqliteSignalStore {
    fn create_entity(
        &self,
        kind: EntityKind,
        name: &str,
        platform_ids: &BTreeMap<Platform, String>,
    ) -> Result<Entity> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO entities (kind, name) VALUES (?1, ?2)",
            params![kind.as_str(), name],
        )?;
        let id = tx.last_insert_rowid();
        for (platform, platform_id) in platform_ids {
            tx.execute(
                "INSERT INTO entity_platform_ids (entity_id, platform, platform_id)
                 VALUES (?1, ?2, ?3)",
                params![id, platform.as_str(), platform_id],
            )?;
        }
        tx.commit()?;

        Ok(Entity {
            id,
            kind,
            name: name.to_string(),
            platform_ids: platform_ids.clone(),
        })
    }

    fn get_entity(&self, id: i64) -> Result<Option<Entity>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, kind, name FROM entities WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        Ok(match row {
            Some(row) => Self::hydrate_entities(&conn, vec![row])?.pop(),
            None => None,
        })
    }

    fn list_entities_with_platform(
        &self,
        kind: EntityKind,
        platform: Platform,
    ) -> Result<Vec<Entity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT e.id, e.kind, e.name FROM entities e
             JOIN entity_platform_ids p ON p.entity_id = e.id
             WHERE e.kind = ?1 AND p.platform = ?2 AND p.invalid_reason IS NULL
             ORDER BY e.id",
        )?;
        let rows = stmt
            .query_map(params![kind.as_str(), platform.as_str()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        Self::hydrate_entities(&conn, rows)
    }

    fn mark_platform_id_invalid(
        &self,
        entity_id: i64,
        platform: Platform,
        reason: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE entity_platform_ids SET invalid_reason = ?1, invalid_since = ?2
             WHERE entity_id = ?3 AND platform = ?4",
            params![
                reason,
                Self::to_millis(&Utc::now()),
                entity_id,
                platform.as_str()
            ],
        )?;
        Ok(())
    }

    fn set_platform_id(&self, entity_id: i64, platform: Platform, platform_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO entity_platform_ids (entity_id, platform, platform_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(entity_id, platform) DO UPDATE
             SET platform_id = ?3, invalid_reason = NULL, invalid_since = NULL",
            params![entity_id, platform.as_str(), platform_id],
        )?;
        Ok(())
    }

    fn insert_snapshot(&self, entry: &ChartEntry) -> Result<Option<Snapshot>> {
        let mut conn = self.conn.lock().unwrap();
        let observed_at = Self::to_millis(&entry.observed_at);
        let anomalies = if entry.anomalies.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&entry.anomalies)?)
        };

        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO snapshots
             (entity_id, platform, metric, value, observed_at, raw, anomalies)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.entity_id,
                entry.platform.as_str(),
                entry.metric.as_str(),
                entry.value,
                observed_at,
                entry.raw.to_string(),
                anomalies
            ],
        )
        .with_context(|| {
            format!(
                "Failed to insert {} snapshot for entity {} at {}",
                entry.platform,
                entry.entity_id,
                entry.observed_at.to_rfc3339()
            )
        })?;
        if inserted == 0 {
            return Ok(None);
        }
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE entities SET last_snapshot_at = MAX(COALESCE(last_snapshot_at, 0), ?1)
             WHERE id = ?2",
            params![observed_at, entry.entity_id],
        )?;
        tx.commit()?;

        Ok(Some(Snapshot {
            id,
            entry: entry.clone(),
        }))
    }

    fn previous_snapshot(
        &self,
        entity_id: i64,
        platform: Platform,
        metric: MetricKind,
        before: DateTime<Utc>,
    ) -> Result<Option<Snapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM snapshots
             WHERE entity_id = ?1 AND platform = ?2 AND metric = ?3 AND observed_at < ?4
             ORDER BY observed_at DESC LIMIT 1",
            SNAPSHOT_COLUMNS
        ))?;

        let snapshot = stmt
            .query_row(
                params![
                    entity_id,
                    platform.as_str(),
                    metric.as_str(),
                    Self::to_millis(&before)
                ],
                Self::row_to_snapshot,
            )
            .optional()?;

        Ok(snapshot)
    }

    fn snapshot_history(&self, entity_id: i64, since: DateTime<Utc>) -> Result<Vec<Snapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM snapshots
             WHERE entity_id = ?1 AND observed_at >= ?2
             ORDER BY observed_at ASC, id ASC",
            SNAPSHOT_COLUMNS
        ))?;

        let snapshots = stmt
            .query_map(
                params![entity_id, Self::to_millis(&since)],
                Self::row_to_snapshot,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(snapshots)
    }

    fn recently_snapshotted_entities(&self, kind: EntityKind, limit: usize) -> Result<Vec<Entity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, kind, name FROM entities
             WHERE kind = ?1 AND last_snapshot_at IS NOT NULL
             ORDER BY last_snapshot_at DESC, id ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![kind.as_str(), limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        Self::hydrate_entities(&conn, rows)
    }

    fn count_snapshots(&self, entity_id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM snapshots WHERE entity_id = ?1",
            params![entity_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn insert_alert(&self, alert: &NewAlert) -> Result<Alert> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alerts (entity_id, kind, rule, detected_at, snapshot_id, evidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                alert.entity_id,
                alert.kind.as_str(),
                alert.rule,
                Self::to_millis(&alert.detected_at),
                alert.snapshot_id,
                alert.evidence.to_string()
            ],
        )
        .with_context(|| format!("Failed to insert alert for entity {}", alert.entity_id))?;

        Ok(Alert {
            id: conn.last_insert_rowid(),
            alert: alert.clone(),
        })
    }

    fn latest_alert(&self, entity_id: i64, kind: AlertKind) -> Result<Option<Alert>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM alerts WHERE entity_id = ?1 AND kind = ?2
             ORDER BY detected_at DESC, id DESC LIMIT 1",
            ALERT_COLUMNS
        ))?;

        let alert = stmt
            .query_row(params![entity_id, kind.as_str()], Self::row_to_alert)
            .optional()?;

        Ok(alert)
    }

    fn list_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM alerts ORDER BY detected_at DESC, id DESC LIMIT ?1",
            ALERT_COLUMNS
        ))?;

        let alerts = stmt
            .query_map(params![limit as i64], Self::row_to_alert)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use tempfile::TempDir;

    struct TestStore {
        store: SqliteSignalStore,
        _temp_dir: TempDir,
    }

    fn create_test_store() -> TestStore {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteSignalStore::new(temp_dir.path().join("signals.db")).unwrap();
        TestStore {
            store,
            _temp_dir: temp_dir,
        }
    }

    fn ids(pairs: &[(Platform, &str)]) -> BTreeMap<Platform, String> {
        pairs.iter().map(|(p, id)| (*p, id.to_string())).collect()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap()
    }

    fn entry(entity_id: i64, value: i64, observed_at: DateTime<Utc>) -> ChartEntry {
        ChartEntry {
            entity_id,
            platform: Platform::Chart,
            metric: MetricKind::ChartPosition,
            value: Some(value),
            observed_at,
            raw: json!({"rank": value}),
            anomalies: vec![],
        }
    }

    #[test]
    fn test_create_and_get_entity() {
        let test = create_test_store();
        let store = &test.store;

        let created = store
            .create_entity(
                EntityKind::Artist,
                "Boards of Canada",
                &ids(&[(Platform::Spotify, "sp1"), (Platform::LastFm, "mbid1")]),
            )
            .unwrap();

        let fetched = store.get_entity(created.id).unwrap().unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.platform_id(Platform::Spotify), Some("sp1"));
        assert!(store.get_entity(created.id + 100).unwrap().is_none());
    }

    #[test]
    fn test_list_entities_with_platform_skips_missing_and_invalid_ids() {
        let test = create_test_store();
        let store = &test.store;

        let a = store
            .create_entity(EntityKind::Artist, "A", &ids(&[(Platform::Spotify, "a")]))
            .unwrap();
        store
            .create_entity(EntityKind::Artist, "B", &ids(&[(Platform::LastFm, "b")]))
            .unwrap();
        let c = store
            .create_entity(EntityKind::Artist, "C", &ids(&[(Platform::Spotify, "c")]))
            .unwrap();
        store
            .create_entity(EntityKind::Track, "T", &ids(&[(Platform::Spotify, "t")]))
            .unwrap();

        let listed = store
            .list_entities_with_platform(EntityKind::Artist, Platform::Spotify)
            .unwrap();
        assert_eq!(
            listed.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![a.id, c.id]
        );

        store
            .mark_platform_id_invalid(c.id, Platform::Spotify, "404 not found")
            .unwrap();
        let listed = store
            .list_entities_with_platform(EntityKind::Artist, Platform::Spotify)
            .unwrap();
        assert_eq!(listed.len(), 1);

        store.set_platform_id(c.id, Platform::Spotify, "c2").unwrap();
        let listed = store
            .list_entities_with_platform(EntityKind::Artist, Platform::Spotify)
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].platform_id(Platform::Spotify), Some("c2"));
    }

    #[test]
    fn test_insert_snapshot_and_previous() {
        let test = create_test_store();
        let store = &test.store;
        let track = store
            .create_entity(EntityKind::Track, "T", &ids(&[(Platform::Chart, "x")]))
            .unwrap();

        let first = store.insert_snapshot(&entry(track.id, 12, t0())).unwrap().unwrap();
        let second = store
            .insert_snapshot(&entry(track.id, 5, t0() + Duration::hours(4)))
            .unwrap()
            .unwrap();
        assert!(second.id > first.id);

        let prev = store
            .previous_snapshot(
                track.id,
                Platform::Chart,
                MetricKind::ChartPosition,
                second.observed_at,
            )
            .unwrap()
            .unwrap();
        assert_eq!(prev.id, first.id);
        assert_eq!(prev.value, Some(12));
        assert_eq!(prev.raw, json!({"rank": 12}));

        assert!(store
            .previous_snapshot(
                track.id,
                Platform::Chart,
                MetricKind::ChartPosition,
                first.observed_at
            )
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_duplicate_observation_is_ignored() {
        let test = create_test_store();
        let store = &test.store;
        let track = store
            .create_entity(EntityKind::Track, "T", &BTreeMap::new())
            .unwrap();

        assert!(store.insert_snapshot(&entry(track.id, 3, t0())).unwrap().is_some());
        assert!(store.insert_snapshot(&entry(track.id, 4, t0())).unwrap().is_none());
        assert_eq!(store.count_snapshots(track.id).unwrap(), 1);
    }

    #[test]
    fn test_snapshot_anomalies_round_trip() {
        let test = create_test_store();
        let store = &test.store;
        let track = store
            .create_entity(EntityKind::Track, "T", &BTreeMap::new())
            .unwrap();

        let mut e = entry(track.id, 1, t0());
        e.anomalies = vec![Anomaly::PositionOutOfRange { reported: 0 }];
        store.insert_snapshot(&e).unwrap();

        let history = store.snapshot_history(track.id, t0()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].anomalies, e.anomalies);
    }

    #[test]
    fn test_recently_snapshotted_entities_order() {
        let test = create_test_store();
        let store = &test.store;

        let old = store
            .create_entity(EntityKind::Track, "Old", &BTreeMap::new())
            .unwrap();
        let new = store
            .create_entity(EntityKind::Track, "New", &BTreeMap::new())
            .unwrap();
        store
            .create_entity(EntityKind::Track, "Never", &BTreeMap::new())
            .unwrap();

        store.insert_snapshot(&entry(old.id, 9, t0())).unwrap();
        store
            .insert_snapshot(&entry(new.id, 9, t0() + Duration::hours(1)))
            .unwrap();

        let recent = store
            .recently_snapshotted_entities(EntityKind::Track, 10)
            .unwrap();
        assert_eq!(
            recent.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![new.id, old.id]
        );
        assert_eq!(
            store
                .recently_snapshotted_entities(EntityKind::Track, 1)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_alerts_latest_and_list() {
        let test = create_test_store();
        let store = &test.store;
        let track = store
            .create_entity(EntityKind::Track, "T", &BTreeMap::new())
            .unwrap();

        assert!(store
            .latest_alert(track.id, AlertKind::Viral)
            .unwrap()
            .is_none());

        for hours in [0, 2] {
            store
                .insert_alert(&NewAlert {
                    entity_id: track.id,
                    kind: AlertKind::Viral,
                    rule: "viral_signal".to_string(),
                    detected_at: t0() + Duration::hours(hours),
                    snapshot_id: Some(hours),
                    evidence: json!({"velocity_score": 665}),
                })
                .unwrap();
        }

        let latest = store
            .latest_alert(track.id, AlertKind::Viral)
            .unwrap()
            .unwrap();
        assert_eq!(latest.snapshot_id, Some(2));
        assert!(store
            .latest_alert(track.id, AlertKind::Trend)
            .unwrap()
            .is_none());

        let all = store.list_alerts(10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, latest.id);
    }
}
