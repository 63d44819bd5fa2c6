//! Snapshot collection.
//!
//! One entity/platform pair is one unit of work: fetch through the platform's
//! adapter, normalize, persist in its own transaction. Unit failures are
//! counted into [`CollectionStats`] and never abort the run.

use crate::config::CollectorSettings;
use crate::metrics;
use crate::normalizer::normalize;
use crate::signal_store::{Entity, EntityKind, Platform, SignalStore, Snapshot};
use crate::sources::{RetryPolicy, SourceAdapter, SourceError, SourceRegistry};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one entity/platform unit.
#[derive(Debug)]
pub enum UnitOutcome {
    Created(Snapshot),
    /// The same observation was already stored by an earlier run.
    AlreadyRecorded,
    /// The platform had nothing for this id this cycle.
    Empty,
    /// No adapter or no platform id.
    Skipped,
    SourceFailed(SourceError),
    PersistFailed(anyhow::Error),
}

impl UnitOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, UnitOutcome::SourceFailed(_) | UnitOutcome::PersistFailed(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    pub entities_processed: usize,
    pub snapshots_created: usize,
    pub already_recorded: usize,
    pub skipped: usize,
    pub empty: usize,
    pub transient_errors: usize,
    pub permanent_errors: usize,
    pub persistence_errors: usize,
    /// (entity, platform) units that ended in any error. An entity failing on
    /// two platforms counts twice here.
    pub errors: usize,
    /// Distinct entities with at least one failed unit.
    pub entities_failed: usize,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl CollectionStats {
    fn record(&mut self, outcome: &UnitOutcome) {
        match outcome {
            UnitOutcome::Created(_) => self.snapshots_created += 1,
            UnitOutcome::AlreadyRecorded => self.already_recorded += 1,
            UnitOutcome::Empty => self.empty += 1,
            UnitOutcome::Skipped => self.skipped += 1,
            UnitOutcome::SourceFailed(e) => {
                if e.is_transient() {
                    self.transient_errors += 1;
                } else {
                    self.permanent_errors += 1;
                }
                self.errors += 1;
            }
            UnitOutcome::PersistFailed(_) => {
                self.persistence_errors += 1;
                self.errors += 1;
            }
        }
    }

    /// Writes were attempted and none of them went through.
    pub fn all_writes_failed(&self) -> bool {
        self.persistence_errors > 0 && self.snapshots_created == 0 && self.already_recorded == 0
    }
}

/// Sleeps for `duration` unless cancelled first. Returns false on cancellation.
fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}

pub struct SnapshotCollector {
    store: Arc<dyn SignalStore>,
    sources: SourceRegistry,
    retry: RetryPolicy,
    pacing: Duration,
}

impl SnapshotCollector {
    pub fn new(
        store: Arc<dyn SignalStore>,
        sources: SourceRegistry,
        settings: &CollectorSettings,
    ) -> Self {
        Self {
            store,
            sources,
            retry: RetryPolicy::new(settings),
            pacing: Duration::from_millis(settings.pacing_delay_ms),
        }
    }

    /// Collects snapshots for every entity of `kind` that has an id on each of
    /// `platforms`.
    ///
    /// Fails only when the entity listing itself fails. A cancelled run
    /// returns the stats so far with `cancelled` set; no unit is left half-written.
    pub fn collect(
        &self,
        kind: EntityKind,
        platforms: &[Platform],
        cancel: &CancellationToken,
    ) -> Result<CollectionStats> {
        let mut stats = CollectionStats::default();
        let mut processed = BTreeSet::new();
        let mut failed = BTreeSet::new();
        let mut first_call = true;

        for &platform in platforms {
            let entities = self
                .store
                .list_entities_with_platform(kind, platform)
                .with_context(|| format!("Failed to list {} entities for {}", kind.as_str(), platform))?;

            let Some(adapter) = self.sources.get(platform) else {
                if !entities.is_empty() {
                    warn!(
                        "No {} adapter configured, skipping {} {} entities",
                        platform,
                        entities.len(),
                        kind.as_str()
                    );
                }
                stats.skipped += entities.len();
                continue;
            };

            info!(
                "Collecting {} snapshots for {} {} entities",
                platform,
                entities.len(),
                kind.as_str()
            );

            for entity in &entities {
                let paced = first_call || self.pacing.is_zero() || pause(cancel, self.pacing);
                if !paced || cancel.is_cancelled() {
                    info!("Collection cancelled after {} entities", processed.len());
                    stats.cancelled = true;
                    stats.entities_processed = processed.len();
                    stats.entities_failed = failed.len();
                    return Ok(stats);
                }
                first_call = false;

                processed.insert(entity.id);
                let outcome = self.collect_unit(entity, platform, adapter.as_ref(), cancel);
                if outcome.is_error() {
                    failed.insert(entity.id);
                }
                stats.record(&outcome);
            }
        }

        stats.entities_processed = processed.len();
        stats.entities_failed = failed.len();
        Ok(stats)
    }

    fn collect_unit(
        &self,
        entity: &Entity,
        platform: Platform,
        adapter: &dyn SourceAdapter,
        cancel: &CancellationToken,
    ) -> UnitOutcome {
        let Some(platform_id) = entity.platform_id(platform) else {
            return UnitOutcome::Skipped;
        };

        let mut retry_count = 0;
        let raw = loop {
            match adapter.fetch(entity.kind, platform_id) {
                Ok(Some(raw)) => break raw,
                Ok(None) => {
                    debug!("No {} data for entity {} ({})", platform, entity.id, platform_id);
                    return UnitOutcome::Empty;
                }
                Err(e) if self.retry.should_retry(&e, retry_count) => {
                    let backoff = self.retry.backoff(retry_count);
                    debug!(
                        "Retrying {} fetch for entity {} in {:?} ({}): {}",
                        platform,
                        entity.id,
                        backoff,
                        retry_count + 1,
                        e
                    );
                    if !pause(cancel, backoff) {
                        return self.source_failed(entity, platform, e);
                    }
                    retry_count += 1;
                }
                Err(e) => return self.source_failed(entity, platform, e),
            }
        };

        let entry = normalize(entity.id, &raw);
        if !entry.anomalies.is_empty() {
            debug!(
                "Entity {} {} observation has anomalies: {:?}",
                entity.id, platform, entry.anomalies
            );
        }

        match self.store.insert_snapshot(&entry) {
            Ok(Some(snapshot)) => {
                metrics::record_snapshot(platform);
                debug!(
                    "Stored {} snapshot {} for entity {} ({} = {:?})",
                    platform,
                    snapshot.id,
                    entity.id,
                    snapshot.metric.as_str(),
                    snapshot.value
                );
                UnitOutcome::Created(snapshot)
            }
            Ok(None) => {
                debug!(
                    "Entity {} {} observation at {} already recorded",
                    entity.id,
                    platform,
                    entry.observed_at.to_rfc3339()
                );
                UnitOutcome::AlreadyRecorded
            }
            Err(e) => {
                error!(
                    "Failed to persist snapshot (entity {}, {}, observed_at {}): {:#}",
                    entity.id,
                    platform,
                    entry.observed_at.to_rfc3339(),
                    e
                );
                UnitOutcome::PersistFailed(e)
            }
        }
    }

    fn source_failed(&self, entity: &Entity, platform: Platform, e: SourceError) -> UnitOutcome {
        metrics::record_source_error(platform, e.kind_label());
        warn!("{} fetch failed for entity {} ({}): {}", platform, entity.id, entity.name, e);

        if !e.is_transient() {
            if let Err(mark_err) =
                self.store
                    .mark_platform_id_invalid(entity.id, platform, &e.to_string())
            {
                error!(
                    "Failed to flag {} id of entity {} as invalid: {:#}",
                    platform, entity.id, mark_err
                );
            }
        }
        UnitOutcome::SourceFailed(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal_store::{MetricKind, SqliteSignalStore};
    use crate::sources::RawRecord;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    type Script = Box<dyn Fn(&str, usize) -> Result<Option<Value>, SourceError> + Send + Sync>;

    /// Answers from a closure of (platform id, call number).
    struct ScriptedAdapter {
        platform: Platform,
        fetched_at: DateTime<Utc>,
        calls: Mutex<BTreeMap<String, usize>>,
        total_calls: AtomicUsize,
        script: Script,
    }

    impl ScriptedAdapter {
        fn new(
            platform: Platform,
            script: impl Fn(&str, usize) -> Result<Option<Value>, SourceError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                platform,
                fetched_at: Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap(),
                calls: Mutex::new(BTreeMap::new()),
                total_calls: AtomicUsize::new(0),
                script: Box::new(script),
            }
        }
    }

    impl SourceAdapter for ScriptedAdapter {
        fn platform(&self) -> Platform {
            self.platform
        }

        fn fetch(&self, kind: EntityKind, platform_id: &str) -> Result<Option<RawRecord>, SourceError> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(platform_id.to_string()).or_insert(0);
                *n += 1;
                *n
            };
            Ok((self.script)(platform_id, call)?.map(|payload| RawRecord {
                platform: self.platform,
                kind,
                platform_id: platform_id.to_string(),
                fetched_at: self.fetched_at,
                payload,
            }))
        }
    }

    struct Fixture {
        _temp_dir: TempDir,
        store: Arc<SqliteSignalStore>,
        tracks: Vec<Entity>,
    }

    fn fixture(chart_ids: &[&str]) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteSignalStore::new(temp_dir.path().join("signals.db")).unwrap());
        let tracks = chart_ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let mut ids = BTreeMap::new();
                ids.insert(Platform::Chart, id.to_string());
                store
                    .create_entity(EntityKind::Track, &format!("Track {}", i), &ids)
                    .unwrap()
            })
            .collect();
        Fixture {
            _temp_dir: temp_dir,
            store,
            tracks,
        }
    }

    fn settings(max_retries: u32) -> CollectorSettings {
        CollectorSettings {
            pacing_delay_ms: 0,
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..Default::default()
        }
    }

    fn collector(f: &Fixture, adapter: Arc<ScriptedAdapter>, max_retries: u32) -> SnapshotCollector {
        let mut sources = SourceRegistry::new();
        sources.register(adapter);
        SnapshotCollector::new(f.store.clone(), sources, &settings(max_retries))
    }

    #[test]
    fn test_failing_entity_does_not_affect_others() {
        let f = fixture(&["a", "bad", "c"]);
        let adapter = Arc::new(ScriptedAdapter::new(Platform::Chart, |id, _| match id {
            "bad" => Err(SourceError::permanent(Platform::Chart, "unknown id")),
            "a" => Ok(Some(json!({"rank": 4}))),
            _ => Ok(Some(json!({"rank": 9}))),
        }));
        let collector = collector(&f, adapter, 2);

        let stats = collector
            .collect(EntityKind::Track, &[Platform::Chart], &CancellationToken::new())
            .unwrap();

        assert_eq!(stats.entities_processed, 3);
        assert_eq!(stats.snapshots_created, 2);
        assert_eq!(stats.permanent_errors, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.entities_failed, 1);
        assert!(!stats.all_writes_failed());
        assert_eq!(f.store.count_snapshots(f.tracks[0].id).unwrap(), 1);
        assert_eq!(f.store.count_snapshots(f.tracks[1].id).unwrap(), 0);
        assert_eq!(f.store.count_snapshots(f.tracks[2].id).unwrap(), 1);

        // The bad id is flagged and left out of the next listing.
        let listed = f
            .store
            .list_entities_with_platform(EntityKind::Track, Platform::Chart)
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|e| e.id != f.tracks[1].id));
    }

    #[test]
    fn test_entity_failing_on_two_platforms_counts_once() {
        let f = fixture(&["a"]);
        let mut ids = BTreeMap::new();
        ids.insert(Platform::Chart, "broken".to_string());
        ids.insert(Platform::Spotify, "broken".to_string());
        let broken = f
            .store
            .create_entity(EntityKind::Track, "Broken", &ids)
            .unwrap();

        let failing = |id: &str, _: usize| match id {
            "broken" => Err(SourceError::transient(Platform::Chart, "HTTP 503")),
            _ => Ok(Some(json!({"rank": 3, "popularity": 40}))),
        };
        let mut sources = SourceRegistry::new();
        sources.register(Arc::new(ScriptedAdapter::new(Platform::Chart, failing)));
        sources.register(Arc::new(ScriptedAdapter::new(Platform::Spotify, failing)));
        let collector = SnapshotCollector::new(f.store.clone(), sources, &settings(0));

        let stats = collector
            .collect(
                EntityKind::Track,
                &[Platform::Chart, Platform::Spotify],
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(stats.entities_processed, 2);
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.entities_failed, 1);
        assert_eq!(f.store.count_snapshots(broken.id).unwrap(), 0);
        assert_eq!(f.store.count_snapshots(f.tracks[0].id).unwrap(), 1);
    }

    #[test]
    fn test_transient_error_is_retried_within_run() {
        let f = fixture(&["a"]);
        let adapter = Arc::new(ScriptedAdapter::new(Platform::Chart, |_, call| {
            if call == 1 {
                Err(SourceError::transient(Platform::Chart, "HTTP 503"))
            } else {
                Ok(Some(json!({"rank": 2})))
            }
        }));
        let collector = collector(&f, adapter.clone(), 2);

        let stats = collector
            .collect(EntityKind::Track, &[Platform::Chart], &CancellationToken::new())
            .unwrap();

        assert_eq!(adapter.total_calls.load(Ordering::SeqCst), 2);
        assert_eq!(stats.snapshots_created, 1);
        assert_eq!(stats.transient_errors, 0);
    }

    #[test]
    fn test_transient_error_gives_up_after_max_retries() {
        let f = fixture(&["a"]);
        let adapter = Arc::new(ScriptedAdapter::new(Platform::Chart, |_, _| {
            Err(SourceError::transient(Platform::Chart, "HTTP 429"))
        }));
        let collector = collector(&f, adapter.clone(), 1);

        let stats = collector
            .collect(EntityKind::Track, &[Platform::Chart], &CancellationToken::new())
            .unwrap();

        assert_eq!(adapter.total_calls.load(Ordering::SeqCst), 2);
        assert_eq!(stats.transient_errors, 1);
        assert_eq!(stats.errors, 1);
        // Transient failures keep the id usable for the next cadence.
        assert_eq!(
            f.store
                .list_entities_with_platform(EntityKind::Track, Platform::Chart)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_rerun_with_same_observation_is_idempotent() {
        let f = fixture(&["a", "b"]);
        let adapter = Arc::new(ScriptedAdapter::new(Platform::Chart, |_, _| {
            Ok(Some(json!({"rank": 7})))
        }));
        let collector = collector(&f, adapter, 0);
        let cancel = CancellationToken::new();

        let first = collector.collect(EntityKind::Track, &[Platform::Chart], &cancel).unwrap();
        let second = collector.collect(EntityKind::Track, &[Platform::Chart], &cancel).unwrap();

        assert_eq!(first.snapshots_created, 2);
        assert_eq!(second.snapshots_created, 0);
        assert_eq!(second.already_recorded, 2);
        assert_eq!(second.errors, 0);
        assert_eq!(f.store.count_snapshots(f.tracks[0].id).unwrap(), 1);
    }

    #[test]
    fn test_empty_and_missing_adapter() {
        let f = fixture(&["not-charting"]);
        let adapter = Arc::new(ScriptedAdapter::new(Platform::Chart, |_, _| Ok(None)));
        let collector = collector(&f, adapter, 0);

        let mut ids = BTreeMap::new();
        ids.insert(Platform::Spotify, "sp1".to_string());
        f.store
            .create_entity(EntityKind::Track, "Spotify only", &ids)
            .unwrap();

        let stats = collector
            .collect(
                EntityKind::Track,
                &[Platform::Chart, Platform::Spotify],
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(stats.empty, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.snapshots_created, 0);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_cancelled_run_stops_before_next_unit() {
        let f = fixture(&["a", "b"]);
        let adapter = Arc::new(ScriptedAdapter::new(Platform::Chart, |_, _| {
            Ok(Some(json!({"rank": 1})))
        }));
        let collector = collector(&f, adapter.clone(), 0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = collector.collect(EntityKind::Track, &[Platform::Chart], &cancel).unwrap();

        assert!(stats.cancelled);
        assert_eq!(adapter.total_calls.load(Ordering::SeqCst), 0);
        assert_eq!(stats.snapshots_created, 0);
    }

    #[test]
    fn test_anomalous_payload_is_still_stored() {
        let f = fixture(&["a"]);
        let adapter = Arc::new(ScriptedAdapter::new(Platform::Chart, |_, _| {
            Ok(Some(json!({"rank": 0})))
        }));
        let collector = collector(&f, adapter, 0);

        let stats = collector
            .collect(EntityKind::Track, &[Platform::Chart], &CancellationToken::new())
            .unwrap();
        assert_eq!(stats.snapshots_created, 1);

        let history = f
            .store
            .snapshot_history(f.tracks[0].id, DateTime::<Utc>::UNIX_EPOCH)
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].metric, MetricKind::ChartPosition);
        assert_eq!(history[0].value, Some(1));
        assert!(!history[0].anomalies.is_empty());
    }

    #[test]
    fn test_all_writes_failed() {
        let stats = CollectionStats {
            persistence_errors: 3,
            errors: 3,
            ..Default::default()
        };
        assert!(stats.all_writes_failed());

        let partial = CollectionStats {
            persistence_errors: 1,
            snapshots_created: 1,
            ..Default::default()
        };
        assert!(!partial.all_writes_failed());
        assert!(!CollectionStats::default().all_writes_failed());
    }
}
