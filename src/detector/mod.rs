//! Trend and viral detection over collected snapshot history.
//!
//! A scan walks the most recently snapshotted entities of a cohort, evaluates
//! every rule against each entity's recent history and persists at most one
//! alert per entity and alert kind. Scans are safe to re-run: a candidate is
//! suppressed when the latest alert of its kind for the entity points at the
//! same snapshot or falls inside the dedup window.

mod rules;
mod viral;

pub use rules::{detect_cultural_trends, detect_sonic_trends, Candidate, DetectionRule, PendingRule};
pub use viral::ViralSignalRule;

use crate::config::DetectorSettings;
use crate::inference::TrackClassifier;
use crate::metrics;
use crate::signal_store::{Entity, EntityKind, NewAlert, SignalStore, Snapshot};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub tracks_scanned: usize,
    pub alerts_created: usize,
    pub alerts_suppressed: usize,
    pub errors: usize,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl ScanStats {
    /// Every scanned entity failed, which points at the store rather than the data.
    pub fn all_failed(&self) -> bool {
        self.tracks_scanned > 0 && self.errors >= self.tracks_scanned
    }
}

pub struct Detector {
    store: Arc<dyn SignalStore>,
    classifier: Arc<dyn TrackClassifier>,
    rules: Vec<DetectionRule>,
    lookback: Duration,
    /// `None` disables the time window.
    dedup_window: Option<Duration>,
}

/// The rule set used by scheduled scans.
pub fn default_rules(settings: &DetectorSettings) -> Vec<DetectionRule> {
    vec![
        DetectionRule::ViralSignal(ViralSignalRule::from_settings(settings)),
        DetectionRule::NotImplemented(PendingRule::SonicTrend),
        DetectionRule::NotImplemented(PendingRule::CulturalTrend),
    ]
}

impl Detector {
    pub fn new(
        store: Arc<dyn SignalStore>,
        classifier: Arc<dyn TrackClassifier>,
        settings: &DetectorSettings,
    ) -> Self {
        Self::with_rules(store, classifier, settings, default_rules(settings))
    }

    pub fn with_rules(
        store: Arc<dyn SignalStore>,
        classifier: Arc<dyn TrackClassifier>,
        settings: &DetectorSettings,
        rules: Vec<DetectionRule>,
    ) -> Self {
        Self {
            store,
            classifier,
            rules,
            lookback: Duration::hours(settings.lookback_hours as i64),
            dedup_window: (settings.dedup_window_hours > 0)
                .then(|| Duration::hours(settings.dedup_window_hours as i64)),
        }
    }

    /// Scans up to `limit` of the most recently snapshotted entities of `cohort`.
    ///
    /// Fails only when the cohort cannot be listed; per-entity failures are
    /// counted in `errors`.
    pub fn scan(
        &self,
        cohort: EntityKind,
        limit: usize,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ScanStats> {
        let entities = self
            .store
            .recently_snapshotted_entities(cohort, limit)
            .with_context(|| format!("Failed to list {} cohort", cohort.as_str()))?;

        info!(
            "Scanning {} {} entities with {} rules",
            entities.len(),
            cohort.as_str(),
            self.rules.len()
        );

        let mut stats = ScanStats::default();
        for entity in &entities {
            if cancel.is_cancelled() {
                info!("Scan cancelled after {} entities", stats.tracks_scanned);
                stats.cancelled = true;
                break;
            }
            stats.tracks_scanned += 1;
            if let Err(e) = self.scan_entity(entity, now, &mut stats) {
                error!("Detection failed for entity {}: {:#}", entity.id, e);
                stats.errors += 1;
            }
        }

        Ok(stats)
    }

    fn scan_entity(&self, entity: &Entity, now: DateTime<Utc>, stats: &mut ScanStats) -> Result<()> {
        let history = self.load_history(entity.id, now)?;
        if history.is_empty() {
            return Ok(());
        }

        let mut best: HashMap<_, Candidate> = HashMap::new();
        for rule in &self.rules {
            for candidate in rule.evaluate(entity, &history, now) {
                let stronger = best
                    .get(&candidate.kind)
                    .map_or(true, |current| candidate.strength > current.strength);
                if stronger {
                    best.insert(candidate.kind, candidate);
                }
            }
        }

        for candidate in best.into_values() {
            if self.is_duplicate(entity.id, &candidate, now)? {
                debug!(
                    "Suppressed {} alert for entity {} (snapshot {})",
                    candidate.kind.as_str(),
                    entity.id,
                    candidate.snapshot_id
                );
                stats.alerts_suppressed += 1;
                continue;
            }

            let alert = self.store.insert_alert(&NewAlert {
                entity_id: entity.id,
                kind: candidate.kind,
                rule: candidate.rule.to_string(),
                detected_at: now,
                snapshot_id: Some(candidate.snapshot_id),
                evidence: self.enrich(entity, &history, candidate.evidence),
            })?;
            metrics::record_alert(alert.kind);
            info!(
                "Raised {} alert {} for {} ({}): {}",
                alert.kind.as_str(),
                alert.id,
                entity.name,
                entity.id,
                alert.evidence
            );
            stats.alerts_created += 1;
        }

        Ok(())
    }

    /// Window history, plus the snapshot right before the window for every
    /// series that has one, oldest first.
    fn load_history(&self, entity_id: i64, now: DateTime<Utc>) -> Result<Vec<Snapshot>> {
        let mut history = self.store.snapshot_history(entity_id, now - self.lookback)?;

        let mut oldest_per_series = BTreeMap::new();
        for snapshot in &history {
            oldest_per_series
                .entry((snapshot.platform, snapshot.metric))
                .or_insert(snapshot.observed_at);
        }

        let mut preceding = Vec::new();
        for ((platform, metric), oldest) in oldest_per_series {
            if metric.is_rank() {
                if let Some(previous) =
                    self.store
                        .previous_snapshot(entity_id, platform, metric, oldest)?
                {
                    preceding.push(previous);
                }
            }
        }

        if !preceding.is_empty() {
            preceding.append(&mut history);
            history = preceding;
            history.sort_by_key(|s| (s.observed_at, s.id));
        }
        Ok(history)
    }

    fn is_duplicate(&self, entity_id: i64, candidate: &Candidate, now: DateTime<Utc>) -> Result<bool> {
        let Some(latest) = self.store.latest_alert(entity_id, candidate.kind)? else {
            return Ok(false);
        };
        if latest.snapshot_id == Some(candidate.snapshot_id) {
            return Ok(true);
        }
        Ok(self
            .dedup_window
            .is_some_and(|window| now - latest.detected_at < window))
    }

    fn enrich(&self, entity: &Entity, history: &[Snapshot], mut evidence: serde_json::Value) -> serde_json::Value {
        if let Some(classification) = self.classifier.classify(entity, history) {
            evidence["classification"] = serde_json::json!({
                "model": self.classifier.name(),
                "label": classification.label,
                "confidence": classification.confidence,
            });
        }
        evidence
    }
}
