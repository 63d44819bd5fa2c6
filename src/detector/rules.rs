//! Detection rules and the candidates they produce.

use super::viral::ViralSignalRule;
use crate::signal_store::{AlertKind, Entity, Snapshot};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// A potential alert, before deduplication and persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub kind: AlertKind,
    pub rule: &'static str,
    /// Snapshot whose data triggered the rule.
    pub snapshot_id: i64,
    /// How far past its threshold the signal is (1.0 = exactly at threshold).
    pub strength: f64,
    pub evidence: Value,
}

/// Trend detectors that need clustering models this crate does not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingRule {
    SonicTrend,
    CulturalTrend,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectionRule {
    ViralSignal(ViralSignalRule),
    NotImplemented(PendingRule),
}

impl DetectionRule {
    pub fn name(&self) -> &'static str {
        match self {
            DetectionRule::ViralSignal(_) => ViralSignalRule::NAME,
            DetectionRule::NotImplemented(PendingRule::SonicTrend) => "sonic_trend",
            DetectionRule::NotImplemented(PendingRule::CulturalTrend) => "cultural_trend",
        }
    }

    pub fn alert_kind(&self) -> AlertKind {
        match self {
            DetectionRule::ViralSignal(_) => AlertKind::Viral,
            DetectionRule::NotImplemented(_) => AlertKind::Trend,
        }
    }

    /// Candidates for one entity. `history` is oldest first.
    pub fn evaluate(&self, entity: &Entity, history: &[Snapshot], now: DateTime<Utc>) -> Vec<Candidate> {
        match self {
            DetectionRule::ViralSignal(rule) => rule.evaluate(history, now),
            DetectionRule::NotImplemented(PendingRule::SonicTrend) => {
                detect_sonic_trends(entity, history)
            }
            DetectionRule::NotImplemented(PendingRule::CulturalTrend) => {
                detect_cultural_trends(entity, history)
            }
        }
    }
}

/// Always empty until a sonic clustering backend exists.
pub fn detect_sonic_trends(_entity: &Entity, _history: &[Snapshot]) -> Vec<Candidate> {
    Vec::new()
}

/// Always empty until a cultural clustering backend exists.
pub fn detect_cultural_trends(_entity: &Entity, _history: &[Snapshot]) -> Vec<Candidate> {
    Vec::new()
}
