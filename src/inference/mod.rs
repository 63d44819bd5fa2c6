//! Classification boundary used to enrich alert evidence.
//!
//! The classifier is opaque to the detector: it sees an entity and its recent
//! snapshot history and may return a label with a confidence. Real model
//! backends plug in behind [`TrackClassifier`]; this crate ships a no-op and a
//! simple momentum heuristic.

use crate::config::{ClassifierKind, InferenceSettings};
use crate::signal_store::{Entity, Snapshot};
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub label: String,
    /// 0.0 to 1.0
    pub confidence: f64,
}

pub trait TrackClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// `history` is oldest first. `None` means no opinion.
    fn classify(&self, entity: &Entity, history: &[Snapshot]) -> Option<Classification>;
}

/// Classifier used when inference is disabled.
pub struct NoOpClassifier;

impl TrackClassifier for NoOpClassifier {
    fn name(&self) -> &'static str {
        "none"
    }

    fn classify(&self, _entity: &Entity, _history: &[Snapshot]) -> Option<Classification> {
        None
    }
}

/// Labels a chart trajectory by how consistently it has been climbing.
pub struct MomentumClassifier {
    min_points: usize,
}

impl MomentumClassifier {
    pub fn new() -> Self {
        Self { min_points: 3 }
    }
}

impl Default for MomentumClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackClassifier for MomentumClassifier {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn classify(&self, _entity: &Entity, history: &[Snapshot]) -> Option<Classification> {
        let positions: Vec<i64> = history.iter().filter_map(|s| s.position()).collect();
        if positions.len() < self.min_points {
            return None;
        }

        let steps = positions.len() - 1;
        let climbs = positions.windows(2).filter(|w| w[1] < w[0]).count();
        let ratio = climbs as f64 / steps as f64;

        let label = if climbs == steps {
            "breakout"
        } else if positions[positions.len() - 1] < positions[0] {
            "climbing"
        } else {
            "volatile"
        };

        Some(Classification {
            label: label.to_string(),
            confidence: (ratio * 100.0).round() / 100.0,
        })
    }
}

/// Initializes the configured classifier. Called once at startup.
pub fn load_classifier(settings: &InferenceSettings) -> Result<Arc<dyn TrackClassifier>> {
    match settings.classifier {
        ClassifierKind::None => {
            info!("Alert classification disabled");
            Ok(Arc::new(NoOpClassifier))
        }
        ClassifierKind::Momentum => {
            info!("Using momentum classifier for alert evidence");
            Ok(Arc::new(MomentumClassifier::new()))
        }
    }
}
