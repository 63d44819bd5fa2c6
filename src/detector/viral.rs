//! Viral signal: a sharp chart climb or a popularity jump.

use super::rules::Candidate;
use crate::config::DetectorSettings;
use crate::signal_store::{AlertKind, MetricKind, Platform, Snapshot};
use crate::velocity::{velocity, Direction};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ViralSignalRule {
    /// Minimum velocity score of an upward chart move.
    pub velocity_threshold: i64,
    /// Minimum popularity points gained inside the window. 0 disables.
    pub popularity_gain_threshold: i64,
    pub lookback: Duration,
}

impl ViralSignalRule {
    pub const NAME: &'static str = "viral_signal";

    pub fn from_settings(settings: &DetectorSettings) -> Self {
        Self {
            velocity_threshold: settings.velocity_threshold,
            popularity_gain_threshold: settings.popularity_gain_threshold,
            lookback: Duration::hours(settings.lookback_hours as i64),
        }
    }

    /// The strongest candidate for one entity, if any.
    ///
    /// `history` is oldest first. It may start with the snapshot immediately
    /// preceding the window for a series, so a chart move is always measured
    /// against the previous observation even across the window edge.
    pub fn evaluate(&self, history: &[Snapshot], now: DateTime<Utc>) -> Vec<Candidate> {
        let window_start = now - self.lookback;

        let mut series: BTreeMap<(Platform, MetricKind), Vec<&Snapshot>> = BTreeMap::new();
        for snapshot in history {
            series
                .entry((snapshot.platform, snapshot.metric))
                .or_default()
                .push(snapshot);
        }

        let best = series
            .iter()
            .filter_map(|(&(platform, metric), points)| match metric {
                MetricKind::ChartPosition => self.chart_candidate(platform, points, window_start),
                MetricKind::Popularity => self.popularity_candidate(platform, points, window_start),
                _ => None,
            })
            .max_by(|a, b| a.strength.total_cmp(&b.strength));

        best.into_iter().collect()
    }

    fn chart_candidate(
        &self,
        platform: Platform,
        points: &[&Snapshot],
        window_start: DateTime<Utc>,
    ) -> Option<Candidate> {
        let [.., previous, latest] = points else {
            return None;
        };
        if latest.observed_at < window_start {
            return None;
        }
        let current = latest.position()?;
        let prior = previous.position()?;

        let metric = velocity(current, Some(prior));
        if metric.direction != Some(Direction::Up) || metric.velocity_score < self.velocity_threshold {
            return None;
        }

        Some(Candidate {
            kind: AlertKind::Viral,
            rule: Self::NAME,
            snapshot_id: latest.id,
            strength: metric.velocity_score as f64 / self.velocity_threshold.max(1) as f64,
            evidence: json!({
                "signal": "chart_velocity",
                "platform": platform,
                "previous_position": prior,
                "current_position": current,
                "previous_snapshot_id": previous.id,
                "observed_at": latest.observed_at.to_rfc3339(),
                "velocity": metric,
                "threshold": self.velocity_threshold,
            }),
        })
    }

    fn popularity_candidate(
        &self,
        platform: Platform,
        points: &[&Snapshot],
        window_start: DateTime<Utc>,
    ) -> Option<Candidate> {
        if self.popularity_gain_threshold <= 0 {
            return None;
        }

        let mut in_window = points
            .iter()
            .filter(|s| s.observed_at >= window_start)
            .filter_map(|s| s.value.map(|v| (*s, v)));
        let (first, first_value) = in_window.next()?;
        let (latest, latest_value) = in_window.last()?;

        let gain = latest_value - first_value;
        if gain < self.popularity_gain_threshold {
            return None;
        }

        Some(Candidate {
            kind: AlertKind::Viral,
            rule: Self::NAME,
            snapshot_id: latest.id,
            strength: gain as f64 / self.popularity_gain_threshold as f64,
            evidence: json!({
                "signal": "popularity_gain",
                "platform": platform,
                "from": first_value,
                "to": latest_value,
                "gain": gain,
                "since": first.observed_at.to_rfc3339(),
                "observed_at": latest.observed_at.to_rfc3339(),
                "threshold": self.popularity_gain_threshold,
            }),
        })
    }
}
