//! Maps raw platform records onto the common [`ChartEntry`] schema.
//!
//! Normalization never fails: anything odd about the raw payload is recorded
//! as an [`Anomaly`] on the entry and the observation is kept.

use crate::signal_store::{Anomaly, ChartEntry, EntityKind, MetricKind, Platform};
use crate::sources::RawRecord;
use serde_json::Value;

const RANK_PATHS: &[&str] = &["rank", "position"];
const FOLLOWER_PATHS: &[&str] = &["followers.total", "followers"];
const POPULARITY_PATHS: &[&str] = &["popularity"];
const LISTENER_PATHS: &[&str] = &["listeners", "stats.listeners"];

/// The metric a platform reports for an entity kind, and the payload paths
/// it may be found at, in preference order.
pub fn metric_for(platform: Platform, kind: EntityKind) -> (MetricKind, &'static [&'static str]) {
    match (platform, kind) {
        (Platform::Chart, _) => (MetricKind::ChartPosition, RANK_PATHS),
        (Platform::Spotify, EntityKind::Artist) => (MetricKind::Followers, FOLLOWER_PATHS),
        (Platform::Spotify, EntityKind::Track) => (MetricKind::Popularity, POPULARITY_PATHS),
        (Platform::LastFm, _) => (MetricKind::Listeners, LISTENER_PATHS),
    }
}

fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(payload, |value, key| value.get(key))
        .filter(|value| !value.is_null())
}

enum Parsed {
    Value(i64),
    Unparseable(String),
}

fn parse_number(value: &Value) -> Parsed {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Parsed::Value(i),
            None => match n.as_f64() {
                Some(f) if f.is_finite() => Parsed::Value(f.round() as i64),
                _ => Parsed::Unparseable(n.to_string()),
            },
        },
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(i) => Parsed::Value(i),
            Err(_) => Parsed::Unparseable(s.clone()),
        },
        other => Parsed::Unparseable(other.to_string()),
    }
}

pub fn normalize(entity_id: i64, raw: &RawRecord) -> ChartEntry {
    let (metric, paths) = metric_for(raw.platform, raw.kind);
    let mut anomalies = Vec::new();

    let value = match paths.iter().find_map(|path| lookup(&raw.payload, path)) {
        None => {
            anomalies.push(Anomaly::MissingMetric);
            None
        }
        Some(found) => match parse_number(found) {
            Parsed::Unparseable(value) => {
                anomalies.push(Anomaly::UnparseableValue { value });
                None
            }
            Parsed::Value(v) if metric.is_rank() && v < 1 => {
                anomalies.push(Anomaly::PositionOutOfRange { reported: v });
                Some(1)
            }
            Parsed::Value(v) if !metric.is_rank() && v < 0 => {
                anomalies.push(Anomaly::NegativeCount { reported: v });
                Some(0)
            }
            Parsed::Value(v) => Some(v),
        },
    };

    ChartEntry {
        entity_id,
        platform: raw.platform,
        metric,
        value,
        observed_at: raw.fetched_at,
        raw: raw.payload.clone(),
        anomalies,
    }
}
