use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Entities
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Artist,
    Track,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Artist => "artist",
            EntityKind::Track => "track",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "artist" => Some(EntityKind::Artist),
            "track" => Some(EntityKind::Track),
            _ => None,
        }
    }
}

/// External platforms signals are collected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Spotify,
    LastFm,
    Chart,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Spotify, Platform::LastFm, Platform::Chart];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Spotify => "spotify",
            Platform::LastFm => "lastfm",
            Platform::Chart => "chart",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spotify" => Some(Platform::Spotify),
            "lastfm" => Some(Platform::LastFm),
            "chart" => Some(Platform::Chart),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked artist or track.
///
/// Platform identifiers are optional; collectors skip entities that lack the
/// identifier for the platform they need, and identifiers flagged invalid after
/// a permanent source error are not returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub id: i64,
    pub kind: EntityKind,
    pub name: String,
    pub platform_ids: BTreeMap<Platform, String>,
}

impl Entity {
    pub fn platform_id(&self, platform: Platform) -> Option<&str> {
        self.platform_ids.get(&platform).map(String::as_str)
    }
}

// =============================================================================
// Observations
// =============================================================================

/// What a normalized value measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Rank on a chart, 1 is best.
    ChartPosition,
    /// Platform popularity score, 0-100.
    Popularity,
    Followers,
    Listeners,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::ChartPosition => "chart_position",
            MetricKind::Popularity => "popularity",
            MetricKind::Followers => "followers",
            MetricKind::Listeners => "listeners",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chart_position" => Some(MetricKind::ChartPosition),
            "popularity" => Some(MetricKind::Popularity),
            "followers" => Some(MetricKind::Followers),
            "listeners" => Some(MetricKind::Listeners),
            _ => None,
        }
    }

    /// Whether lower values are better (and velocity applies).
    pub fn is_rank(&self) -> bool {
        matches!(self, MetricKind::ChartPosition)
    }
}

/// Something the normalizer had to patch up while mapping a raw record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Anomaly {
    MissingMetric,
    UnparseableValue { value: String },
    PositionOutOfRange { reported: i64 },
    NegativeCount { reported: i64 },
}

/// A normalized observation of one entity on one platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartEntry {
    pub entity_id: i64,
    pub platform: Platform,
    pub metric: MetricKind,
    /// Missing only when the raw record carried no usable value.
    pub value: Option<i64>,
    pub observed_at: DateTime<Utc>,
    pub raw: serde_json::Value,
    pub anomalies: Vec<Anomaly>,
}

impl ChartEntry {
    pub fn position(&self) -> Option<i64> {
        if self.metric.is_rank() {
            self.value
        } else {
            None
        }
    }
}

/// A persisted, immutable [`ChartEntry`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub id: i64,
    #[serde(flatten)]
    pub entry: ChartEntry,
}

impl std::ops::Deref for Snapshot {
    type Target = ChartEntry;

    fn deref(&self) -> &ChartEntry {
        &self.entry
    }
}

// =============================================================================
// Alerts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Viral,
    Trend,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Viral => "viral",
            AlertKind::Trend => "trend",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "viral" => Some(AlertKind::Viral),
            "trend" => Some(AlertKind::Trend),
            _ => None,
        }
    }
}

/// An alert produced by a detection rule, not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewAlert {
    pub entity_id: i64,
    pub kind: AlertKind,
    pub rule: String,
    pub detected_at: DateTime<Utc>,
    /// The snapshot whose data triggered the rule.
    pub snapshot_id: Option<i64>,
    pub evidence: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: i64,
    #[serde(flatten)]
    pub alert: NewAlert,
}

impl std::ops::Deref for Alert {
    type Target = NewAlert;

    fn deref(&self) -> &NewAlert {
        &self.alert
    }
}
