//! SQLite schema definitions for the signals database.
//!
//! Entities and their platform identifiers, the append-only snapshot history
//! and the alerts raised from it. Timestamps are unix milliseconds so that
//! ordering by `observed_at` is a plain integer comparison.

use crate::sqlite_column;
use crate::sqlite_persistence::{ForeignKey, SqlType, Table, VersionedSchema};

const ENTITY_FK: ForeignKey = ForeignKey {
    foreign_table: "entities",
    foreign_column: "id",
};

// =============================================================================
// Version 1 - Entities, snapshots, alerts
// =============================================================================

const ENTITIES_TABLE_V1: Table = Table {
    name: "entities",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("last_snapshot_at", &SqlType::Integer),
    ],
    indices: &[("idx_entities_kind_last_snapshot", "kind, last_snapshot_at DESC")],
    unique_constraints: &[],
};

/// One row per (entity, platform). `invalid_reason` is set after a permanent
/// source error and cleared when the identifier is replaced.
const ENTITY_PLATFORM_IDS_TABLE_V1: Table = Table {
    name: "entity_platform_ids",
    columns: &[
        sqlite_column!(
            "entity_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ENTITY_FK)
        ),
        sqlite_column!("platform", &SqlType::Text, non_null = true),
        sqlite_column!("platform_id", &SqlType::Text, non_null = true),
        sqlite_column!("invalid_reason", &SqlType::Text),
        sqlite_column!("invalid_since", &SqlType::Integer),
    ],
    indices: &[("idx_entity_platform_ids_platform", "platform")],
    unique_constraints: &[&["entity_id", "platform"]],
};

const SNAPSHOTS_TABLE_V1: Table = Table {
    name: "snapshots",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "entity_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ENTITY_FK)
        ),
        sqlite_column!("platform", &SqlType::Text, non_null = true),
        sqlite_column!("metric", &SqlType::Text, non_null = true),
        sqlite_column!("value", &SqlType::Integer),
        sqlite_column!("observed_at", &SqlType::Integer, non_null = true),
        sqlite_column!("raw", &SqlType::Text, non_null = true),
        sqlite_column!("anomalies", &SqlType::Text),
    ],
    indices: &[(
        "idx_snapshots_entity_platform_observed",
        "entity_id, platform, metric, observed_at DESC",
    )],
    unique_constraints: &[&["entity_id", "platform", "observed_at"]],
};

const ALERTS_TABLE_V1: Table = Table {
    name: "alerts",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "entity_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ENTITY_FK)
        ),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("rule", &SqlType::Text, non_null = true),
        sqlite_column!("detected_at", &SqlType::Integer, non_null = true),
        sqlite_column!("snapshot_id", &SqlType::Integer),
        sqlite_column!("evidence", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_alerts_entity_kind_detected", "entity_id, kind, detected_at DESC"),
        ("idx_alerts_detected", "detected_at DESC"),
    ],
    unique_constraints: &[],
};

pub const SIGNAL_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[
        ENTITIES_TABLE_V1,
        ENTITY_PLATFORM_IDS_TABLE_V1,
        SNAPSHOTS_TABLE_V1,
        ALERTS_TABLE_V1,
    ],
    migration: None,
}];
