//! Shared run logic for the snapshot collection jobs.

use crate::background_jobs::{context::JobContext, job::JobError, JobAuditLogger};
use crate::collector::SnapshotCollector;
use crate::config::CollectorSettings;
use crate::signal_store::{EntityKind, Platform};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::{info, warn};

/// Collects one snapshot per (entity, platform) and turns the outcome into a
/// job result.
///
/// The run fails when the entities cannot be listed or when every snapshot
/// write failed. Source errors on individual entities never fail the run.
pub(super) fn run_collection(
    job_id: &str,
    ctx: &JobContext,
    settings: &CollectorSettings,
    kind: EntityKind,
    platforms: &[Platform],
) -> Result<JsonValue, JobError> {
    let audit = JobAuditLogger::new(Arc::clone(&ctx.job_store), job_id);
    audit.log_started(Some(json!({
        "kind": kind.as_str(),
        "platforms": platforms.iter().map(Platform::as_str).collect::<Vec<_>>(),
    })));

    let collector = SnapshotCollector::new(
        Arc::clone(&ctx.signal_store),
        ctx.sources.clone(),
        settings,
    );

    let stats = match collector.collect(kind, platforms, &ctx.cancellation_token) {
        Ok(stats) => stats,
        Err(e) => {
            let error_msg = format!("{:#}", e);
            audit.log_failed(&error_msg, None);
            return Err(JobError::failed(error_msg));
        }
    };
    let stats_json = serde_json::to_value(&stats).unwrap_or_default();

    if stats.cancelled {
        warn!("{} cancelled after {} entities", job_id, stats.entities_processed);
        audit.log_failed("Cancelled", Some(stats_json.clone()));
        return Err(JobError::Cancelled {
            stats: Some(stats_json),
        });
    }

    if stats.all_writes_failed() {
        let error_msg = format!(
            "All {} snapshot writes failed",
            stats.persistence_errors
        );
        audit.log_failed(&error_msg, Some(stats_json.clone()));
        return Err(JobError::ExecutionFailed {
            message: error_msg,
            stats: Some(stats_json),
        });
    }

    info!(
        "{} done: {} entities, {} snapshots, {} errors",
        job_id, stats.entities_processed, stats.snapshots_created, stats.errors
    );
    audit.log_completed(&stats_json);
    Ok(stats_json)
}
