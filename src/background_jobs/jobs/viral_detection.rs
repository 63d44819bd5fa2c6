//! Scans recently snapshotted tracks for viral signals.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobSchedule, OverlapPolicy},
    JobAuditLogger,
};
use crate::config::DetectorSettings;
use crate::detector::Detector;
use crate::signal_store::EntityKind;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::info;

pub struct ViralDetectionJob {
    schedule: JobSchedule,
    settings: DetectorSettings,
}

impl ViralDetectionJob {
    pub const ID: &'static str = "detect_viral";

    pub fn new(schedule: JobSchedule, settings: DetectorSettings) -> Self {
        Self { schedule, settings }
    }
}

impl BackgroundJob for ViralDetectionJob {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn name(&self) -> &'static str {
        "Viral Detection"
    }

    fn description(&self) -> &'static str {
        "Raises viral alerts for tracks with sharp chart climbs or popularity jumps"
    }

    fn schedule(&self) -> JobSchedule {
        self.schedule.clone()
    }

    /// A scan requested while one is running still sees the newest snapshots.
    fn overlap_policy(&self) -> OverlapPolicy {
        OverlapPolicy::Queue
    }

    fn execute(&self, ctx: &JobContext) -> Result<JsonValue, JobError> {
        let audit = JobAuditLogger::new(Arc::clone(&ctx.job_store), self.id());
        audit.log_started(Some(json!({
            "cohort_limit": self.settings.cohort_limit,
            "lookback_hours": self.settings.lookback_hours,
            "classifier": ctx.classifier.name(),
        })));

        let detector = Detector::new(
            Arc::clone(&ctx.signal_store),
            Arc::clone(&ctx.classifier),
            &self.settings,
        );
        let stats = detector
            .scan(
                EntityKind::Track,
                self.settings.cohort_limit,
                Utc::now(),
                &ctx.cancellation_token,
            )
            .map_err(|e| {
                let error_msg = format!("{:#}", e);
                audit.log_failed(&error_msg, None);
                JobError::failed(error_msg)
            })?;
        let stats_json = serde_json::to_value(&stats).unwrap_or_default();

        if stats.cancelled {
            audit.log_failed("Cancelled", Some(stats_json.clone()));
            return Err(JobError::Cancelled {
                stats: Some(stats_json),
            });
        }

        if stats.all_failed() {
            let error_msg = format!("Detection failed for all {} tracks", stats.tracks_scanned);
            audit.log_failed(&error_msg, Some(stats_json.clone()));
            return Err(JobError::ExecutionFailed {
                message: error_msg,
                stats: Some(stats_json),
            });
        }

        info!(
            "Viral scan done: {} tracks, {} alerts, {} suppressed",
            stats.tracks_scanned, stats.alerts_created, stats.alerts_suppressed
        );
        audit.log_completed(&stats_json);
        Ok(stats_json)
    }
}
