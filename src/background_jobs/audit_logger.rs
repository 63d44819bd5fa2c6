//! Audit trail for job executions.
//!
//! Jobs record `started`, `progress`, `completed` and `failed` events with
//! JSON details into the job store. Audit writes never fail a job.

use crate::job_store::{JobAuditEventType, JobStore};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

pub struct JobAuditLogger {
    job_store: Arc<dyn JobStore>,
    job_id: String,
    start_time: Instant,
}

impl JobAuditLogger {
    pub fn new(job_store: Arc<dyn JobStore>, job_id: &str) -> Self {
        Self {
            job_store,
            job_id: job_id.to_string(),
            start_time: Instant::now(),
        }
    }

    fn write(
        &self,
        event_type: JobAuditEventType,
        duration_ms: Option<i64>,
        details: Option<&JsonValue>,
        error: Option<&str>,
    ) {
        if let Err(e) =
            self.job_store
                .log_job_audit(&self.job_id, event_type, duration_ms, details, error)
        {
            warn!(
                "Failed to write {} audit event for {}: {}",
                event_type.as_str(),
                self.job_id,
                e
            );
        }
    }

    pub fn log_started(&self, details: Option<JsonValue>) {
        self.write(JobAuditEventType::Started, None, details.as_ref(), None);
    }

    /// Logs completion with the run statistics as details.
    pub fn log_completed(&self, stats: &JsonValue) {
        self.write(
            JobAuditEventType::Completed,
            Some(self.elapsed_ms()),
            Some(stats),
            None,
        );
    }

    pub fn log_failed(&self, error: &str, details: Option<JsonValue>) {
        self.write(
            JobAuditEventType::Failed,
            Some(self.elapsed_ms()),
            details.as_ref(),
            Some(error),
        );
    }

    pub fn log_progress(&self, details: JsonValue) {
        self.write(JobAuditEventType::Progress, None, Some(&details), None);
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }
}
