use super::job::{BackgroundJob, JobError, JobSchedule};
use crate::job_store::{JobAuditEntry, JobRun, JobStore};
use anyhow::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};

/// Information about a registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub schedule: JobScheduleInfo,
    pub is_running: bool,
    /// A queued re-run is waiting for the current run to finish.
    pub is_pending: bool,
    pub last_run: Option<JobRunInfo>,
    pub next_run_at: Option<String>,
}

/// Serializable schedule information.
#[derive(Debug, Clone, Serialize)]
pub struct JobScheduleInfo {
    #[serde(rename = "type")]
    pub schedule_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Vec<String>>,
}

impl From<JobSchedule> for JobScheduleInfo {
    fn from(schedule: JobSchedule) -> Self {
        match schedule {
            JobSchedule::Cron(cron) => JobScheduleInfo {
                schedule_type: "cron".to_string(),
                cron: Some(cron.to_string()),
                value_secs: None,
                hooks: None,
            },
            JobSchedule::Interval(duration) => JobScheduleInfo {
                schedule_type: "interval".to_string(),
                value_secs: Some(duration.as_secs()),
                cron: None,
                hooks: None,
            },
            JobSchedule::Hook(event) => JobScheduleInfo {
                schedule_type: "hook".to_string(),
                hooks: Some(vec![event.to_string()]),
                value_secs: None,
                cron: None,
            },
            JobSchedule::Combined {
                cron,
                interval,
                hooks,
            } => JobScheduleInfo {
                schedule_type: "combined".to_string(),
                cron: cron.map(|c| c.to_string()),
                value_secs: interval.map(|d| d.as_secs()),
                hooks: Some(hooks.iter().map(|h| h.to_string()).collect()),
            },
        }
    }
}

/// Serializable job run information.
#[derive(Debug, Clone, Serialize)]
pub struct JobRunInfo {
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub triggered_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
}

impl From<JobRun> for JobRunInfo {
    fn from(run: JobRun) -> Self {
        JobRunInfo {
            started_at: run.started_at.to_rfc3339(),
            finished_at: run.finished_at.map(|dt| dt.to_rfc3339()),
            status: run.status.as_str().to_string(),
            error_message: run.error_message,
            triggered_by: run.triggered_by,
            stats: run.stats,
        }
    }
}

/// Command sent to the scheduler.
pub enum SchedulerCommand {
    TriggerJob {
        job_id: String,
        response: oneshot::Sender<Result<(), JobError>>,
    },
}

/// Shared state between scheduler and handle.
pub struct SharedJobState {
    pub jobs: HashMap<String, Arc<dyn BackgroundJob>>,
    /// Currently running job IDs
    pub running_jobs: HashSet<String>,
    /// Jobs with a queued re-run (`OverlapPolicy::Queue` only)
    pub pending_jobs: HashSet<String>,
}

impl SharedJobState {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            running_jobs: HashSet::new(),
            pending_jobs: HashSet::new(),
        }
    }
}

impl Default for SharedJobState {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to interact with the job scheduler while it runs.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    shared_state: Arc<RwLock<SharedJobState>>,
    job_store: Arc<dyn JobStore>,
}

impl SchedulerHandle {
    pub fn new(
        command_tx: mpsc::Sender<SchedulerCommand>,
        shared_state: Arc<RwLock<SharedJobState>>,
        job_store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            command_tx,
            shared_state,
            job_store,
        }
    }

    fn job_info(&self, state: &SharedJobState, job_id: &str, job: &dyn BackgroundJob) -> Result<JobInfo> {
        let last_run = self.job_store.get_last_run(job_id)?.map(JobRunInfo::from);
        let next_run_at = self
            .job_store
            .get_schedule_state(job_id)?
            .map(|s| s.next_run_at.to_rfc3339());

        Ok(JobInfo {
            id: job_id.to_string(),
            name: job.name().to_string(),
            description: job.description().to_string(),
            schedule: job.schedule().into(),
            is_running: state.running_jobs.contains(job_id),
            is_pending: state.pending_jobs.contains(job_id),
            last_run,
            next_run_at,
        })
    }

    /// Get information about all registered jobs, sorted by id.
    pub async fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        let state = self.shared_state.read().await;
        let mut jobs = Vec::with_capacity(state.jobs.len());
        for (job_id, job) in &state.jobs {
            jobs.push(self.job_info(&state, job_id, job.as_ref())?);
        }
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobInfo>> {
        let state = self.shared_state.read().await;
        match state.jobs.get(job_id) {
            Some(job) => Ok(Some(self.job_info(&state, job_id, job.as_ref())?)),
            None => Ok(None),
        }
    }

    /// Trigger a job manually.
    ///
    /// Fails with `JobError::AlreadyRunning` when the job is running and its
    /// overlap policy is `Skip`; with `Queue` a re-run is scheduled instead.
    pub async fn trigger_job(&self, job_id: &str) -> Result<(), JobError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(SchedulerCommand::TriggerJob {
                job_id: job_id.to_string(),
                response: response_tx,
            })
            .await
            .map_err(|_| JobError::failed("Scheduler not available"))?;

        response_rx
            .await
            .map_err(|_| JobError::failed("Scheduler did not respond"))?
    }

    pub fn get_job_history(&self, job_id: &str, limit: usize) -> Result<Vec<JobRunInfo>> {
        let history = self.job_store.get_job_history(job_id, limit)?;
        Ok(history.into_iter().map(JobRunInfo::from).collect())
    }

    pub async fn job_exists(&self, job_id: &str) -> bool {
        self.shared_state.read().await.jobs.contains_key(job_id)
    }

    pub fn get_job_audit_log_by_job(
        &self,
        job_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobAuditEntry>> {
        self.job_store.get_job_audit_log_by_job(job_id, limit, offset)
    }
}
