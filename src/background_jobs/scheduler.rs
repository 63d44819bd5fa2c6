use super::context::JobContext;
use super::handle::{SchedulerCommand, SchedulerHandle, SharedJobState};
use super::job::{BackgroundJob, HookEvent, JobError, JobSchedule, OverlapPolicy, ShutdownBehavior};
use crate::job_store::{JobRunStatus, JobScheduleState, JobStore};
use crate::metrics;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on how long the loop sleeps without re-checking schedules.
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// How long shutdown waits for each running job.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Next firing of a time-based schedule after `after`, earliest of cron and interval.
pub fn compute_next_run(schedule: &JobSchedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let from_interval = schedule
        .interval()
        .map(|interval| after + chrono::Duration::from_std(interval).unwrap_or_default());
    let from_cron = schedule.cron().and_then(|cron| cron.next_after(after));

    match (from_interval, from_cron) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Manages background job scheduling and execution.
pub struct JobScheduler {
    /// Shared state accessible by SchedulerHandle
    shared_state: Arc<RwLock<SharedJobState>>,

    /// Task handles of running jobs, owned by the scheduler loop.
    running_handles: HashMap<String, JoinHandle<()>>,

    /// Cancellation tokens for each running job.
    job_cancel_tokens: HashMap<String, CancellationToken>,

    job_store: Arc<dyn JobStore>,

    /// Receiver for commands from SchedulerHandle
    command_receiver: mpsc::Receiver<SchedulerCommand>,

    /// Job tasks report their id here when they finish.
    completion_sender: mpsc::UnboundedSender<String>,
    completion_receiver: mpsc::UnboundedReceiver<String>,

    /// Token to signal scheduler shutdown.
    shutdown_token: CancellationToken,

    /// Shared context provided to jobs during execution.
    job_context: JobContext,
}

impl JobScheduler {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        command_receiver: mpsc::Receiver<SchedulerCommand>,
        shutdown_token: CancellationToken,
        job_context: JobContext,
        shared_state: Arc<RwLock<SharedJobState>>,
    ) -> Self {
        let (completion_sender, completion_receiver) = mpsc::unbounded_channel();
        Self {
            shared_state,
            running_handles: HashMap::new(),
            job_cancel_tokens: HashMap::new(),
            job_store,
            command_receiver,
            completion_sender,
            completion_receiver,
            shutdown_token,
            job_context,
        }
    }

    /// Register a job with the scheduler. Registering an existing id replaces it.
    pub async fn register_job(&mut self, job: Arc<dyn BackgroundJob>) {
        let job_id = job.id().to_string();
        let schedule = job.schedule();

        // A persisted next run computed from an older, slower cadence is pulled in.
        if let Some(next) = compute_next_run(&schedule, Utc::now()) {
            if let Ok(Some(state)) = self.job_store.get_schedule_state(&job_id) {
                if state.next_run_at > next {
                    let state = JobScheduleState {
                        next_run_at: next,
                        ..state
                    };
                    if let Err(e) = self.job_store.update_schedule_state(&state) {
                        warn!("Failed to reset schedule state for {}: {}", job_id, e);
                    }
                }
            }
        }

        let mut state = self.shared_state.write().await;
        if state.jobs.insert(job_id.clone(), job.clone()).is_some() {
            info!("Replacing job registration: {}", job_id);
        } else {
            info!("Registering job: {} - {}", job_id, job.description());
        }
    }

    pub async fn job_count(&self) -> usize {
        self.shared_state.read().await.jobs.len()
    }

    /// Main scheduler loop.
    pub async fn run(&mut self) {
        let job_count = self.job_count().await;
        info!("Starting job scheduler with {} registered jobs", job_count);

        match self.job_store.mark_stale_jobs_failed() {
            Ok(count) if count > 0 => {
                info!("Marked {} stale jobs as failed from previous run", count);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to mark stale jobs: {}", e);
            }
        }

        self.trigger_jobs_for_hook(HookEvent::OnStartup).await;

        loop {
            let sleep_duration = self.time_until_next_scheduled_job().await;
            debug!(
                "Scheduler sleeping for {:?} until next scheduled job",
                sleep_duration
            );

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {
                    self.run_due_jobs().await;
                }
                Some(job_id) = self.completion_receiver.recv() => {
                    self.on_job_finished(&job_id).await;
                }
                Some(cmd) = self.command_receiver.recv() => {
                    self.handle_command(cmd).await;
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    self.shutdown().await;
                    break;
                }
            }
        }

        info!("Job scheduler stopped");
    }

    async fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::TriggerJob { job_id, response } => {
                let result = self.trigger_job(&job_id).await;
                let _ = response.send(result);
            }
        }
    }

    /// Manually trigger a job by ID.
    async fn trigger_job(&mut self, job_id: &str) -> Result<(), JobError> {
        let is_running = {
            let state = self.shared_state.read().await;
            if !state.jobs.contains_key(job_id) {
                return Err(JobError::NotFound);
            }
            state.running_jobs.contains(job_id)
        };

        if is_running {
            return if self.handle_overlap(job_id, "manual").await {
                Ok(())
            } else {
                Err(JobError::AlreadyRunning)
            };
        }

        self.spawn_job(job_id, "manual").await;
        Ok(())
    }

    /// Applies the overlap policy to a firing of a job that is still running.
    /// Returns true when the firing was queued.
    async fn handle_overlap(&self, job_id: &str, triggered_by: &str) -> bool {
        let mut state = self.shared_state.write().await;
        let policy = state
            .jobs
            .get(job_id)
            .map(|job| job.overlap_policy())
            .unwrap_or_default();

        match policy {
            OverlapPolicy::Skip => {
                info!(
                    "Skipping {} firing of {}: previous run still in progress",
                    triggered_by, job_id
                );
                metrics::record_overlap_skip(job_id);
                false
            }
            OverlapPolicy::Queue => {
                if state.pending_jobs.insert(job_id.to_string()) {
                    info!("Queued {} firing of {} behind the current run", triggered_by, job_id);
                } else {
                    debug!("{} already has a queued run", job_id);
                }
                true
            }
        }
    }

    /// Calculate time until the next scheduled job should run.
    async fn time_until_next_scheduled_job(&self) -> Duration {
        let mut min_duration = DEFAULT_CHECK_INTERVAL;
        let now = Utc::now();

        let state = self.shared_state.read().await;
        for (job_id, job) in &state.jobs {
            if let Some(next_run) = self.get_next_run_time(job_id, &job.schedule()) {
                if next_run <= now {
                    return Duration::ZERO;
                }
                let duration = (next_run - now).to_std().unwrap_or(Duration::from_secs(1));
                min_duration = min_duration.min(duration);
            }
        }

        min_duration
    }

    /// Get the next scheduled run time for a job.
    ///
    /// Interval jobs without persisted state are due immediately. Cron jobs
    /// without state get their first firing computed and persisted.
    fn get_next_run_time(&self, job_id: &str, schedule: &JobSchedule) -> Option<DateTime<Utc>> {
        if schedule.interval().is_none() && schedule.cron().is_none() {
            return None;
        }

        if let Ok(Some(state)) = self.job_store.get_schedule_state(job_id) {
            return Some(state.next_run_at);
        }

        if schedule.interval().is_some() {
            return Some(Utc::now());
        }

        let next = compute_next_run(schedule, Utc::now())?;
        let state = JobScheduleState {
            job_id: job_id.to_string(),
            next_run_at: next,
            last_run_at: None,
        };
        if let Err(e) = self.job_store.update_schedule_state(&state) {
            warn!("Failed to persist schedule state for {}: {}", job_id, e);
        }
        Some(next)
    }

    /// Moves a job's next run past `now` without touching `last_run_at`.
    fn advance_schedule(&self, job_id: &str, schedule: &JobSchedule, now: DateTime<Utc>) {
        let Some(next_run) = compute_next_run(schedule, now) else {
            return;
        };
        let last_run_at = self
            .job_store
            .get_schedule_state(job_id)
            .ok()
            .flatten()
            .and_then(|s| s.last_run_at);
        let state = JobScheduleState {
            job_id: job_id.to_string(),
            next_run_at: next_run,
            last_run_at,
        };
        if let Err(e) = self.job_store.update_schedule_state(&state) {
            warn!("Failed to update schedule state for {}: {}", job_id, e);
        }
    }

    /// Run all jobs that are due for scheduled execution.
    async fn run_due_jobs(&mut self) {
        let now = Utc::now();
        let mut jobs_to_run = Vec::new();
        let mut overlapping = Vec::new();

        {
            let state = self.shared_state.read().await;
            for (job_id, job) in &state.jobs {
                let schedule = job.schedule();
                if let Some(next_run) = self.get_next_run_time(job_id, &schedule) {
                    if next_run <= now {
                        if state.running_jobs.contains(job_id) {
                            overlapping.push((job_id.clone(), schedule));
                        } else {
                            jobs_to_run.push(job_id.clone());
                        }
                    }
                }
            }
        }

        for (job_id, schedule) in overlapping {
            self.advance_schedule(&job_id, &schedule, now);
            self.handle_overlap(&job_id, "schedule").await;
        }

        for job_id in jobs_to_run {
            self.spawn_job(&job_id, "schedule").await;
        }
    }

    /// Trigger all jobs that listen for a specific hook event.
    async fn trigger_jobs_for_hook(&mut self, event: HookEvent) {
        let trigger = format!("hook:{}", event);
        let mut jobs_to_trigger = Vec::new();
        let mut overlapping = Vec::new();

        {
            let state = self.shared_state.read().await;
            for (job_id, job) in &state.jobs {
                if !job.schedule().listens_to(event) {
                    continue;
                }
                if state.running_jobs.contains(job_id) {
                    overlapping.push(job_id.clone());
                } else {
                    jobs_to_trigger.push(job_id.clone());
                }
            }
        }

        for job_id in overlapping {
            self.handle_overlap(&job_id, &trigger).await;
        }
        for job_id in jobs_to_trigger {
            self.spawn_job(&job_id, &trigger).await;
        }
    }

    /// Spawn a job execution task.
    async fn spawn_job(&mut self, job_id: &str, triggered_by: &str) {
        let job = {
            let state = self.shared_state.read().await;
            match state.jobs.get(job_id) {
                Some(job) => Arc::clone(job),
                None => {
                    error!("Attempted to spawn unknown job: {}", job_id);
                    return;
                }
            }
        };

        let run_id = match self.job_store.record_job_start(job_id, triggered_by) {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to record job start for {}: {}", job_id, e);
                return;
            }
        };

        info!(
            "Starting job: {} (run_id: {}, triggered_by: {})",
            job_id, run_id, triggered_by
        );

        {
            let mut state = self.shared_state.write().await;
            state.running_jobs.insert(job_id.to_string());
        }

        // Move the next firing past now so a long run does not re-trigger itself.
        self.advance_schedule(job_id, &job.schedule(), Utc::now());

        metrics::set_job_running(job_id, true);

        let cancel_token = self.job_context.cancellation_token.child_token();
        self.job_cancel_tokens
            .insert(job_id.to_string(), cancel_token.clone());
        let ctx = self.job_context.with_token(cancel_token);

        let job_store = Arc::clone(&self.job_store);
        let completion_sender = self.completion_sender.clone();
        let job_id_owned = job_id.to_string();

        // Jobs are synchronous; run them on the blocking pool.
        let handle = tokio::spawn(async move {
            let start_time = Instant::now();
            let result = tokio::task::spawn_blocking(move || job.execute(&ctx)).await;
            let elapsed = start_time.elapsed();

            let (status, error_msg, stats, status_label) = match result {
                Ok(Ok(stats)) => {
                    info!(
                        "Job {} completed successfully in {:?}: {}",
                        job_id_owned, elapsed, stats
                    );
                    let stats = (!stats.is_null()).then_some(stats);
                    (JobRunStatus::Completed, None, stats, "success")
                }
                Ok(Err(JobError::Cancelled { stats })) => {
                    info!("Job {} was cancelled after {:?}", job_id_owned, elapsed);
                    (
                        JobRunStatus::Failed,
                        Some("Cancelled".to_string()),
                        stats,
                        "cancelled",
                    )
                }
                Ok(Err(e)) => {
                    error!("Job {} failed after {:?}: {}", job_id_owned, elapsed, e);
                    let stats = e.stats().cloned();
                    (JobRunStatus::Failed, Some(e.to_string()), stats, "failed")
                }
                Err(e) => {
                    error!("Job {} panicked after {:?}: {}", job_id_owned, elapsed, e);
                    (
                        JobRunStatus::Failed,
                        Some(format!("Task panic: {}", e)),
                        None,
                        "panic",
                    )
                }
            };

            metrics::record_job_execution(&job_id_owned, status_label, elapsed);
            metrics::set_job_running(&job_id_owned, false);

            if let Err(e) = job_store.record_job_finish(run_id, status, error_msg, stats.as_ref()) {
                error!("Failed to record job finish for {}: {}", job_id_owned, e);
            }

            let _ = completion_sender.send(job_id_owned);
        });

        self.running_handles.insert(job_id.to_string(), handle);
    }

    /// Bookkeeping after a job task reports completion; starts a queued re-run.
    async fn on_job_finished(&mut self, job_id: &str) {
        if let Some(handle) = self.running_handles.remove(job_id) {
            let _ = handle.await;
        }
        self.job_cancel_tokens.remove(job_id);

        let (job, has_pending) = {
            let mut state = self.shared_state.write().await;
            state.running_jobs.remove(job_id);
            let has_pending = state.pending_jobs.remove(job_id);
            (state.jobs.get(job_id).cloned(), has_pending)
        };

        if let Some(job) = job {
            self.update_schedule_after_run(job_id, &job.schedule());
            if has_pending && !self.shutdown_token.is_cancelled() {
                self.spawn_job(job_id, "queued").await;
            }
        }
    }

    fn update_schedule_after_run(&self, job_id: &str, schedule: &JobSchedule) {
        let now = Utc::now();
        if let Some(next_run) = compute_next_run(schedule, now) {
            let state = JobScheduleState {
                job_id: job_id.to_string(),
                next_run_at: next_run,
                last_run_at: Some(now),
            };
            if let Err(e) = self.job_store.update_schedule_state(&state) {
                error!("Failed to update schedule state for {}: {}", job_id, e);
            }
        }
    }

    /// Gracefully shut down the scheduler.
    async fn shutdown(&mut self) {
        info!("Shutting down scheduler...");

        let mut wait_jobs = Vec::new();
        {
            let mut state = self.shared_state.write().await;
            state.pending_jobs.clear();

            for (job_id, handle) in self.running_handles.drain() {
                let behavior = state
                    .jobs
                    .get(&job_id)
                    .map(|j| j.shutdown_behavior())
                    .unwrap_or_default();
                if behavior == ShutdownBehavior::Cancellable {
                    if let Some(token) = self.job_cancel_tokens.get(&job_id) {
                        debug!("Cancelling job: {}", job_id);
                        token.cancel();
                    }
                }
                wait_jobs.push((job_id, handle, behavior));
            }
        }

        for (job_id, handle, behavior) in wait_jobs {
            if behavior == ShutdownBehavior::WaitForCompletion {
                info!("Waiting for job {} to complete...", job_id);
            }
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!("Job {} did not finish within {:?}", job_id, SHUTDOWN_TIMEOUT);
            }
        }

        self.job_cancel_tokens.clear();
        info!("Scheduler shutdown complete");
    }
}

/// Create a scheduler and its handle.
pub fn create_scheduler(
    job_store: Arc<dyn JobStore>,
    shutdown_token: CancellationToken,
    job_context: JobContext,
) -> (JobScheduler, SchedulerHandle) {
    let (command_tx, command_rx) = mpsc::channel(100);
    let shared_state = Arc::new(RwLock::new(SharedJobState::new()));

    let scheduler = JobScheduler::new(
        job_store.clone(),
        command_rx,
        shutdown_token,
        job_context,
        Arc::clone(&shared_state),
    );

    let handle = SchedulerHandle::new(command_tx, shared_state, job_store);

    (scheduler, handle)
}
