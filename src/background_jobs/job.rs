use super::context::JobContext;
use super::cron::CronSchedule;
use serde_json::Value as JsonValue;
use std::time::Duration;

/// Schedule for when a job should run.
#[derive(Debug, Clone, PartialEq)]
pub enum JobSchedule {
    /// Run at specific times using cron syntax
    Cron(CronSchedule),
    /// Run at fixed intervals
    Interval(Duration),
    /// Run only in response to hooks
    Hook(HookEvent),
    /// Combination of scheduled and hook-triggered
    Combined {
        cron: Option<CronSchedule>,
        interval: Option<Duration>,
        hooks: Vec<HookEvent>,
    },
}

impl JobSchedule {
    /// Never fires on its own; the job runs only when triggered.
    pub fn manual() -> Self {
        JobSchedule::Combined {
            cron: None,
            interval: None,
            hooks: Vec::new(),
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            JobSchedule::Interval(interval) => Some(*interval),
            JobSchedule::Combined { interval, .. } => *interval,
            _ => None,
        }
    }

    pub fn cron(&self) -> Option<&CronSchedule> {
        match self {
            JobSchedule::Cron(cron) => Some(cron),
            JobSchedule::Combined { cron, .. } => cron.as_ref(),
            _ => None,
        }
    }

    pub fn listens_to(&self, event: HookEvent) -> bool {
        match self {
            JobSchedule::Hook(hook) => *hook == event,
            JobSchedule::Combined { hooks, .. } => hooks.contains(&event),
            _ => false,
        }
    }
}

/// Events that can trigger hook-based jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    OnStartup,
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookEvent::OnStartup => write!(f, "OnStartup"),
        }
    }
}

/// How a job should be handled during server shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownBehavior {
    /// Job can be cancelled immediately
    #[default]
    Cancellable,
    /// Wait for job to complete before shutdown
    WaitForCompletion,
}

/// What happens when a job fires while a previous run is still in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapPolicy {
    /// Drop the new firing. Manual triggers get `JobError::AlreadyRunning`.
    #[default]
    Skip,
    /// Remember one pending run and start it when the current one finishes.
    Queue,
}

/// Errors that can occur during job execution.
///
/// A run that got far enough to count anything carries its statistics, so a
/// failed run is recorded with the same summary as a successful one.
#[derive(Debug)]
pub enum JobError {
    NotFound,
    AlreadyRunning,
    ExecutionFailed {
        message: String,
        stats: Option<JsonValue>,
    },
    Cancelled {
        stats: Option<JsonValue>,
    },
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::ExecutionFailed {
            message: message.into(),
            stats: None,
        }
    }

    pub fn stats(&self) -> Option<&JsonValue> {
        match self {
            JobError::ExecutionFailed { stats, .. } | JobError::Cancelled { stats } => {
                stats.as_ref()
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::NotFound => write!(f, "Job not found"),
            JobError::AlreadyRunning => write!(f, "Job is already running"),
            JobError::ExecutionFailed { message, .. } => write!(f, "Execution failed: {}", message),
            JobError::Cancelled { .. } => write!(f, "Job was cancelled"),
        }
    }
}

impl std::error::Error for JobError {}

/// Trait for background jobs.
///
/// Jobs are executed synchronously in a blocking context.
/// Long-running work should check for cancellation between units.
pub trait BackgroundJob: Send + Sync {
    /// Unique identifier for this job.
    fn id(&self) -> &'static str;

    /// Human-readable name for this job.
    fn name(&self) -> &'static str;

    /// Description of what this job does.
    fn description(&self) -> &'static str;

    /// When this job should be scheduled to run.
    fn schedule(&self) -> JobSchedule;

    /// How this job should be handled during shutdown.
    fn shutdown_behavior(&self) -> ShutdownBehavior {
        ShutdownBehavior::Cancellable
    }

    fn overlap_policy(&self) -> OverlapPolicy {
        OverlapPolicy::Skip
    }

    /// Execute the job and return its run statistics.
    ///
    /// This method is called from a blocking context using `spawn_blocking`.
    /// The returned JSON is stored on the job run; `JsonValue::Null` stores nothing.
    /// Implementations should check `ctx.is_cancelled()` between units of work
    /// and return `JobError::Cancelled` if true.
    fn execute(&self, ctx: &JobContext) -> Result<JsonValue, JobError>;
}
