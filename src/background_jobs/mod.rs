//! Background job scheduling and execution system.
//!
//! Pipeline stages run as jobs on cron, interval or hook schedules. Every run
//! is recorded in the job store along with the statistics the job reports.

mod audit_logger;
mod context;
mod cron;
mod handle;
mod job;
pub mod jobs;
mod scheduler;

pub use audit_logger::JobAuditLogger;
pub use context::JobContext;
pub use cron::{parse_cadence, CadenceError, CronSchedule};
pub use handle::{JobInfo, JobRunInfo, JobScheduleInfo, SchedulerHandle};
pub use job::{BackgroundJob, HookEvent, JobError, JobSchedule, OverlapPolicy, ShutdownBehavior};
pub use scheduler::{compute_next_run, create_scheduler, JobScheduler};
