//! Operator HTTP endpoints: Prometheus metrics plus the job scheduler's
//! registered jobs, run history, audit log and manual triggers.

use crate::background_jobs::{JobError, SchedulerHandle};
use crate::metrics;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    20
}

fn internal_error(what: &str, e: anyhow::Error) -> Response {
    warn!("Failed to {}: {:#}", what, e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Failed to {}", what),
    )
        .into_response()
}

/// GET /jobs - All registered jobs with their schedule and last run
async fn list_jobs(State(scheduler): State<SchedulerHandle>) -> Response {
    match scheduler.list_jobs().await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => internal_error("list jobs", e),
    }
}

/// GET /jobs/{job_id}
async fn get_job(State(scheduler): State<SchedulerHandle>, Path(job_id): Path<String>) -> Response {
    match scheduler.get_job(&job_id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error("get job", e),
    }
}

/// GET /jobs/{job_id}/history - Most recent runs first
async fn get_job_history(
    State(scheduler): State<SchedulerHandle>,
    Path(job_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Response {
    if !scheduler.job_exists(&job_id).await {
        return StatusCode::NOT_FOUND.into_response();
    }
    match scheduler.get_job_history(&job_id, page.limit.min(MAX_PAGE_SIZE)) {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => internal_error("read job history", e),
    }
}

/// GET /jobs/{job_id}/audit
async fn get_job_audit_log(
    State(scheduler): State<SchedulerHandle>,
    Path(job_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Response {
    if !scheduler.job_exists(&job_id).await {
        return StatusCode::NOT_FOUND.into_response();
    }
    match scheduler.get_job_audit_log_by_job(&job_id, page.limit.min(MAX_PAGE_SIZE), page.offset) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => internal_error("read job audit log", e),
    }
}

/// POST /jobs/{job_id}/trigger
async fn trigger_job(
    State(scheduler): State<SchedulerHandle>,
    Path(job_id): Path<String>,
) -> Response {
    match scheduler.trigger_job(&job_id).await {
        Ok(()) => {
            info!("Job {} triggered manually over HTTP", job_id);
            StatusCode::ACCEPTED.into_response()
        }
        Err(JobError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(JobError::AlreadyRunning) => {
            (StatusCode::CONFLICT, "Job is already running").into_response()
        }
        Err(e) => {
            warn!("Failed to trigger job {}: {}", job_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub fn job_routes(scheduler: SchedulerHandle) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/{job_id}", get(get_job))
        .route("/jobs/{job_id}/history", get(get_job_history))
        .route("/jobs/{job_id}/audit", get(get_job_audit_log))
        .route("/jobs/{job_id}/trigger", post(trigger_job))
        .with_state(scheduler)
}

/// Serves `/metrics` and `/jobs` until `shutdown` is cancelled. Port 0
/// disables the listener.
pub async fn serve(port: u16, scheduler: SchedulerHandle, shutdown: CancellationToken) -> Result<()> {
    if port == 0 {
        info!("Operator endpoints disabled");
        return Ok(());
    }

    let app = Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .merge(job_routes(scheduler));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind operator port {}", port))?;
    info!("Metrics and job endpoints available at port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::{
        create_scheduler, BackgroundJob, HookEvent, JobContext, JobSchedule,
    };
    use crate::inference::NoOpClassifier;
    use crate::job_store::SqliteJobStore;
    use crate::signal_store::SqliteSignalStore;
    use crate::sources::SourceRegistry;
    use serde_json::{json, Value as JsonValue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct CountingJob {
        runs: Arc<AtomicUsize>,
    }

    impl BackgroundJob for CountingJob {
        fn id(&self) -> &'static str {
            "counting_job"
        }

        fn name(&self) -> &'static str {
            "Counting Job"
        }

        fn description(&self) -> &'static str {
            "Counts its runs"
        }

        fn schedule(&self) -> JobSchedule {
            JobSchedule::Hook(HookEvent::OnStartup)
        }

        fn execute(&self, _ctx: &JobContext) -> Result<JsonValue, JobError> {
            let runs = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({ "runs": runs }))
        }
    }

    async fn body_json(response: Response) -> JsonValue {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn page() -> Query<PageQuery> {
        Query(PageQuery {
            limit: 10,
            offset: 0,
        })
    }

    #[tokio::test]
    async fn test_job_endpoints() {
        let temp_dir = TempDir::new().unwrap();
        let job_store = Arc::new(SqliteJobStore::new(temp_dir.path().join("jobs.db")).unwrap());
        let signal_store =
            Arc::new(SqliteSignalStore::new(temp_dir.path().join("signals.db")).unwrap());
        let shutdown = CancellationToken::new();
        let ctx = JobContext::new(
            shutdown.child_token(),
            signal_store,
            job_store.clone(),
            SourceRegistry::new(),
            Arc::new(NoOpClassifier),
        );
        let (mut scheduler, handle) = create_scheduler(job_store, shutdown.clone(), ctx);
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler
            .register_job(Arc::new(CountingJob { runs: runs.clone() }))
            .await;
        let sched_task = tokio::spawn(async move { scheduler.run().await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let jobs = body_json(list_jobs(State(handle.clone())).await).await;
        assert_eq!(jobs[0]["id"], "counting_job");
        assert_eq!(jobs[0]["last_run"]["stats"]["runs"], 1);

        let response = get_job(State(handle.clone()), Path("missing".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = trigger_job(State(handle.clone()), Path("counting_job".to_string())).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let response = trigger_job(State(handle.clone()), Path("missing".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let history = body_json(
            get_job_history(State(handle.clone()), Path("counting_job".to_string()), page()).await,
        )
        .await;
        assert_eq!(history.as_array().unwrap().len(), 2);
        assert_eq!(history[0]["triggered_by"], "manual");

        let response =
            get_job_audit_log(State(handle.clone()), Path("missing".to_string()), page()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), sched_task).await;
    }

    #[tokio::test]
    async fn test_port_zero_disables_listener() {
        let shutdown = CancellationToken::new();
        let temp_dir = TempDir::new().unwrap();
        let job_store = Arc::new(SqliteJobStore::new(temp_dir.path().join("jobs.db")).unwrap());
        let signal_store =
            Arc::new(SqliteSignalStore::new(temp_dir.path().join("signals.db")).unwrap());
        let ctx = JobContext::new(
            shutdown.child_token(),
            signal_store,
            job_store.clone(),
            SourceRegistry::new(),
            Arc::new(NoOpClassifier),
        );
        let (_scheduler, handle) = create_scheduler(job_store, shutdown.clone(), ctx);

        serve(0, handle, shutdown).await.unwrap();
    }
}
