use crate::signal_store::{AlertKind, Platform};
use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all TrackSignal metrics
const PREFIX: &str = "tracksignal";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Background Job Metrics
    pub static ref JOB_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_executions_total"), "Background job executions by outcome"),
        &["job_id", "status"]
    ).expect("Failed to create job_executions_total metric");

    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_duration_seconds"),
            "Background job duration in seconds"
        )
        .buckets(vec![0.1, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
        &["job_id"]
    ).expect("Failed to create job_duration_seconds metric");

    pub static ref JOB_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_job_running"), "1 while a job is executing"),
        &["job_id"]
    ).expect("Failed to create job_running metric");

    pub static ref JOB_OVERLAP_SKIPS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_job_overlap_skips_total"),
            "Runs skipped because the previous run was still executing"
        ),
        &["job_id"]
    ).expect("Failed to create job_overlap_skips_total metric");

    // Collection Metrics
    pub static ref SNAPSHOTS_CREATED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_snapshots_created_total"), "Snapshots persisted by platform"),
        &["platform"]
    ).expect("Failed to create snapshots_created_total metric");

    pub static ref SOURCE_ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_source_errors_total"), "Source fetch failures by platform and kind"),
        &["platform", "kind"]
    ).expect("Failed to create source_errors_total metric");

    // Detection Metrics
    pub static ref ALERTS_CREATED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_alerts_created_total"), "Alerts raised by kind"),
        &["kind"]
    ).expect("Failed to create alerts_created_total metric");

    pub static ref PROCESS_MEMORY_BYTES: Gauge = Gauge::new(
        format!("{PREFIX}_process_memory_bytes"),
        "Process memory usage in bytes"
    ).expect("Failed to create process_memory_bytes metric");
}

/// Registers all metrics. Safe to call more than once.
pub fn init_metrics() {
    // Already-registered errors are expected in tests
    let _ = REGISTRY.register(Box::new(JOB_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(JOB_OVERLAP_SKIPS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SNAPSHOTS_CREATED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SOURCE_ERRORS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(ALERTS_CREATED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PROCESS_MEMORY_BYTES.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record a finished job run. `status` is "success", "failed", "cancelled" or "panic".
pub fn record_job_execution(job_id: &str, status: &str, duration: Duration) {
    JOB_EXECUTIONS_TOTAL
        .with_label_values(&[job_id, status])
        .inc();

    JOB_DURATION_SECONDS
        .with_label_values(&[job_id])
        .observe(duration.as_secs_f64());
}

pub fn set_job_running(job_id: &str, running: bool) {
    JOB_RUNNING
        .with_label_values(&[job_id])
        .set(if running { 1.0 } else { 0.0 });
}

pub fn record_overlap_skip(job_id: &str) {
    JOB_OVERLAP_SKIPS_TOTAL.with_label_values(&[job_id]).inc();
}

pub fn record_snapshot(platform: Platform) {
    SNAPSHOTS_CREATED_TOTAL
        .with_label_values(&[platform.as_str()])
        .inc();
}

pub fn record_source_error(platform: Platform, kind: &str) {
    SOURCE_ERRORS_TOTAL
        .with_label_values(&[platform.as_str(), kind])
        .inc();
}

pub fn record_alert(kind: AlertKind) {
    ALERTS_CREATED_TOTAL.with_label_values(&[kind.as_str()]).inc();
}

/// Update process memory usage
pub fn update_memory_usage() {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    // RSS is reported in kB
                    if let Some(kb) = line
                        .split_whitespace()
                        .nth(1)
                        .and_then(|kb| kb.parse::<f64>().ok())
                    {
                        PROCESS_MEMORY_BYTES.set(kb * 1024.0);
                    }
                    return;
                }
            }
        }
    }
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    update_memory_usage();

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
