//! Prometheus metrics for adflow.
//!
//! Recording goes through the `metrics` facade and is a no-op until
//! [`init_metrics`] installs the Prometheus recorder.
//!
//! ## Metrics
//!
//! ### Counters
//! - `adflow_analyzer_executions_total` - Analyzer runs by unit and status
//! - `adflow_analyzer_attempts_total` - Analyzer attempts by unit
//! - `adflow_quota_reserved_total` - Quota units reserved
//! - `adflow_quota_rejections_total` - Refused quota reservations
//! - `adflow_workflow_executions_total` - Finished workflow executions by workflow and status
//! - `adflow_step_executions_total` - Step runs by service and status
//!
//! ### Histograms
//! - `adflow_analyzer_duration_seconds` - Analyzer run duration by unit
//!
//! ### Gauges
//! - `adflow_active_executions` - Workflow step loops currently running

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder.
///
/// Calling it again returns the already installed handle.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle, if metrics were initialized.
pub fn get_prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    match get_prometheus_handle() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

// =============================================================================
// Analyzer Metrics
// =============================================================================

/// Record a finished analyzer run (`success`, `degraded`, `partial` or `failed`).
pub fn record_analyzer_execution(unit: &str, status: &str) {
    counter!(
        "adflow_analyzer_executions_total",
        "unit" => unit.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_analyzer_duration(duration: Duration, unit: &str) {
    histogram!(
        "adflow_analyzer_duration_seconds",
        "unit" => unit.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_analyzer_attempts(unit: &str, attempts: u32) {
    counter!(
        "adflow_analyzer_attempts_total",
        "unit" => unit.to_string()
    )
    .increment(u64::from(attempts));
}

// =============================================================================
// Quota Metrics
// =============================================================================

pub fn record_quota_reserved(cost: u64) {
    counter!("adflow_quota_reserved_total").increment(cost);
}

pub fn record_quota_rejected() {
    counter!("adflow_quota_rejections_total").increment(1);
}

// =============================================================================
// Workflow Metrics
// =============================================================================

/// Record a workflow execution reaching `completed`, `failed`, `cancelled` or `paused`.
pub fn record_workflow_execution(workflow: &str, status: &str) {
    counter!(
        "adflow_workflow_executions_total",
        "workflow" => workflow.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_step_execution(service: &str, status: &str) {
    counter!(
        "adflow_step_executions_total",
        "service" => service.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Increment active executions gauge.
pub fn inc_active_executions() {
    gauge!("adflow_active_executions").increment(1.0);
}

/// Decrement active executions gauge.
pub fn dec_active_executions() {
    gauge!("adflow_active_executions").decrement(1.0);
}
