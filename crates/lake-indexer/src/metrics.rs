//! Indexer metrics.
//!
//! Provides Prometheus metrics for the refresh loop and backfills:
//! - Refresh outcomes and duration per view
//! - Readiness per view
//! - Degraded enrichments
//! - Backfilled epochs per domain

use std::sync::OnceLock;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// ============================================================================
// Metric Names
// ============================================================================

/// Refresh attempts by outcome.
pub const VIEW_REFRESH_TOTAL: &str = "lake_view_refresh_total";

/// Refresh duration in seconds.
pub const VIEW_REFRESH_DURATION: &str = "lake_view_refresh_duration_seconds";

/// 1 once a view has refreshed successfully.
pub const VIEW_READY: &str = "lake_view_ready";

/// Best-effort enrichments that failed during a refresh.
pub const VIEW_ENRICHMENT_FAILURES: &str = "lake_view_enrichment_failures_total";

/// Epochs processed by backfills.
pub const BACKFILL_EPOCHS_TOTAL: &str = "lake_backfill_epochs_total";

/// Outcome of one guarded refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStatus {
    /// The refresh returned `Ok`.
    Success,
    /// The refresh returned an error.
    Error,
    /// The refresh panicked.
    Panic,
    /// The refresh exceeded its deadline.
    Timeout,
}

impl RefreshStatus {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Panic => "panic",
            Self::Timeout => "timeout",
        }
    }
}

// ============================================================================
// Prometheus Recorder
// ============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initializes the global metrics recorder with Prometheus exporter.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Panics
///
/// Panics if the Prometheus recorder cannot be installed; the service does
/// not start without metrics.
#[allow(clippy::panic)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|e| panic!("failed to install prometheus recorder: {e}"));

            describe_counter!(VIEW_REFRESH_TOTAL, "Total view refreshes by status");
            describe_histogram!(VIEW_REFRESH_DURATION, "Duration of view refreshes in seconds");
            describe_gauge!(VIEW_READY, "Whether the view has completed a successful refresh");
            describe_counter!(
                VIEW_ENRICHMENT_FAILURES,
                "Best-effort enrichments that failed during a refresh"
            );
            describe_counter!(BACKFILL_EPOCHS_TOTAL, "Epochs processed by backfills by status");
            lake_dataset::metrics::register_metrics();

            tracing::info!("Prometheus metrics recorder initialized for indexer");
            handle
        })
        .clone()
}

/// Returns the global Prometheus handle, if initialized.
#[must_use]
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Handler for the `/metrics` endpoint.
pub async fn serve_metrics() -> impl IntoResponse {
    match prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        ),
    }
}

// ============================================================================
// Metric Recording
// ============================================================================

/// Records one refresh attempt.
pub fn record_refresh(view: &str, status: RefreshStatus, duration_secs: f64) {
    counter!(
        VIEW_REFRESH_TOTAL,
        "view" => view.to_string(),
        "status" => status.as_str()
    )
    .increment(1);
    histogram!(VIEW_REFRESH_DURATION, "view" => view.to_string()).record(duration_secs);
}

/// Marks a view ready.
pub fn set_view_ready(view: &str, ready: bool) {
    gauge!(VIEW_READY, "view" => view.to_string()).set(if ready { 1.0 } else { 0.0 });
}

/// Records a failed best-effort enrichment.
pub fn record_enrichment_failure(view: &str, enrichment: &str) {
    counter!(
        VIEW_ENRICHMENT_FAILURES,
        "view" => view.to_string(),
        "enrichment" => enrichment.to_string()
    )
    .increment(1);
}

/// Records a backfilled epoch.
pub fn record_backfill_epoch(domain: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(
        BACKFILL_EPOCHS_TOTAL,
        "domain" => domain.to_string(),
        "status" => status
    )
    .increment(1);
}
