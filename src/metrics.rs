//! Client-side metrics.
//!
//! Metric names are defined here and recorded through the `metrics` facade.
//! The library never installs a recorder on its own; without one, recording
//! is a no-op.  [`init_metrics`] installs a Prometheus recorder for callers
//! that want one (the CLI does with `--metrics`).

use std::sync::OnceLock;

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// -- Metric name constants ----------------------------------------------------

/// Total request attempts sent (counter). Labels: method, path, status.
pub const REQUESTS_TOTAL: &str = "azstore_requests_total";

/// Per-attempt duration in seconds (histogram). Labels: method, path.
pub const REQUEST_DURATION_SECONDS: &str = "azstore_request_duration_seconds";

/// Total retried attempts (counter).
pub const RETRIES_TOTAL: &str = "azstore_retries_total";

/// Total bytes moved by the transfer engine (counter). Labels: direction.
pub const TRANSFERRED_BYTES_TOTAL: &str = "azstore_transferred_bytes_total";

/// Total recursive ACL batches processed (counter).
pub const ACL_BATCHES_TOTAL: &str = "azstore_acl_batches_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Idempotent.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Prometheus exposition text, if a recorder was installed.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Register metric descriptions with the global recorder. Call once after
/// [`init_metrics`].
pub fn describe_metrics() {
    describe_counter!(REQUESTS_TOTAL, "Total request attempts sent");
    describe_histogram!(
        REQUEST_DURATION_SECONDS,
        "Request attempt duration in seconds"
    );
    describe_counter!(RETRIES_TOTAL, "Total retried attempts");
    describe_counter!(
        TRANSFERRED_BYTES_TOTAL,
        "Total bytes uploaded or downloaded by the transfer engine"
    );
    describe_counter!(ACL_BATCHES_TOTAL, "Total recursive ACL batches processed");
}

// -- Path normalization -------------------------------------------------------

/// Normalize a request path to a template for metric labels, so container
/// and blob names do not become label values.
///
/// - `/` -> `/`
/// - `/photos` -> `/{container}`
/// - `/photos/2020/cat.jpg` -> `/{container}/{path}`
pub fn normalize_path(path: &str) -> &'static str {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.trim_end_matches('/').find('/') {
        None => "/{container}",
        Some(_) => "/{container}/{path}",
    }
}
