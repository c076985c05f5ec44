//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Fails if another recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Connections admitted (counter).
pub const CONNECTIONS_TOTAL: &str = "rtm_connections_total";
/// Live connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "rtm_connections_active";
/// Connections refused at admission (counter, labels: reason).
pub const CONNECTIONS_REFUSED_TOTAL: &str = "rtm_connections_refused_total";
/// Inbound messages accepted for dispatch (counter, labels: mode).
pub const MESSAGES_TOTAL: &str = "rtm_messages_total";
/// Dispatch failures (counter, labels: type, kind).
pub const DISPATCH_ERRORS_TOTAL: &str = "rtm_dispatch_errors_total";
/// Dispatch duration seconds (histogram, labels: type).
pub const DISPATCH_DURATION_SECONDS: &str = "rtm_dispatch_duration_seconds";
/// `WAIT_PENDING` waits that hit their bound (counter).
pub const WAIT_PENDING_TIMEOUTS_TOTAL: &str = "rtm_wait_pending_timeouts_total";
/// Tasks abandoned by a forced executor stop (counter).
pub const UNDRAINED_TASKS_TOTAL: &str = "rtm_undrained_tasks_total";
/// Socket session lifetime seconds (histogram).
pub const CONNECTION_DURATION_SECONDS: &str = "rtm_connection_duration_seconds";
