//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Fails if a recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants for the server crate.

/// Admission rejections (counter, labels: stage).
pub const ADMISSION_REJECTIONS_TOTAL: &str = "admission_rejections_total";
/// Streaming connections opened (counter, labels: mode).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Streaming connections closed (counter, labels: cause).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Sockets currently attached (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection state transitions (counter, labels: to).
pub const CONNECTION_TRANSITIONS_TOTAL: &str = "connection_state_transitions_total";
/// Keepalive heartbeat frames sent (counter).
pub const HEARTBEATS_SENT_TOTAL: &str = "ws_heartbeats_sent_total";
/// Connections parked awaiting resume (gauge).
pub const CONNECTIONS_PARKED: &str = "ws_connections_parked";
/// Parked connections adopted by a reconnect (counter).
pub const CONNECTIONS_RESUMED_TOTAL: &str = "ws_connections_resumed_total";
/// Live queue re-attachments after lagging (counter).
pub const REATTACHMENTS_TOTAL: &str = "ws_reattachments_total";
/// Events accepted over the ingest endpoint (counter, labels: type).
pub const INGESTED_EVENTS_TOTAL: &str = "ingest_events_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            ADMISSION_REJECTIONS_TOTAL,
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            CONNECTION_TRANSITIONS_TOTAL,
            HEARTBEATS_SENT_TOTAL,
            CONNECTIONS_PARKED,
            CONNECTIONS_RESUMED_TOTAL,
            REATTACHMENTS_TOTAL,
            INGESTED_EVENTS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name} is not snake_case"
            );
        }
    }
}
