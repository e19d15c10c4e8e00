//! Gateway metrics: in-process totals mirrored into the `metrics` facade,
//! plus the Prometheus recorder used by `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Open sessions (gauge).
pub const CONNECTIONS_CURRENT: &str = "rtgateway_connections_current";
/// Sessions accepted since start (counter).
pub const CONNECTIONS_ACCEPTED_TOTAL: &str = "rtgateway_connections_accepted_total";
/// Inbound data messages (counter).
pub const MESSAGES_IN_TOTAL: &str = "rtgateway_messages_in_total";
/// Outbound data messages written (counter).
pub const MESSAGES_OUT_TOTAL: &str = "rtgateway_messages_out_total";
/// Sessions closed (counter, labels: reason).
pub const DISCONNECTS_TOTAL: &str = "rtgateway_disconnects_total";
/// Session lifetime in seconds (histogram).
pub const SESSION_DURATION_SECONDS: &str = "rtgateway_session_duration_seconds";

const SESSION_DURATION_BUCKETS: &[f64] = &[0.1, 1.0, 10.0, 60.0, 300.0, 1_800.0, 3_600.0, 21_600.0];

/// Install the Prometheus recorder (global).
///
/// Call once at startup before any session is accepted. Fails if a recorder is
/// already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(SESSION_DURATION_SECONDS.to_string()),
            SESSION_DURATION_BUCKETS,
        )?
        .install_recorder()?;
    describe();
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Register help text for every gateway metric.
pub fn describe() {
    describe_gauge!(CONNECTIONS_CURRENT, "Currently open WebSocket sessions");
    describe_counter!(CONNECTIONS_ACCEPTED_TOTAL, "WebSocket sessions accepted");
    describe_counter!(MESSAGES_IN_TOTAL, "Inbound data messages");
    describe_counter!(MESSAGES_OUT_TOTAL, "Outbound data messages");
    describe_counter!(DISCONNECTS_TOTAL, "WebSocket sessions closed, by reason");
    describe_histogram!(SESSION_DURATION_SECONDS, Unit::Seconds, "WebSocket session lifetime");
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Point-in-time view of the gateway totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Sessions accepted.
    pub accepted: u64,
    /// Sessions closed.
    pub disconnects: u64,
    /// `accepted - disconnects`.
    pub current: u64,
    /// Inbound data messages.
    pub messages_in: u64,
    /// Outbound data messages.
    pub messages_out: u64,
}

/// Shared metrics sink updated by sessions.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    accepted: AtomicU64,
    disconnects: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
}

impl GatewayMetrics {
    /// Create a zeroed sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// A session was registered and opened.
    pub fn connection_accepted(&self) {
        let _ = self.accepted.fetch_add(1, Ordering::SeqCst);
        counter!(CONNECTIONS_ACCEPTED_TOTAL).increment(1);
        gauge!(CONNECTIONS_CURRENT).increment(1.0);
    }

    /// A session reached `Closed`. Called exactly once per accepted session.
    pub fn connection_closed(&self, reason: &'static str, lifetime: Duration) {
        let _ = self.disconnects.fetch_add(1, Ordering::SeqCst);
        counter!(DISCONNECTS_TOTAL, "reason" => reason).increment(1);
        gauge!(CONNECTIONS_CURRENT).decrement(1.0);
        histogram!(SESSION_DURATION_SECONDS).record(lifetime.as_secs_f64());
    }

    /// An inbound data message was read.
    pub fn message_in(&self) {
        let _ = self.messages_in.fetch_add(1, Ordering::Relaxed);
        counter!(MESSAGES_IN_TOTAL).increment(1);
    }

    /// An outbound data message was written.
    pub fn message_out(&self) {
        let _ = self.messages_out.fetch_add(1, Ordering::Relaxed);
        counter!(MESSAGES_OUT_TOTAL).increment(1);
    }

    /// Read the current totals.
    pub fn snapshot(&self) -> MetricsSnapshot {
        // Disconnects first: every disconnect is preceded by its accept.
        let disconnects = self.disconnects.load(Ordering::SeqCst);
        let accepted = self.accepted.load(Ordering::SeqCst);
        MetricsSnapshot {
            accepted,
            disconnects,
            current: accepted.saturating_sub(disconnects),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
        }
    }
}
