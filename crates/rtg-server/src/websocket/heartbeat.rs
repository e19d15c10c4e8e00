//! Heartbeat ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, instrument, trace, warn};

use super::session::{CloseReason, SessionHandle, SessionState};

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The peer stopped responding within the pong wait.
    TimedOut,
    /// The session was closed for another reason.
    Cancelled,
}

const MIN_PING_INTERVAL: Duration = Duration::from_millis(1);

/// Run heartbeat pings for a session.
///
/// A ping is queued every `ping_interval` (skipped once the session is
/// draining). Any inbound frame refreshes the session's last-seen time; if it
/// is ever `pong_wait` in the past, the session is closed with
/// [`CloseReason::HeartbeatTimeout`].
#[instrument(skip_all, fields(session_id = %session.id()))]
pub async fn run_heartbeat(
    session: Arc<SessionHandle>,
    ping_interval: Duration,
    pong_wait: Duration,
) -> HeartbeatResult {
    let cancel = session.cancel_token().clone();
    // `interval_at` panics on a zero period.
    let ping_interval = ping_interval.max(MIN_PING_INTERVAL);
    let mut ticker = time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = session.last_seen() + pong_wait;
        tokio::select! {
            biased;
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            () = time::sleep_until(deadline) => {
                let silent_for = session.last_seen().elapsed();
                if silent_for >= pong_wait {
                    warn!(
                        silent_ms = u64::try_from(silent_for.as_millis()).unwrap_or(u64::MAX),
                        "peer unresponsive, closing session"
                    );
                    let _ = session.close(CloseReason::HeartbeatTimeout);
                    return HeartbeatResult::TimedOut;
                }
            }
            _ = ticker.tick() => {
                if session.state() < SessionState::Draining {
                    match session.writer().try_enqueue(Message::Ping(Vec::new().into())) {
                        Ok(()) => trace!("ping queued"),
                        Err(e) => debug!(error = %e, "ping not queued"),
                    }
                }
            }
        }
    }
}
