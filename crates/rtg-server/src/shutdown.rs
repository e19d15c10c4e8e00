//! Graceful shutdown coordination via `CancellationToken`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::websocket::registry::SessionRegistry;
use crate::websocket::session::CloseReason;

/// How long force-closed sessions get to finish teardown.
const FORCE_SETTLE_TIMEOUT: Duration = Duration::from_millis(50);

/// Outcome of a shutdown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions open when shutdown began.
    pub sessions: usize,
    /// Sessions that completed the close handshake.
    pub graceful: usize,
    /// Sessions closed by force after the grace ran out.
    pub forced: usize,
    /// Sessions that ended for another reason while draining (write failure,
    /// heartbeat timeout, peer error).
    pub failed: usize,
}

/// Drives every open session to `Closed` once, on a process-level stop.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    started: AtomicBool,
    close_grace: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator that waits `close_grace` for draining sessions.
    pub fn new(close_grace: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            started: AtomicBool::new(false),
            close_grace,
        }
    }

    /// Token cancelled when shutdown begins; the listener stops accepting on it.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run the shutdown sequence. Only the first call does anything; later
    /// calls return `None`.
    ///
    /// 1. Cancel the token (stop accepting upgrades)
    /// 2. Seal the registry and enumerate its sessions
    /// 3. Queue a close frame on each and move it to `Draining`
    /// 4. Wait up to `close_grace` for all of them to finish
    /// 5. Force-close the rest and give them a moment to tear down
    pub async fn shutdown(&self, registry: &SessionRegistry) -> Option<ShutdownReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("shutdown already in progress, ignoring");
            return None;
        }
        self.token.cancel();

        let sessions = registry.seal_and_snapshot().await;
        info!(
            sessions = sessions.len(),
            close_grace_ms = u64::try_from(self.close_grace.as_millis()).unwrap_or(u64::MAX),
            "draining sessions"
        );
        for session in &sessions {
            let _ = session.begin_drain();
        }

        let drained = tokio::time::timeout(
            self.close_grace,
            join_all(sessions.iter().map(|s| s.closed())),
        )
        .await
        .is_ok();

        let mut forced = 0;
        if !drained {
            for session in sessions.iter().filter(|s| !s.is_finished()) {
                if session.force_close() {
                    forced += 1;
                }
            }
            warn!(forced, "close grace elapsed, forcing remaining sessions");
            if tokio::time::timeout(
                FORCE_SETTLE_TIMEOUT,
                join_all(sessions.iter().map(|s| s.closed())),
            )
            .await
            .is_err()
            {
                warn!("some sessions still tearing down after forced close");
            }
        }

        let graceful = sessions
            .iter()
            .filter(|s| s.close_reason() == Some(&CloseReason::Drained))
            .count();
        let report = ShutdownReport {
            sessions: sessions.len(),
            graceful,
            forced,
            failed: sessions.len().saturating_sub(graceful + forced),
        };
        info!(
            sessions = report.sessions,
            graceful = report.graceful,
            forced = report.forced,
            failed = report.failed,
            "shutdown complete"
        );
        Some(report)
    }
}
