//! Session state machine and read loop.
//!
//! A session owns one upgraded connection. [`spawn_session`] registers it,
//! then runs three tasks that share a single cancellation token:
//!
//! - the read loop (this module), the only reader of the transport
//! - the [`WriteSerializer`](super::writer::WriteSerializer), the only writer
//! - the [heartbeat monitor](super::heartbeat)
//!
//! Whoever decides the session is over calls [`SessionHandle::close`] with a
//! reason. The first reason wins and cancels all three tasks; the read loop's
//! task then tears down the session exactly once.

use std::fmt;
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::handler::MessageHandler;
use super::heartbeat::{run_heartbeat, HeartbeatResult};
use super::registry::{RegistryError, SessionRegistry};
use super::writer::{write_channel, WriteError, WriteHandle, WRITE_QUEUE_CAPACITY};
use crate::config::Limits;
use crate::metrics::GatewayMetrics;

/// Close reason text sent with the going-away frame at shutdown.
pub const SHUTDOWN_CLOSE_REASON: &str = "server shutting down";

/// Close reason text sent with the policy-violation frame.
pub const OVERSIZE_CLOSE_REASON: &str = "message too large";

/// Opaque session identifier (UUID v7, time-ordered).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle state. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Upgraded, not yet serving.
    Connecting = 0,
    /// Read loop and heartbeat running.
    Open = 1,
    /// Close frame queued; inbound data is no longer dispatched.
    Draining = 2,
    /// Transport released and session unregistered.
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Draining => "draining",
            Self::Closed => "closed",
        })
    }
}

/// Why a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a close frame or the stream ended.
    PeerClosed,
    /// The peer completed the close handshake during shutdown.
    Drained,
    /// An inbound message exceeded the size limit.
    MessageTooLarge,
    /// No liveness signal within the pong wait.
    HeartbeatTimeout,
    /// The transport failed while reading.
    ReadError(String),
    /// An outbound write failed or timed out.
    WriteFailed(WriteError),
    /// Still open when the shutdown grace period ran out.
    ShutdownForced,
    /// The message handler panicked.
    HandlerPanicked,
}

impl CloseReason {
    /// Stable label for the disconnect counter.
    pub fn label(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::Drained => "drained",
            Self::MessageTooLarge => "message_too_large",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ReadError(_) => "read_error",
            Self::WriteFailed(_) => "write_failed",
            Self::ShutdownForced => "shutdown_forced",
            Self::HandlerPanicked => "handler_panicked",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed"),
            Self::Drained => f.write_str("drained"),
            Self::MessageTooLarge => f.write_str("message too large"),
            Self::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            Self::ReadError(e) => write!(f, "read error: {e}"),
            Self::WriteFailed(e) => write!(f, "write failed: {e}"),
            Self::ShutdownForced => f.write_str("forced by shutdown"),
            Self::HandlerPanicked => f.write_str("message handler panicked"),
        }
    }
}

/// Shared view of one session, held by the registry and the session's tasks.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    state: AtomicU8,
    connected_at: Instant,
    last_seen: Mutex<Instant>,
    writer: WriteHandle,
    cancel: CancellationToken,
    finished: CancellationToken,
    reason: OnceLock<CloseReason>,
}

impl SessionHandle {
    pub(crate) fn new(writer: WriteHandle) -> Self {
        let now = Instant::now();
        Self {
            id: SessionId::new(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            connected_at: now,
            last_seen: Mutex::new(now),
            writer,
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            reason: OnceLock::new(),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `to` unless already past it. Returns the previous state.
    pub(crate) fn advance(&self, to: SessionState) -> SessionState {
        SessionState::from_u8(self.state.fetch_max(to as u8, Ordering::AcqRel))
    }

    /// Time since the upgrade completed.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Record a liveness signal from the peer.
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// When the peer last showed signs of life.
    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    /// Submit side of this session's write serializer.
    pub fn writer(&self) -> &WriteHandle {
        &self.writer
    }

    /// Request closure. The first reason is kept; returns whether this call set it.
    pub fn close(&self, reason: CloseReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.cancel.cancel();
        first
    }

    /// Reason recorded by the first [`close`](Self::close).
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.reason.get()
    }

    /// Enter `Draining` and queue a going-away close frame.
    ///
    /// Returns `false` if the session was already draining or closed.
    pub fn begin_drain(&self) -> bool {
        if self.advance(SessionState::Draining) >= SessionState::Draining {
            return false;
        }
        let frame = CloseFrame {
            code: close_code::AWAY,
            reason: SHUTDOWN_CLOSE_REASON.into(),
        };
        if let Err(e) = self.writer.try_enqueue(Message::Close(Some(frame))) {
            debug!(session_id = %self.id, error = %e, "close frame not queued");
            let _ = self.close(CloseReason::WriteFailed(e));
        }
        true
    }

    /// Close immediately without waiting for the peer.
    pub fn force_close(&self) -> bool {
        self.close(CloseReason::ShutdownForced)
    }

    /// Wait until teardown has finished (transport released, unregistered, counted).
    pub async fn closed(&self) {
        self.finished.cancelled().await;
    }

    /// Whether teardown has finished.
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn peer_gone_reason(&self) -> CloseReason {
        if self.state() >= SessionState::Draining {
            CloseReason::Drained
        } else {
            CloseReason::PeerClosed
        }
    }
}

/// Shared collaborators every session needs.
#[derive(Clone)]
pub struct SessionContext {
    /// Size and time limits.
    pub limits: Limits,
    /// Registry the session joins and leaves.
    pub registry: Arc<SessionRegistry>,
    /// Metrics sink.
    pub metrics: Arc<GatewayMetrics>,
    /// Application logic for inbound messages.
    pub handler: Arc<dyn MessageHandler>,
}

/// Register a session for an upgraded transport and start its tasks.
///
/// If the registry is sealed (shutdown already enumerated), the peer gets a
/// going-away close frame and nothing is registered or counted.
pub async fn spawn_session<Si, St>(
    mut sink: Si,
    stream: St,
    ctx: SessionContext,
) -> Result<Arc<SessionHandle>, RegistryError>
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display,
    St: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    let (writer, serializer) = write_channel(WRITE_QUEUE_CAPACITY);
    let session = Arc::new(SessionHandle::new(writer));

    if let Err(e) = ctx.registry.insert(session.clone()).await {
        let frame = CloseFrame {
            code: close_code::AWAY,
            reason: SHUTDOWN_CLOSE_REASON.into(),
        };
        let _ = tokio::time::timeout(ctx.limits.write_timeout, sink.send(Message::Close(Some(frame)))).await;
        debug!(session_id = %session.id(), "registry sealed, connection refused");
        return Err(e);
    }

    ctx.metrics.connection_accepted();
    let _ = session.advance(SessionState::Open);
    info!(session_id = %session.id(), "session opened");

    let writer_task = {
        let session = session.clone();
        let metrics = ctx.metrics.clone();
        let write_timeout = ctx.limits.write_timeout;
        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = serializer.run(sink, write_timeout, &metrics, cancel).await {
                warn!(session_id = %session.id(), error = %e, "write failed, closing session");
                let _ = session.close(CloseReason::WriteFailed(e));
            }
        })
    };
    let heartbeat_task = tokio::spawn(run_heartbeat(
        session.clone(),
        ctx.limits.ping_interval,
        ctx.limits.pong_wait,
    ));
    let _ = tokio::spawn(run_session(session.clone(), stream, writer_task, heartbeat_task, ctx));

    Ok(session)
}

#[instrument(skip_all, fields(session_id = %session.id()))]
async fn run_session<St>(
    session: Arc<SessionHandle>,
    mut stream: St,
    writer_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<HeartbeatResult>,
    ctx: SessionContext,
) where
    St: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    // A panicking handler must not skip teardown.
    let outcome = AssertUnwindSafe(read_loop(&session, &mut stream, &ctx))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Some(reason)) => {
            let _ = session.close(reason);
        }
        Ok(None) => {}
        Err(_) => {
            error!("message handler panicked, closing session");
            let _ = session.close(CloseReason::HandlerPanicked);
        }
    }
    session.cancel.cancel();
    let _ = heartbeat_task.await;
    let _ = writer_task.await;
    drop(stream);

    let _ = session.advance(SessionState::Closed);
    let _ = ctx.registry.remove(session.id()).await;

    // close() runs before every cancellation, so a reason is always recorded.
    let reason = session.close_reason().cloned().unwrap_or(CloseReason::ShutdownForced);
    let lifetime = session.age();
    ctx.metrics.connection_closed(reason.label(), lifetime);
    info!(reason = %reason, lifetime_secs = lifetime.as_secs_f64(), "session closed");
    session.finished.cancel();
}

/// Read frames until the peer leaves, a limit is hit, or the session is cancelled.
///
/// Returns `None` when cancelled (the reason was already recorded by `close`).
async fn read_loop<St>(session: &SessionHandle, stream: &mut St, ctx: &SessionContext) -> Option<CloseReason>
where
    St: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            () = session.cancel.cancelled() => return None,
            frame = stream.next() => frame,
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) if is_capacity_error(&e) => {
                warn!(error = %e, limit = ctx.limits.max_message_bytes, "inbound message exceeds limit");
                let frame = CloseFrame {
                    code: close_code::POLICY,
                    reason: OVERSIZE_CLOSE_REASON.into(),
                };
                if let Err(e) = session.writer.submit(Message::Close(Some(frame))).await {
                    debug!(error = %e, "policy close frame not delivered");
                }
                return Some(CloseReason::MessageTooLarge);
            }
            Some(Err(e)) => {
                debug!(error = %e, "read failed");
                return Some(CloseReason::ReadError(e.to_string()));
            }
            None => return Some(session.peer_gone_reason()),
        };

        match message {
            Message::Text(_) | Message::Binary(_) => {
                ctx.metrics.message_in();
                session.mark_alive();
                if session.state() >= SessionState::Draining {
                    debug!("draining, inbound message dropped");
                    continue;
                }
                let reply = tokio::select! {
                    biased;
                    () = session.cancel.cancelled() => return None,
                    reply = ctx.handler.handle(session.id(), message) => reply,
                };
                if let Some(reply) = reply {
                    if let Err(e) = session.writer.submit(reply).await {
                        return Some(CloseReason::WriteFailed(e));
                    }
                }
            }
            Message::Ping(_) | Message::Pong(_) => session.mark_alive(),
            Message::Close(frame) => {
                debug!(code = ?frame.as_ref().map(|f| f.code), "peer sent close frame");
                // One more poll lets the transport flush its close reply.
                let _ = tokio::time::timeout(ctx.limits.write_timeout, stream.next()).await;
                return Some(session.peer_gone_reason());
            }
        }
    }
}

/// Oversized frames surface as capacity errors from the protocol layer.
fn is_capacity_error(err: &axum::Error) -> bool {
    let text = err.to_string();
    text.contains("Space limit exceeded") || text.contains("Message too long")
}
