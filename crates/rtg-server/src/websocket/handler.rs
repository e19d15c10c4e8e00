//! Message handler seam between the read loop and application logic.

use async_trait::async_trait;
use axum::extract::ws::Message;

use super::session::SessionId;

/// Application logic applied to each inbound data message.
///
/// Called inline by the session's read loop, so replies keep per-connection
/// FIFO order. Only text and binary frames are delivered, and never while the
/// session is draining.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message. A returned message is written back to the peer.
    async fn handle(&self, session: &SessionId, message: Message) -> Option<Message>;
}

/// Replies with the identical frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, _session: &SessionId, message: Message) -> Option<Message> {
        Some(message)
    }
}
