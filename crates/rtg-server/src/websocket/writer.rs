//! Write serializer: the only writer of a session's transport.
//!
//! Producers (handler replies, heartbeat pings, close frames) submit requests
//! into a bounded FIFO queue. A single task drains the queue and performs one
//! write at a time, each under its own `write_timeout` measured from the moment
//! the write starts. The first failed or timed-out write ends the task with an
//! error; it is never retried.

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::metrics::GatewayMetrics;

/// Default depth of a session's write queue.
pub const WRITE_QUEUE_CAPACITY: usize = 256;

/// Why a write did not complete.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The write did not finish within the deadline.
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    /// The transport rejected the write.
    #[error("transport error: {0}")]
    Transport(String),
    /// The writer has stopped.
    #[error("writer closed")]
    Closed,
    /// The queue is full (non-blocking submit only).
    #[error("write queue full")]
    QueueFull,
}

struct WriteRequest {
    message: Message,
    done: Option<oneshot::Sender<Result<(), WriteError>>>,
}

impl std::fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteRequest").field("message", &self.message).finish_non_exhaustive()
    }
}

/// Cloneable submit side of a session's write queue.
#[derive(Clone, Debug)]
pub struct WriteHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriteHandle {
    /// Queue a message and wait until it has been written (or failed).
    pub async fn submit(&self, message: Message) -> Result<(), WriteError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(WriteRequest { message, done: Some(done) })
            .await
            .map_err(|_| WriteError::Closed)?;
        rx.await.unwrap_or(Err(WriteError::Closed))
    }

    /// Queue a message without waiting for the write.
    pub fn try_enqueue(&self, message: Message) -> Result<(), WriteError> {
        self.tx
            .try_send(WriteRequest { message, done: None })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => WriteError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => WriteError::Closed,
            })
    }

    /// Whether the serializer has stopped accepting writes.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receive side of a write queue, consumed by [`WriteSerializer::run`].
#[derive(Debug)]
pub struct WriteSerializer {
    rx: mpsc::Receiver<WriteRequest>,
}

/// Create a write queue of the given depth.
pub fn write_channel(capacity: usize) -> (WriteHandle, WriteSerializer) {
    let (tx, rx) = mpsc::channel(capacity);
    (WriteHandle { tx }, WriteSerializer { rx })
}

impl WriteSerializer {
    /// Execute queued writes one at a time until cancelled, the queue closes,
    /// or a write fails.
    ///
    /// Cancellation aborts an in-flight write; requests still queued are
    /// dropped and their submitters see [`WriteError::Closed`].
    pub async fn run<Si>(
        mut self,
        mut sink: Si,
        write_timeout: Duration,
        metrics: &GatewayMetrics,
        cancel: CancellationToken,
    ) -> Result<(), WriteError>
    where
        Si: Sink<Message> + Unpin,
        Si::Error: Display,
    {
        loop {
            let request = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                request = self.rx.recv() => match request {
                    Some(request) => request,
                    None => return Ok(()),
                },
            };

            let is_data = matches!(request.message, Message::Text(_) | Message::Binary(_));
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(WriteError::Closed),
                sent = tokio::time::timeout(write_timeout, sink.send(request.message)) => match sent {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(WriteError::Transport(e.to_string())),
                    Err(_) => Err(WriteError::Timeout(write_timeout)),
                },
            };

            if result.is_ok() {
                if is_data {
                    metrics.message_out();
                }
                trace!(is_data, "frame written");
            }
            if let Some(done) = request.done {
                let _ = done.send(result.clone());
            }

            match result {
                Ok(()) => {}
                Err(WriteError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}
