//! Broadcast channel: the per-connection push contract
//!
//! The connection layer owns the transport. The core only needs a handle it
//! can enqueue events on without blocking, plus an exactly-once close
//! notification (see [`CloseGuard`]).

use matchcast_common::events::LiveEvent;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identity of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A connection refused an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Receiving side is gone
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    /// Outbound buffer is full; the consumer has stalled
    #[error("connection {0} outbound buffer is full")]
    Stalled(ConnectionId),
}

/// Sending half of a connection's outbound queue
///
/// Cloning is cheap; all clones feed the same queue. A refused send marks
/// the connection closed for every clone, and the transport watches
/// [`ConnectionHandle::closed`] to tear the session down.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Arc<LiveEvent>>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    /// New handle with a bounded queue of `capacity` events
    ///
    /// The receiver is drained by the transport's writer task.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<LiveEvent>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ConnectionId::new(),
                tx,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue an event without waiting
    ///
    /// A refusal closes the connection; later sends fail with `Closed`.
    pub fn send(&self, event: Arc<LiveEvent>) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed(self.id));
        }

        self.tx.try_send(event).map_err(|e| {
            self.closed.cancel();
            match e {
                mpsc::error::TrySendError::Full(_) => DeliveryError::Stalled(self.id),
                mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed(self.id),
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once a send has been refused
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Runs a close callback exactly once, on `close()` or on drop
///
/// The transport holds one guard per connection so that `on_disconnect`
/// fires however the session ends, including task cancellation.
pub struct CloseGuard<F: FnOnce()> {
    on_close: Option<F>,
}

impl<F: FnOnce()> CloseGuard<F> {
    pub fn new(on_close: F) -> Self {
        Self {
            on_close: Some(on_close),
        }
    }

    pub fn close(mut self) {
        if let Some(f) = self.on_close.take() {
            f();
        }
    }
}

impl<F: FnOnce()> Drop for CloseGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.on_close.take() {
            f();
        }
    }
}
