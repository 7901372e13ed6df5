//! Subscriber side of the directory change broadcast.

use crate::directory::domain::NetworkEvent;
use thiserror::Error;
use tokio::sync::broadcast;

/// Why a subscriber could not receive the next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EventStreamError {
    /// The subscriber fell behind and missed events; it should reconcile
    /// against a fresh listing.
    #[error("directory subscriber lagged behind by {0} events")]
    Lagged(u64),

    /// The directory is gone.
    #[error("directory event stream closed")]
    Closed,
}

/// Ordered stream of directory change batches for one subscriber.
///
/// Dropping the stream unsubscribes.
#[derive(Debug)]
pub struct DirectoryEvents {
    receiver: broadcast::Receiver<NetworkEvent>,
}

impl DirectoryEvents {
    /// Wraps a broadcast receiver.
    #[must_use]
    pub const fn new(receiver: broadcast::Receiver<NetworkEvent>) -> Self {
        Self { receiver }
    }

    /// Waits for the next batch.
    ///
    /// # Errors
    ///
    /// Returns [`EventStreamError::Lagged`] when events were dropped for this
    /// subscriber, and [`EventStreamError::Closed`] once the publisher is gone.
    pub async fn recv(&mut self) -> Result<NetworkEvent, EventStreamError> {
        self.receiver.recv().await.map_err(|err| match err {
            broadcast::error::RecvError::Lagged(missed) => EventStreamError::Lagged(missed),
            broadcast::error::RecvError::Closed => EventStreamError::Closed,
        })
    }
}
