//! In-process channel pair with a JSON round trip on every message.

use crate::rpc::domain::{RemoteError, RpcRequest};
use crate::rpc::ports::{RpcChannel, RpcError, RpcHandler, RpcResult, TransportError};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    const fn peer(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}

type HandlerSlot = Mutex<Option<Arc<dyn RpcHandler>>>;

#[derive(Default)]
struct Link {
    left: HandlerSlot,
    right: HandlerSlot,
    closed: AtomicBool,
}

impl Link {
    const fn slot(&self, side: Side) -> &HandlerSlot {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    fn handler(&self, side: Side) -> Option<Arc<dyn RpcHandler>> {
        self.slot(side)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take(&self, side: Side) -> Option<Arc<dyn RpcHandler>> {
        self.slot(side)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// One end of an in-process channel.
///
/// Requests and replies are serialised to JSON text and parsed back, so
/// anything that travels through a loopback pair would also survive a real
/// byte transport.
#[derive(Clone)]
pub struct LoopbackChannel {
    side: Side,
    link: Arc<Link>,
}

impl LoopbackChannel {
    /// Creates two connected ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let link = Arc::new(Link::default());
        (
            Self {
                side: Side::Left,
                link: Arc::clone(&link),
            },
            Self {
                side: Side::Right,
                link,
            },
        )
    }
}

fn round_trip<T: Serialize + DeserializeOwned>(message: &T) -> Result<T, TransportError> {
    let text =
        serde_json::to_string(message).map_err(|err| TransportError::Codec(err.to_string()))?;
    trace!(bytes = text.len(), "loopback frame");
    serde_json::from_str(&text).map_err(|err| TransportError::Codec(err.to_string()))
}

#[async_trait]
impl RpcChannel for LoopbackChannel {
    async fn call(&self, request: RpcRequest) -> RpcResult<Value> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        let code = request.code();
        let decoded = round_trip(&request)?;
        let handler = self
            .link
            .handler(self.side.peer())
            .ok_or(TransportError::NotServing)?;
        let reply: Result<Value, RemoteError> = handler.handle(decoded).await;
        debug!(operation = code, ok = reply.is_ok(), "loopback call answered");
        match round_trip(&reply)? {
            Ok(value) => Ok(value),
            Err(remote) => Err(RpcError::Remote(remote)),
        }
    }

    fn serve(&self, handler: Arc<dyn RpcHandler>) {
        *self
            .link
            .slot(self.side)
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    async fn close(&self) {
        if self.link.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("loopback channel closed");
        for side in [self.side, self.side.peer()] {
            if let Some(handler) = self.link.take(side) {
                handler.closed().await;
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LoopbackChannel {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("LoopbackChannel")
            .field("side", &self.side)
            .field("closed", &self.is_closed())
            .finish()
    }
}
