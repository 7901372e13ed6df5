//! Request/response channel between two peers.

use crate::directory::ports::{AgentError, RegistryError};
use crate::rpc::domain::{RemoteError, RpcRequest};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Result type for channel calls.
pub type RpcResult<T> = Result<T, RpcError>;

/// A bidirectional request/response channel.
///
/// Either side may call the other once both have installed a handler.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Sends a request and waits for the peer's reply.
    async fn call(&self, request: RpcRequest) -> RpcResult<Value>;

    /// Installs the handler for requests arriving from the peer, replacing
    /// any previous one.
    fn serve(&self, handler: Arc<dyn RpcHandler>);

    /// Closes the channel; both handlers are notified once.
    async fn close(&self);

    /// Whether the channel has been closed by either side.
    fn is_closed(&self) -> bool;
}

/// Serves requests arriving on a channel.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Answers one request.
    async fn handle(&self, request: RpcRequest) -> Result<Value, RemoteError>;

    /// Called once when the channel closes.
    async fn closed(&self);
}

/// Failures of the transport itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The channel is closed.
    #[error("channel closed")]
    Closed,

    /// The peer has not installed a handler yet.
    #[error("peer is not serving requests")]
    NotServing,

    /// A message could not be encoded or decoded.
    #[error("codec failure: {0}")]
    Codec(String),
}

/// Errors returned by [`RpcChannel::call`].
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The peer handled the call and reported an error.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
}

impl From<RpcError> for RegistryError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Transport(transport) => Self::transport(transport),
            RpcError::Remote(remote) => remote.into(),
        }
    }
}

impl From<RpcError> for AgentError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Transport(transport) => Self::container(transport),
            RpcError::Remote(remote) => remote.into(),
        }
    }
}

/// Decodes a reply into the type the operation returns.
///
/// # Errors
///
/// Returns [`TransportError::Codec`] when the reply has the wrong shape.
pub fn decode_reply<T: DeserializeOwned>(reply: Value) -> RpcResult<T> {
    serde_json::from_value(reply)
        .map_err(|err| RpcError::Transport(TransportError::Codec(err.to_string())))
}
