//! Data-plane connection contracts.

use crate::agent::ports::PushHandler;
use crate::directory::domain::{AgentEndpoint, ClientId, ContainerEndpoint, ContainerId, ErrorKind};
use crate::rpc::domain::RemoteError;
use crate::rpc::ports::{RpcError, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Result type for connection operations.
pub type ConnectResult<T> = Result<T, ConnectError>;

/// Opens data-plane connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a point-to-point connection to a container's own listener.
    async fn connect_direct(
        &self,
        client: &ClientId,
        endpoint: &ContainerEndpoint,
    ) -> ConnectResult<Arc<dyn DirectLink>>;

    /// Opens a shared connection to an agent's listener.
    async fn connect_agent(
        &self,
        client: &ClientId,
        endpoint: &AgentEndpoint,
    ) -> ConnectResult<Arc<dyn AgentLink>>;
}

/// Point-to-point connection to one container.
#[async_trait]
pub trait DirectLink: Send + Sync {
    /// Sends a data-plane call.
    async fn request(&self, operation: &str, data: Value) -> ConnectResult<Value>;

    /// Starts receiving pushed data.
    async fn attach(&self, push: PushHandler) -> ConnectResult<()>;

    /// Closes the connection.
    async fn close(&self);
}

/// Shared connection to an agent, multiplexed by container id.
#[async_trait]
pub trait AgentLink: Send + Sync {
    /// Attaches to a container's push stream.
    async fn connect(&self, container: &ContainerId, push: PushHandler) -> ConnectResult<()>;

    /// Detaches from a container.
    async fn disconnect(&self, container: &ContainerId) -> ConnectResult<()>;

    /// Sends a data-plane call to a container.
    async fn request(
        &self,
        container: &ContainerId,
        operation: &str,
        data: Value,
    ) -> ConnectResult<Value>;

    /// Closes the shared connection.
    async fn close(&self);
}

/// Errors raised while opening or using a data-plane connection.
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    /// Nothing listens at the address.
    #[error("nothing listens at {host}:{port}")]
    Unreachable {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
    },

    /// The connection is closed.
    #[error("connection closed")]
    Closed,

    /// The container or agent answered with an error.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// The transport failed.
    #[error("connection failed: {0}")]
    Transport(Arc<dyn std::error::Error + Send + Sync>),
}

impl ConnectError {
    /// Wraps a transport failure.
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport(Arc::new(err))
    }

    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unreachable { .. } | Self::Transport(_) => ErrorKind::Transport,
            Self::Closed => ErrorKind::Shutdown,
            Self::Remote(remote) => remote.kind,
        }
    }

    /// Whether the failure may stem from a stale connection rather than
    /// from the container itself.
    ///
    /// A peer that restarted behind the same address answers `NotFound`
    /// for containers it no longer hosts on the old connection.
    #[must_use]
    pub const fn is_link_failure(&self) -> bool {
        match self {
            Self::Unreachable { .. } | Self::Closed | Self::Transport(_) => true,
            Self::Remote(remote) => matches!(remote.kind, ErrorKind::NotFound),
        }
    }
}

impl From<RpcError> for ConnectError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Transport(TransportError::Closed) => Self::Closed,
            RpcError::Transport(other) => Self::transport(other),
            RpcError::Remote(remote) => Self::Remote(remote),
        }
    }
}
