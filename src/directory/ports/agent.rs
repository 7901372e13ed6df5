//! Callback surface the directory uses to drive registered agents.

use crate::directory::domain::{
    ContainerId, ContainerKind, ErrorKind, GetOptions, ResolvedContainer,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Operations the directory invokes on a registered agent.
///
/// Implemented in-process by [`crate::agent::services::Agent`] and, across
/// a channel, by the RPC server's remote agent handle.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// Returns an existing container or creates one of `kind`.
    async fn get(&self, kind: &ContainerKind, options: &GetOptions)
    -> AgentResult<ResolvedContainer>;

    /// Forwards a data-plane call to a hosted container.
    async fn request(&self, container: &ContainerId, operation: &str, data: Value)
    -> AgentResult<Value>;

    /// Terminates a hosted container. Unknown ids are ignored.
    async fn terminate(&self, container: &ContainerId) -> AgentResult<()>;
}

/// Errors returned by agents.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// The agent does not host the container.
    #[error("container {0} not found on agent")]
    ContainerNotFound(ContainerId),

    /// The agent has no factory for the kind.
    #[error("no factory for container kind {0}")]
    UnknownKind(ContainerKind),

    /// The container is shutting down.
    #[error("container {0} is terminating")]
    Terminating(ContainerId),

    /// The container's factory failed.
    #[error("factory for {kind} failed: {source}")]
    Factory {
        /// Requested kind.
        kind: ContainerKind,
        /// Underlying failure.
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// The container itself reported a failure.
    #[error("container operation failed: {0}")]
    Container(Arc<dyn std::error::Error + Send + Sync>),

    /// The agent answered from across a channel with an error.
    #[error("remote agent error ({kind:?}): {message}")]
    Remote {
        /// Classification reported by the peer.
        kind: ErrorKind,
        /// Peer's message.
        message: String,
    },
}

impl AgentError {
    /// Wraps a factory failure.
    pub fn factory(
        kind: ContainerKind,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Factory {
            kind,
            source: Arc::new(err),
        }
    }

    /// Wraps a container failure.
    pub fn container(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Container(Arc::new(err))
    }

    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ContainerNotFound(_) => ErrorKind::NotFound,
            Self::UnknownKind(_) | Self::Factory { .. } => ErrorKind::Transient,
            Self::Terminating(_) => ErrorKind::Shutdown,
            Self::Container(_) => ErrorKind::Internal,
            Self::Remote { kind, .. } => *kind,
        }
    }
}
