//! The directory contract shared by the in-process registry and its RPC proxy.

use super::{AgentError, AgentHandle, DirectoryEvents};
use crate::directory::domain::{
    AgentId, AgentRecord, AgentRecordInfo, ClientId, ContainerId, ContainerKind,
    ContainerRecord, DirectoryDomainError, ErrorKind, GetOptions, ResolvedContainer,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Result type for directory operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Authoritative directory of agents and containers.
///
/// Both the in-process registry and the RPC proxy implement this trait with
/// identical semantics, so callers never know which one they hold.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Stores an agent record and its containers.
    ///
    /// Returns the ids of submitted containers already owned by another
    /// agent; the caller must terminate its local copies.
    async fn register(
        &self,
        record: AgentRecord,
        agent: Arc<dyn AgentHandle>,
    ) -> RegistryResult<Vec<ContainerId>>;

    /// Removes an agent and every container it owned. Unknown ids are
    /// ignored.
    async fn unregister(&self, agent: &AgentId) -> RegistryResult<()>;

    /// Lists registered agents.
    async fn agents(&self) -> RegistryResult<Vec<AgentRecordInfo>>;

    /// Lists advertised kinds, sorted and de-duplicated.
    async fn kinds(&self) -> RegistryResult<Vec<ContainerKind>>;

    /// Lists container records, optionally filtered by kind.
    async fn list(&self, kind: Option<&ContainerKind>) -> RegistryResult<Vec<ContainerRecord>>;

    /// Resolves a container of `kind` for `client`, creating one on demand.
    async fn get(
        &self,
        client: &ClientId,
        kind: &ContainerKind,
        options: &GetOptions,
    ) -> RegistryResult<ResolvedContainer>;

    /// Signals that `client` no longer uses `container`.
    async fn release(&self, client: &ClientId, container: &ContainerId) -> RegistryResult<()>;

    /// Proxies a data-plane call to the container's owning agent.
    async fn request(
        &self,
        container: &ContainerId,
        operation: &str,
        data: Value,
    ) -> RegistryResult<Value>;

    /// Marks `client` and the agents it hosts as alive.
    async fn ping(&self, client: &ClientId, agents: &[AgentId]) -> RegistryResult<()>;

    /// Subscribes to directory change batches.
    fn subscribe(&self) -> DirectoryEvents;
}

/// Errors returned by directory operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The container id is unknown.
    #[error("container {0} not found")]
    ContainerNotFound(ContainerId),

    /// No agent currently advertises the kind.
    #[error("no suitable agents found for container kind {0}")]
    NoSuitableAgent(ContainerKind),

    /// The selected agent left the directory before creation finished.
    #[error("agent {0} left the directory during container creation")]
    AgentGone(AgentId),

    /// The selected agent could not create the container.
    #[error("failed to get endpoint for container kind {kind}: {source}")]
    CreationFailed {
        /// Requested kind.
        kind: ContainerKind,
        /// Agent-side failure.
        source: AgentError,
    },

    /// The owning agent failed a forwarded call.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// A value failed domain validation.
    #[error(transparent)]
    Domain(#[from] DirectoryDomainError),

    /// The channel to a remote registry failed.
    #[error("registry transport failed: {0}")]
    Transport(Arc<dyn std::error::Error + Send + Sync>),

    /// A remote registry reported an error.
    #[error("remote registry error ({kind:?}): {message}")]
    Remote {
        /// Classification reported by the peer.
        kind: ErrorKind,
        /// Peer's message.
        message: String,
    },

    /// Unexpected internal failure.
    #[error("registry internal error: {0}")]
    Internal(Arc<dyn std::error::Error + Send + Sync>),
}

impl RegistryError {
    /// Wraps a transport failure.
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport(Arc::new(err))
    }

    /// Wraps an unexpected failure.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(Arc::new(err))
    }

    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ContainerNotFound(_) => ErrorKind::NotFound,
            Self::NoSuitableAgent(_) | Self::AgentGone(_) | Self::CreationFailed { .. } => {
                ErrorKind::Transient
            }
            Self::Agent(source) => source.kind(),
            Self::Domain(_) | Self::Internal(_) => ErrorKind::Internal,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Remote { kind, .. } => *kind,
        }
    }

    /// Whether the client runtime's backoff loop should retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
