//! Errors surfaced by the client runtime.

use crate::client::ports::ConnectError;
use crate::directory::domain::{AgentEndpoint, ContainerId, DirectoryDomainError, ErrorKind};
use crate::directory::ports::RegistryError;
use thiserror::Error;

/// Result type for client runtime operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors returned by [`crate::client::services::ClientRuntime`] and the
/// handles it gives out.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The directory rejected or failed the call.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A data-plane connection failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// An endpoint token could not be decoded.
    #[error(transparent)]
    Endpoint(#[from] DirectoryDomainError),

    /// The container only accepts directory-proxied requests.
    #[error("container {0} does not accept connections")]
    NoConnect(ContainerId),

    /// Another hosted agent already serves this endpoint.
    #[error("agent endpoint {0} is already served by this runtime")]
    DuplicateAgentEndpoint(AgentEndpoint),

    /// The reference or connection was closed.
    #[error("container {0} is no longer held by this runtime")]
    Released(ContainerId),

    /// The runtime has been closed.
    #[error("client runtime is closed")]
    Closed,
}

impl ClientError {
    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Registry(err) => err.kind(),
            Self::Connect(err) => err.kind(),
            Self::Endpoint(_) | Self::DuplicateAgentEndpoint(_) => ErrorKind::Internal,
            Self::NoConnect(_) => ErrorKind::Unsupported,
            Self::Released(_) => ErrorKind::NotFound,
            Self::Closed => ErrorKind::Shutdown,
        }
    }
}
