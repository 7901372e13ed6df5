//! Error payload carried back to the caller of a protocol operation.

use crate::agent::ports::ContainerError;
use crate::directory::domain::ErrorKind;
use crate::directory::ports::{AgentError, RegistryError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by the peer that handled a call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    /// Classification, preserved across the wire so retry decisions survive.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl RemoteError {
    /// Creates an error payload.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Reply for operations the receiving side does not serve.
    #[must_use]
    pub fn unsupported(code: &str) -> Self {
        Self::new(ErrorKind::Unsupported, format!("operation {code} is not served here"))
    }

    /// Reply for arguments that could not be decoded.
    pub fn malformed(err: &impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Internal, format!("malformed payload: {err}"))
    }
}

impl From<&RegistryError> for RemoteError {
    fn from(err: &RegistryError) -> Self {
        match err {
            RegistryError::Remote { kind, message } => Self::new(*kind, message.clone()),
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

impl From<&AgentError> for RemoteError {
    fn from(err: &AgentError) -> Self {
        match err {
            AgentError::Remote { kind, message } => Self::new(*kind, message.clone()),
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

impl From<&ContainerError> for RemoteError {
    fn from(err: &ContainerError) -> Self {
        let kind = match err {
            ContainerError::Terminated => ErrorKind::Shutdown,
            ContainerError::UnsupportedOperation(_) => ErrorKind::Unsupported,
            ContainerError::Failed(_) => ErrorKind::Internal,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<RemoteError> for RegistryError {
    fn from(err: RemoteError) -> Self {
        Self::Remote {
            kind: err.kind,
            message: err.message,
        }
    }
}

impl From<RemoteError> for AgentError {
    fn from(err: RemoteError) -> Self {
        Self::Remote {
            kind: err.kind,
            message: err.message,
        }
    }
}
