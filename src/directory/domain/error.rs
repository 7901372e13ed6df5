//! Domain validation errors and the error taxonomy shared across the crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while constructing or decoding directory values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryDomainError {
    /// Container kinds must be non-empty.
    #[error("container kind must not be empty")]
    EmptyKind,

    /// An endpoint token could not be decoded.
    #[error("malformed endpoint token: {0}")]
    MalformedEndpoint(String),
}

/// Coarse classification used to decide how an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown agent or container on a direct call.
    NotFound,
    /// No capacity right now; the client runtime retries with backoff.
    Transient,
    /// The target is terminating.
    Shutdown,
    /// The operation is not supported for the target.
    Unsupported,
    /// The underlying channel failed.
    Transport,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Whether the client runtime should retry an operation failing this way.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}
