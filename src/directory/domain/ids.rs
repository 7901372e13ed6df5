//! Identity types for agents, containers and clients, and the validated kind.

use super::DirectoryDomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declares an opaque string identity that is usually a UUID.
macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mints a fresh random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Wraps an existing identifier.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrows the identifier text.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// Globally unique identity of one agent process.
    AgentId
);

opaque_id!(
    /// Globally unique identity of one container instance.
    ContainerId
);

opaque_id!(
    /// Globally unique identity of one connected caller.
    ClientId
);

/// Category of container a client can request.
///
/// Kinds are opaque to the directory; the only rule is that they are
/// non-empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerKind(String);

impl ContainerKind {
    /// Creates a validated kind.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryDomainError::EmptyKind`] for blank input.
    pub fn new(value: impl Into<String>) -> Result<Self, DirectoryDomainError> {
        let kind = value.into();
        if kind.trim().is_empty() {
            return Err(DirectoryDomainError::EmptyKind);
        }
        Ok(Self(kind))
    }

    /// Borrows the kind text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContainerKind {
    type Error = DirectoryDomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ContainerKind {
    type Error = DirectoryDomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerKind> for String {
    fn from(kind: ContainerKind) -> Self {
        kind.0
    }
}

impl AsRef<str> for ContainerKind {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}
