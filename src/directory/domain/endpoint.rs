//! Endpoint descriptors and their opaque token form.
//!
//! An agent mints an [`EndpointRef`] whenever it creates or advertises a
//! container. Clients decode the token to choose how to connect: straight
//! to the container's own listener, through the owning agent's shared
//! listener, or not at all.

use super::{AgentId, ContainerId, DirectoryDomainError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a client reaches a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStrategy {
    /// Point-to-point connection to the container's own address.
    Direct,
    /// Multiplexed through the owning agent's listener.
    Routed,
    /// Connection-oriented operations are unsupported.
    NoConnect,
}

impl ConnectionStrategy {
    /// Returns the wire spelling of the strategy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Routed => "routed",
            Self::NoConnect => "no-connect",
        }
    }
}

impl fmt::Display for ConnectionStrategy {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Address of an agent's shared listener for routed connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentEndpoint {
    agent: AgentId,
    host: String,
    port: u16,
}

impl AgentEndpoint {
    /// Creates an agent endpoint.
    #[must_use]
    pub fn new(agent: AgentId, host: impl Into<String>, port: u16) -> Self {
        Self {
            agent,
            host: host.into(),
            port,
        }
    }

    /// Agent listening at this address.
    #[must_use]
    pub const fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// Host name or address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Listening port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for AgentEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{} ({})", self.host, self.port, self.agent)
    }
}

/// Decoded form of an [`EndpointRef`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerEndpoint {
    strategy: ConnectionStrategy,
    host: String,
    port: u16,
    container: ContainerId,
    agent: AgentId,
}

impl ContainerEndpoint {
    /// Endpoint for a container with its own listener.
    #[must_use]
    pub fn direct(
        agent: AgentId,
        container: ContainerId,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            strategy: ConnectionStrategy::Direct,
            host: host.into(),
            port,
            container,
            agent,
        }
    }

    /// Endpoint for a container reached through its agent's listener.
    #[must_use]
    pub fn routed(agent: &AgentEndpoint, container: ContainerId) -> Self {
        Self {
            strategy: ConnectionStrategy::Routed,
            host: agent.host.clone(),
            port: agent.port,
            container,
            agent: agent.agent.clone(),
        }
    }

    /// Endpoint for a container that only accepts directory-proxied requests.
    #[must_use]
    pub const fn no_connect(agent: AgentId, container: ContainerId) -> Self {
        Self {
            strategy: ConnectionStrategy::NoConnect,
            host: String::new(),
            port: 0,
            container,
            agent,
        }
    }

    /// Connection strategy.
    #[must_use]
    pub const fn strategy(&self) -> ConnectionStrategy {
        self.strategy
    }

    /// Host name or address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Listening port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Container addressed by this endpoint.
    #[must_use]
    pub const fn container(&self) -> &ContainerId {
        &self.container
    }

    /// Agent owning the container.
    #[must_use]
    pub const fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// Shared listener of the owning agent, for routed endpoints.
    #[must_use]
    pub fn agent_endpoint(&self) -> Option<AgentEndpoint> {
        (self.strategy == ConnectionStrategy::Routed)
            .then(|| AgentEndpoint::new(self.agent.clone(), self.host.clone(), self.port))
    }

    /// Encodes the descriptor as an opaque token.
    #[must_use]
    pub fn encode(&self) -> EndpointRef {
        let token = serde_json::json!({
            "strategy": self.strategy.as_str(),
            "host": self.host,
            "port": self.port,
            "container": self.container.as_str(),
            "agent": self.agent.as_str(),
        });
        EndpointRef(token.to_string())
    }
}

/// Opaque endpoint token as stored in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointRef(String);

impl EndpointRef {
    /// Wraps a token received from elsewhere without validating it.
    #[must_use]
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Borrows the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decodes the token.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryDomainError::MalformedEndpoint`] when the token was
    /// not produced by [`ContainerEndpoint::encode`].
    pub fn decode(&self) -> Result<ContainerEndpoint, DirectoryDomainError> {
        serde_json::from_str(&self.0)
            .map_err(|err| DirectoryDomainError::MalformedEndpoint(err.to_string()))
    }
}

impl fmt::Display for EndpointRef {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}
