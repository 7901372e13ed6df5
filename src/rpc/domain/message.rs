//! Operation set exchanged between registry, agents and client runtimes.

use crate::directory::domain::{
    AgentId, AgentRecord, ClientId, ContainerId, ContainerKind, GetOptions, NetworkEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One protocol call.
///
/// Serialised as `{"op": "<code>", "args": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "camelCase")]
pub enum RpcRequest {
    /// Opens a registry session for a client runtime.
    Hello {
        /// Caller identity.
        client: ClientId,
    },
    /// Agent registration.
    Register {
        /// Agent and container records.
        record: AgentRecord,
    },
    /// Agent removal.
    Unregister {
        /// Departing agent.
        agent: AgentId,
    },
    /// Directory introspection: agents.
    GetAgents,
    /// Directory introspection: kinds.
    GetKinds,
    /// Container listing.
    ListContainers {
        /// Optional kind filter.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ContainerKind>,
    },
    /// Container lookup.
    GetContainer {
        /// Caller identity.
        client: ClientId,
        /// Requested kind.
        kind: ContainerKind,
        /// Lookup hints.
        #[serde(default)]
        options: GetOptions,
    },
    /// Caller-side disuse signal.
    ReleaseContainer {
        /// Caller identity.
        client: ClientId,
        /// Released container.
        container: ContainerId,
    },
    /// Data-plane call proxied through the registry.
    SendContainer {
        /// Target container.
        container: ContainerId,
        /// Operation name.
        operation: String,
        /// Operation payload.
        data: Value,
    },
    /// Keep-alive from a client runtime and the agents it hosts.
    Ping {
        /// Caller identity.
        client: ClientId,
        /// Agents hosted by the caller.
        agents: Vec<AgentId>,
    },
    /// Directory change batch pushed to a client runtime.
    ContainerUpdate {
        /// The batch.
        event: NetworkEvent,
    },
    /// Registry asks a hosted agent for a container.
    AgentGet {
        /// Target agent.
        agent: AgentId,
        /// Requested kind.
        kind: ContainerKind,
        /// Lookup hints.
        #[serde(default)]
        options: GetOptions,
    },
    /// Registry forwards a data-plane call to a hosted agent.
    AgentRequest {
        /// Target agent.
        agent: AgentId,
        /// Target container.
        container: ContainerId,
        /// Operation name.
        operation: String,
        /// Operation payload.
        data: Value,
    },
    /// Registry terminates a container on a hosted agent.
    Terminate {
        /// Target agent.
        agent: AgentId,
        /// Container to terminate.
        container: ContainerId,
    },
    /// Client attaches to a container's push stream through its agent.
    Connect {
        /// Target container.
        container: ContainerId,
        /// Caller identity.
        client: ClientId,
    },
    /// Client detaches from a container.
    Disconnect {
        /// Target container.
        container: ContainerId,
        /// Caller identity.
        client: ClientId,
    },
    /// Data-plane call over a routed connection.
    ConnectionRequest {
        /// Target container.
        container: ContainerId,
        /// Caller identity.
        client: ClientId,
        /// Operation name.
        operation: String,
        /// Operation payload.
        data: Value,
    },
    /// Data pushed by a container over a routed connection.
    Push {
        /// Source container.
        container: ContainerId,
        /// Pushed payload.
        data: Value,
    },
}

impl RpcRequest {
    /// Short wire code of the operation.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Register { .. } => "register",
            Self::Unregister { .. } => "unregister",
            Self::GetAgents => "getAgents",
            Self::GetKinds => "getKinds",
            Self::ListContainers { .. } => "listContainers",
            Self::GetContainer { .. } => "getContainer",
            Self::ReleaseContainer { .. } => "releaseContainer",
            Self::SendContainer { .. } => "sendContainer",
            Self::Ping { .. } => "ping",
            Self::ContainerUpdate { .. } => "containerUpdate",
            Self::AgentGet { .. } => "agentGet",
            Self::AgentRequest { .. } => "agentRequest",
            Self::Terminate { .. } => "terminate",
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::ConnectionRequest { .. } => "connectionRequest",
            Self::Push { .. } => "push",
        }
    }
}
