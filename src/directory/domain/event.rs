//! Directory change events.

use super::{AgentId, ContainerKind, ContainerRecord};
use serde::{Deserialize, Serialize};

/// What happened to an agent or container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkEventKind {
    /// First seen.
    Added,
    /// Re-registered or moved.
    Updated,
    /// Gone.
    Removed,
}

/// Change to one agent record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Affected agent.
    pub id: AgentId,
    /// Kinds the agent advertises (or advertised, for removals).
    pub kinds: Vec<ContainerKind>,
    /// Change tag.
    pub event: NetworkEventKind,
}

/// Change to one container record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerEvent {
    /// Record after the change (before it, for removals).
    pub container: ContainerRecord,
    /// Change tag.
    pub event: NetworkEventKind,
}

/// One batch of directory changes, produced by a single mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkEvent {
    /// Agent changes.
    pub agents: Vec<AgentEvent>,
    /// Container changes.
    pub containers: Vec<ContainerEvent>,
}

impl NetworkEvent {
    /// A batch holding a single container change.
    #[must_use]
    pub fn container(container: ContainerRecord, event: NetworkEventKind) -> Self {
        Self {
            agents: Vec::new(),
            containers: vec![ContainerEvent { container, event }],
        }
    }

    /// Whether the batch carries no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.containers.is_empty()
    }

    /// Whether the batch announces a new agent advertising `kind`.
    #[must_use]
    pub fn adds_agent_with_kind(&self, kind: &ContainerKind) -> bool {
        self.agents
            .iter()
            .any(|agent| agent.event == NetworkEventKind::Added && agent.kinds.contains(kind))
    }
}
