//! Directory records and lookup options.

use super::{AgentEndpoint, AgentId, ContainerId, ContainerKind, EndpointRef};
use crate::tick::Tick;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hints attached to a container lookup.
///
/// `labels` and `extra` are opaque to the directory and forwarded to the
/// agent's factory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetOptions {
    /// Reuse this specific container when it exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<ContainerId>,
    /// Ordered affinity hints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    /// Pass-through payload for factories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl GetOptions {
    /// Options requesting a specific container.
    #[must_use]
    pub fn for_uuid(uuid: impl Into<ContainerId>) -> Self {
        Self {
            uuid: Some(uuid.into()),
            ..Self::default()
        }
    }

    /// Sets affinity labels.
    #[must_use]
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the factory pass-through payload.
    #[must_use]
    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Whether a pending request made with `self` also satisfies `wanted`.
    ///
    /// Unlabelled requests accept anything; labelled ones need every label
    /// present on the pending request.
    #[must_use]
    pub fn covers_labels_of(&self, wanted: &Self) -> bool {
        wanted.labels.as_ref().is_none_or(|required| {
            self.labels
                .as_ref()
                .is_some_and(|offered| required.iter().all(|label| offered.contains(label)))
        })
    }
}

/// The directory's knowledge of one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Container identity.
    pub uuid: ContainerId,
    /// Owning agent.
    pub agent_id: AgentId,
    /// Container kind.
    pub kind: ContainerKind,
    /// Advertised endpoint.
    pub endpoint: EndpointRef,
    /// Tick the container was last visited.
    pub last_visit: Tick,
    /// Labels the container was created with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    /// Factory payload the container was created with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

/// Registration payload an agent submits to the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Registering agent.
    pub agent_id: AgentId,
    /// Containers the agent currently hosts or offers.
    pub containers: Vec<ContainerRecord>,
    /// Kinds the agent can create on demand.
    pub kinds: Vec<ContainerKind>,
    /// Shared listener for routed connections, when the agent has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<AgentEndpoint>,
}

/// Summary of a registered agent returned by directory introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecordInfo {
    /// Agent identity.
    pub agent_id: AgentId,
    /// Shared listener, if any.
    pub endpoint: Option<AgentEndpoint>,
    /// Advertised kinds.
    pub kinds: Vec<ContainerKind>,
    /// Number of containers the agent owns.
    pub containers: usize,
    /// Wall-clock time of the first registration.
    pub registered_at: DateTime<Utc>,
}

/// Outcome of a successful lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedContainer {
    /// Resolved container identity.
    pub uuid: ContainerId,
    /// Endpoint to reach it.
    pub endpoint: EndpointRef,
}
