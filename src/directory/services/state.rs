//! Directory tables and the synchronous mutations performed under the lock.

use crate::directory::domain::{
    AgentEndpoint, AgentEvent, AgentId, AgentRecord, AgentRecordInfo, ClientId, ContainerEvent,
    ContainerId, ContainerKind, ContainerRecord, GetOptions, NetworkEvent, NetworkEventKind,
};
use crate::directory::ports::{AgentHandle, RegistryError, RegistryResult};
use crate::tick::Tick;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Shared outcome of an in-flight on-demand creation.
pub(super) type PendingOutcome = Shared<BoxFuture<'static, RegistryResult<ContainerRecord>>>;

pub(super) struct AgentEntry {
    pub(super) handle: Arc<dyn AgentHandle>,
    pub(super) containers: HashSet<ContainerId>,
    pub(super) endpoint: Option<AgentEndpoint>,
    pub(super) kinds: Vec<ContainerKind>,
    pub(super) last_seen: Tick,
    pub(super) registered_at: DateTime<Utc>,
}

impl AgentEntry {
    fn info(&self, agent_id: &AgentId) -> AgentRecordInfo {
        AgentRecordInfo {
            agent_id: agent_id.clone(),
            endpoint: self.endpoint.clone(),
            kinds: self.kinds.clone(),
            containers: self.containers.len(),
            registered_at: self.registered_at,
        }
    }
}

pub(super) struct ContainerEntry {
    pub(super) record: ContainerRecord,
    pub(super) clients: HashSet<ClientId>,
}

#[derive(Default)]
pub(super) struct ClientEntry {
    pub(super) containers: HashSet<ContainerId>,
    pub(super) listener: Option<JoinHandle<()>>,
}

pub(super) struct PendingContainer {
    pub(super) agent: AgentId,
    pub(super) kind: ContainerKind,
    pub(super) options: GetOptions,
    pub(super) clients: HashSet<ClientId>,
    pub(super) outcome: PendingOutcome,
}

impl PendingContainer {
    fn satisfies(&self, kind: &ContainerKind, options: &GetOptions) -> bool {
        if self.kind != *kind {
            return false;
        }
        match &options.uuid {
            Some(uuid) => self.options.uuid.as_ref() == Some(uuid),
            None => self.options.covers_labels_of(options),
        }
    }
}

/// Agent selected to create a container on demand.
pub(super) struct Selection {
    pub(super) agent: AgentId,
    pub(super) handle: Arc<dyn AgentHandle>,
}

/// Every table of the directory, guarded by one async mutex.
#[derive(Default)]
pub(super) struct DirectoryState {
    pub(super) agents: BTreeMap<AgentId, AgentEntry>,
    pub(super) containers: HashMap<ContainerId, ContainerEntry>,
    pub(super) clients: HashMap<ClientId, ClientEntry>,
    pub(super) orphaned: HashMap<ContainerId, Tick>,
    pub(super) pending: BTreeMap<u64, PendingContainer>,
    next_pending: u64,
    round_robin: BTreeMap<ContainerKind, usize>,
}

impl DirectoryState {
    /// Applies a registration and returns the rejected ids with the event batch.
    pub(super) fn register(
        &mut self,
        record: AgentRecord,
        handle: Arc<dyn AgentHandle>,
        now: Tick,
        wall_clock: DateTime<Utc>,
    ) -> (Vec<ContainerId>, NetworkEvent) {
        let AgentRecord {
            agent_id,
            containers,
            kinds,
            endpoint,
        } = record;
        let mut event = NetworkEvent::default();
        let incoming: HashSet<ContainerId> =
            containers.iter().map(|container| container.uuid.clone()).collect();
        let previous = self.agents.remove(&agent_id);

        if let Some(old) = &previous {
            for dropped in old.containers.difference(&incoming) {
                if let Some(entry) = self.remove_container(dropped) {
                    event.containers.push(ContainerEvent {
                        container: entry.record,
                        event: NetworkEventKind::Removed,
                    });
                }
            }
        }

        let mut owned = HashSet::new();
        let mut rejected = Vec::new();
        for mut container in containers {
            container.agent_id = agent_id.clone();
            match self.containers.get_mut(&container.uuid) {
                Some(existing) if existing.record.agent_id != agent_id => {
                    warn!(
                        container_id = %container.uuid,
                        owner = %existing.record.agent_id,
                        agent_id = %agent_id,
                        "container already owned by another agent, rejecting"
                    );
                    rejected.push(container.uuid);
                }
                Some(existing) => {
                    if existing.record.endpoint != container.endpoint {
                        event.containers.push(ContainerEvent {
                            container: container.clone(),
                            event: NetworkEventKind::Updated,
                        });
                    }
                    owned.insert(container.uuid.clone());
                    existing.record = container;
                }
                None => {
                    event.containers.push(ContainerEvent {
                        container: container.clone(),
                        event: NetworkEventKind::Added,
                    });
                    owned.insert(container.uuid.clone());
                    self.containers.insert(
                        container.uuid.clone(),
                        ContainerEntry {
                            record: container,
                            clients: HashSet::new(),
                        },
                    );
                }
            }
        }

        event.agents.push(AgentEvent {
            id: agent_id.clone(),
            kinds: kinds.clone(),
            event: if previous.is_some() {
                NetworkEventKind::Updated
            } else {
                NetworkEventKind::Added
            },
        });
        let registered_at = previous
            .as_ref()
            .map_or(wall_clock, |old| old.registered_at);
        self.agents.insert(
            agent_id,
            AgentEntry {
                handle,
                containers: owned,
                endpoint,
                kinds,
                last_seen: now,
                registered_at,
            },
        );
        (rejected, event)
    }

    /// Removes an agent with its containers and pending creations.
    pub(super) fn remove_agent(&mut self, agent_id: &AgentId) -> Option<NetworkEvent> {
        let agent = self.agents.remove(agent_id)?;
        let mut event = NetworkEvent {
            agents: vec![AgentEvent {
                id: agent_id.clone(),
                kinds: agent.kinds,
                event: NetworkEventKind::Removed,
            }],
            containers: Vec::new(),
        };
        for container_id in &agent.containers {
            if let Some(entry) = self.remove_container(container_id) {
                event.containers.push(ContainerEvent {
                    container: entry.record,
                    event: NetworkEventKind::Removed,
                });
            }
        }
        self.pending.retain(|_, pending| pending.agent != *agent_id);
        Some(event)
    }

    /// Drops a container from every table that references it.
    pub(super) fn remove_container(
        &mut self,
        container_id: &ContainerId,
    ) -> Option<ContainerEntry> {
        let entry = self.containers.remove(container_id)?;
        self.orphaned.remove(container_id);
        if let Some(agent) = self.agents.get_mut(&entry.record.agent_id) {
            agent.containers.remove(container_id);
        }
        for client in &entry.clients {
            if let Some(holder) = self.clients.get_mut(client) {
                holder.containers.remove(container_id);
            }
        }
        Some(entry)
    }

    /// Returns the client record, creating it on first contact.
    pub(super) fn client(&mut self, client: &ClientId) -> &mut ClientEntry {
        self.clients.entry(client.clone()).or_default()
    }

    /// Records `client` as a holder of an existing container.
    pub(super) fn attach(
        &mut self,
        client: &ClientId,
        container_id: &ContainerId,
    ) -> Option<ContainerRecord> {
        let entry = self.containers.get_mut(container_id)?;
        entry.clients.insert(client.clone());
        let record = entry.record.clone();
        self.orphaned.remove(container_id);
        self.client(client).containers.insert(container_id.clone());
        Some(record)
    }

    /// Drops `client` as a holder; orphans the container when nobody is left.
    pub(super) fn release(&mut self, client: &ClientId, container_id: &ContainerId, now: Tick) {
        if let Some(holder) = self.clients.get_mut(client) {
            holder.containers.remove(container_id);
        }
        if let Some(entry) = self.containers.get_mut(container_id) {
            entry.clients.remove(client);
            if entry.clients.is_empty() {
                self.orphaned.insert(container_id.clone(), now);
            }
        }
    }

    /// Finds an in-flight creation that also satisfies this request.
    pub(super) fn join_pending(
        &mut self,
        client: &ClientId,
        kind: &ContainerKind,
        options: &GetOptions,
    ) -> Option<PendingOutcome> {
        let pending = self
            .pending
            .values_mut()
            .find(|pending| pending.satisfies(kind, options))?;
        pending.clients.insert(client.clone());
        Some(pending.outcome.clone())
    }

    /// Picks the next agent advertising `kind`, round-robin in id order.
    /// Each kind rotates on its own cursor.
    pub(super) fn select_agent(&mut self, kind: &ContainerKind) -> RegistryResult<Selection> {
        let no_agent = || RegistryError::NoSuitableAgent(kind.clone());
        let suitable = self
            .agents
            .values()
            .filter(|agent| agent.kinds.contains(kind))
            .count();
        let cursor = self.round_robin.entry(kind.clone()).or_default();
        let turn = *cursor;
        *cursor = turn.wrapping_add(1);
        let position = turn.checked_rem(suitable).ok_or_else(no_agent)?;
        let (agent, entry) = self
            .agents
            .iter()
            .filter(|(_, agent)| agent.kinds.contains(kind))
            .nth(position)
            .ok_or_else(no_agent)?;
        Ok(Selection {
            agent: agent.clone(),
            handle: Arc::clone(&entry.handle),
        })
    }

    /// Reserves a pending-creation slot id.
    pub(super) const fn next_pending_id(&mut self) -> u64 {
        self.next_pending = self.next_pending.wrapping_add(1);
        self.next_pending
    }

    pub(super) fn agent_infos(&self) -> Vec<AgentRecordInfo> {
        self.agents
            .iter()
            .map(|(agent_id, entry)| entry.info(agent_id))
            .collect()
    }

    pub(super) fn kinds(&self) -> Vec<ContainerKind> {
        self.agents
            .values()
            .flat_map(|agent| agent.kinds.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub(super) fn list(&self, kind: Option<&ContainerKind>) -> Vec<ContainerRecord> {
        let mut records: Vec<ContainerRecord> = self
            .containers
            .values()
            .filter(|entry| kind.is_none_or(|wanted| entry.record.kind == *wanted))
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|left, right| left.uuid.cmp(&right.uuid));
        records
    }

    /// Agents whose last sign of life is older than `timeout` ticks.
    pub(super) fn silent_agents(&self, now: Tick, timeout: u64) -> Vec<AgentId> {
        self.agents
            .iter()
            .filter(|(_, agent)| now.saturating_sub(agent.last_seen) > timeout)
            .map(|(agent_id, _)| agent_id.clone())
            .collect()
    }

    /// Orphaned containers older than `timeout` ticks.
    pub(super) fn expired_orphans(&self, now: Tick, timeout: u64) -> Vec<ContainerId> {
        self.orphaned
            .iter()
            .filter(|(_, since)| now.saturating_sub(**since) > timeout)
            .map(|(container_id, _)| container_id.clone())
            .collect()
    }
}
