//! In-process registry.

use super::state::{DirectoryState, PendingContainer, PendingOutcome};
use crate::config::NetworkConfig;
use crate::directory::domain::{
    AgentId, AgentRecord, AgentRecordInfo, ClientId, ContainerId, ContainerKind, ContainerRecord,
    GetOptions, NetworkEvent, NetworkEventKind, ResolvedContainer,
};
use crate::directory::ports::{
    AgentHandle, DirectoryEvents, EventStreamError, Registry, RegistryError, RegistryResult,
};
use crate::tick::{TickScheduler, TickSubscription, tick_callback};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use mockable::Clock;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 256;

/// Error type listener callbacks may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback receiving directory change batches for one client.
pub type EventListener =
    Arc<dyn Fn(NetworkEvent) -> BoxFuture<'static, Result<(), ListenerError>> + Send + Sync>;

/// Authoritative in-process directory.
///
/// Every mutation runs under a single async mutex, so accept/reject
/// decisions for a container id are race-free. Change batches are published
/// while the lock is held, which keeps per-subscriber ordering identical to
/// mutation order.
pub struct DirectoryService<C>
where
    C: Clock + Send + Sync,
{
    shared: Arc<DirectoryShared<C>>,
    housekeeping: Mutex<Option<TickSubscription>>,
}

struct DirectoryShared<C> {
    state: tokio::sync::Mutex<DirectoryState>,
    events: broadcast::Sender<NetworkEvent>,
    ticks: Arc<dyn TickScheduler>,
    clock: Arc<C>,
    config: NetworkConfig,
}

impl<C> DirectoryService<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Creates an empty directory and schedules its housekeeping sweep.
    #[must_use]
    pub fn new(ticks: Arc<dyn TickScheduler>, clock: Arc<C>, config: NetworkConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let interval = config.housekeeping_interval_ticks;
        let shared = Arc::new(DirectoryShared {
            state: tokio::sync::Mutex::new(DirectoryState::default()),
            events,
            ticks: Arc::clone(&ticks),
            clock,
            config,
        });
        let weak = Arc::downgrade(&shared);
        let subscription = ticks.register(
            interval,
            tick_callback(move || {
                let directory: Weak<DirectoryShared<C>> = Weak::clone(&weak);
                async move {
                    if let Some(live) = directory.upgrade() {
                        live.check_alive().await;
                    }
                }
            }),
        );
        Self {
            shared,
            housekeeping: Mutex::new(Some(subscription)),
        }
    }

    /// Runs one alive/orphan sweep immediately.
    ///
    /// Agents silent for longer than the alive timeout are evicted and
    /// containers without holders for longer than the unused timeout are
    /// terminated.
    pub async fn check_alive(&self) {
        self.shared.check_alive().await;
    }

    /// Removes a container from the directory and terminates it on its agent.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ContainerNotFound`] for unknown ids and
    /// [`RegistryError::Agent`] when the agent fails to terminate it.
    pub async fn terminate(&self, container: &ContainerId) -> RegistryResult<()> {
        self.shared.terminate(container).await
    }

    /// Tracks a client and, optionally, forwards every change batch to
    /// `listener` on a dedicated task.
    pub async fn add_client(&self, client: ClientId, listener: Option<EventListener>) {
        let forwarder = listener.map(|callback| {
            tokio::spawn(forward_events(client.clone(), self.subscribe(), callback))
        });
        let mut state = self.shared.state.lock().await;
        let entry = state.client(&client);
        if let Some(previous) = entry.listener.take() {
            previous.abort();
        }
        entry.listener = forwarder;
    }

    /// Unregisters `agent` only while `handle` is the handle it last
    /// registered with. Returns whether the agent was removed.
    ///
    /// A transport session uses this on close so that an agent which has
    /// already registered again over another session stays registered.
    pub async fn unregister_if_owned(
        &self,
        agent: &AgentId,
        handle: &Arc<dyn AgentHandle>,
    ) -> bool {
        let mut state = self.shared.state.lock().await;
        if !state
            .agents
            .get(agent)
            .is_some_and(|entry| Arc::ptr_eq(&entry.handle, handle))
        {
            debug!(agent_id = %agent, "agent registered through another handle, keeping it");
            return false;
        }
        if let Some(event) = state.remove_agent(agent) {
            info!(agent_id = %agent, containers = event.containers.len(), "agent unregistered");
            self.shared.publish(event);
        }
        true
    }

    /// Forgets a client, releasing every container it still held.
    pub async fn remove_client(&self, client: &ClientId) {
        let now = self.shared.ticks.now();
        let mut state = self.shared.state.lock().await;
        let Some(entry) = state.clients.remove(client) else {
            return;
        };
        if let Some(listener) = entry.listener {
            listener.abort();
        }
        for container in &entry.containers {
            state.release(client, container, now);
        }
        debug!(client_id = %client, released = entry.containers.len(), "client removed");
    }

    /// Containers currently without holders.
    pub async fn orphaned(&self) -> Vec<ContainerId> {
        let state = self.shared.state.lock().await;
        let mut orphans: Vec<ContainerId> = state.orphaned.keys().cloned().collect();
        orphans.sort();
        orphans
    }

    /// Stops the housekeeping sweep.
    pub fn close(&self) {
        let subscription = self
            .housekeeping
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(active) = subscription {
            active.unsubscribe();
        }
    }
}

impl<C> DirectoryShared<C>
where
    C: Clock + Send + Sync + 'static,
{
    fn publish(&self, event: NetworkEvent) {
        if event.is_empty() {
            return;
        }
        debug!(
            agents = event.agents.len(),
            containers = event.containers.len(),
            "publishing directory change"
        );
        if self.events.send(event).is_err() {
            debug!("no directory subscribers");
        }
    }

    async fn check_alive(&self) {
        let now = self.ticks.now();
        let expired = {
            let mut state = self.state.lock().await;
            for agent_id in state.silent_agents(now, self.config.alive_timeout_ticks()) {
                warn!(agent_id = %agent_id, "agent inactive, evicting");
                if let Some(event) = state.remove_agent(&agent_id) {
                    self.publish(event);
                }
            }
            state.expired_orphans(now, self.config.unused_container_timeout_ticks())
        };

        for container in expired {
            match self.terminate(&container).await {
                Ok(()) => info!(container_id = %container, "orphaned container terminated"),
                Err(err) => error!(
                    container_id = %container,
                    error = %err,
                    "failed to terminate orphaned container"
                ),
            }
        }
    }

    async fn terminate(&self, container: &ContainerId) -> RegistryResult<()> {
        let handle = {
            let mut state = self.state.lock().await;
            let entry = state
                .remove_container(container)
                .ok_or_else(|| RegistryError::ContainerNotFound(container.clone()))?;
            let handle = state
                .agents
                .get(&entry.record.agent_id)
                .map(|agent| Arc::clone(&agent.handle));
            self.publish(NetworkEvent::container(entry.record, NetworkEventKind::Removed));
            handle
        };
        match handle {
            Some(agent) => agent.terminate(container).await.map_err(RegistryError::from),
            None => Ok(()),
        }
    }

    /// Asks the selected agent for a container and commits the result.
    async fn create(
        self: Arc<Self>,
        pending_id: u64,
        agent_id: AgentId,
        handle: Arc<dyn AgentHandle>,
        kind: ContainerKind,
        options: GetOptions,
    ) -> RegistryResult<ContainerRecord> {
        let created = handle.get(&kind, &options).await;

        let mut state = self.state.lock().await;
        let pending = state.pending.remove(&pending_id);
        let resolved = created.map_err(|source| RegistryError::CreationFailed {
            kind: kind.clone(),
            source,
        })?;

        let waiting = match pending {
            Some(slot) if state.agents.contains_key(&agent_id) => slot.clients,
            _ => {
                drop(state);
                warn!(
                    agent_id = %agent_id,
                    container_id = %resolved.uuid,
                    "agent left during creation"
                );
                if let Err(err) = handle.terminate(&resolved.uuid).await {
                    debug!(error = %err, "could not terminate container of departed agent");
                }
                return Err(RegistryError::AgentGone(agent_id));
            }
        };

        if let Some(existing) = state.containers.get_mut(&resolved.uuid) {
            existing.clients.extend(waiting);
            let record = existing.record.clone();
            if record.agent_id != agent_id {
                warn!(
                    container_id = %resolved.uuid,
                    owner = %record.agent_id,
                    agent_id = %agent_id,
                    "container created twice, keeping the registered owner"
                );
                drop(state);
                if let Err(err) = handle.terminate(&resolved.uuid).await {
                    error!(error = %err, "failed to terminate duplicate container");
                }
            }
            return Ok(record);
        }

        let record = ContainerRecord {
            uuid: resolved.uuid,
            agent_id: agent_id.clone(),
            kind,
            endpoint: resolved.endpoint,
            last_visit: self.ticks.now(),
            labels: options.labels,
            extra: options.extra,
        };
        if let Some(agent) = state.agents.get_mut(&agent_id) {
            agent.containers.insert(record.uuid.clone());
        }
        state.containers.insert(
            record.uuid.clone(),
            super::state::ContainerEntry {
                record: record.clone(),
                clients: waiting,
            },
        );
        self.publish(NetworkEvent::container(record.clone(), NetworkEventKind::Added));
        Ok(record)
    }

    async fn get(
        self: &Arc<Self>,
        client: &ClientId,
        kind: &ContainerKind,
        options: &GetOptions,
    ) -> RegistryResult<ResolvedContainer> {
        let outcome: PendingOutcome = {
            let mut state = self.state.lock().await;
            state.client(client);
            if let Some(uuid) = &options.uuid
                && let Some(record) = state.attach(client, uuid)
            {
                return Ok(ResolvedContainer {
                    uuid: record.uuid,
                    endpoint: record.endpoint,
                });
            }
            match state.join_pending(client, kind, options) {
                Some(outcome) => outcome,
                None => {
                    let selection = state.select_agent(kind)?;
                    let pending_id = state.next_pending_id();
                    let task = tokio::spawn(Arc::clone(self).create(
                        pending_id,
                        selection.agent.clone(),
                        selection.handle,
                        kind.clone(),
                        options.clone(),
                    ));
                    let outcome = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(join) => Err(RegistryError::internal(join)),
                        }
                    }
                    .boxed()
                    .shared();
                    state.pending.insert(
                        pending_id,
                        PendingContainer {
                            agent: selection.agent,
                            kind: kind.clone(),
                            options: options.clone(),
                            clients: HashSet::from([client.clone()]),
                            outcome: outcome.clone(),
                        },
                    );
                    outcome
                }
            }
        };

        let record = outcome.await?;
        let mut state = self.state.lock().await;
        let attached = state.attach(client, &record.uuid).unwrap_or(record);
        Ok(ResolvedContainer {
            uuid: attached.uuid,
            endpoint: attached.endpoint,
        })
    }
}

async fn forward_events(client: ClientId, mut events: DirectoryEvents, listener: EventListener) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Err(err) = listener(event).await {
                    error!(client_id = %client, error = %err, "directory listener failed");
                }
            }
            Err(EventStreamError::Lagged(missed)) => {
                warn!(client_id = %client, missed, "directory listener lagged");
            }
            Err(EventStreamError::Closed) => return,
        }
    }
}

#[async_trait]
impl<C> Registry for DirectoryService<C>
where
    C: Clock + Send + Sync + 'static,
{
    async fn register(
        &self,
        record: AgentRecord,
        agent: Arc<dyn AgentHandle>,
    ) -> RegistryResult<Vec<ContainerId>> {
        let agent_id = record.agent_id.clone();
        let submitted = record.containers.len();
        let mut state = self.shared.state.lock().await;
        let (rejected, event) =
            state.register(record, agent, self.shared.ticks.now(), self.shared.clock.utc());
        self.shared.publish(event);
        info!(
            agent_id = %agent_id,
            accepted = submitted.saturating_sub(rejected.len()),
            rejected = rejected.len(),
            "agent registered"
        );
        Ok(rejected)
    }

    async fn unregister(&self, agent: &AgentId) -> RegistryResult<()> {
        let mut state = self.shared.state.lock().await;
        if let Some(event) = state.remove_agent(agent) {
            info!(agent_id = %agent, containers = event.containers.len(), "agent unregistered");
            self.shared.publish(event);
        }
        Ok(())
    }

    async fn agents(&self) -> RegistryResult<Vec<AgentRecordInfo>> {
        Ok(self.shared.state.lock().await.agent_infos())
    }

    async fn kinds(&self) -> RegistryResult<Vec<ContainerKind>> {
        Ok(self.shared.state.lock().await.kinds())
    }

    async fn list(&self, kind: Option<&ContainerKind>) -> RegistryResult<Vec<ContainerRecord>> {
        Ok(self.shared.state.lock().await.list(kind))
    }

    async fn get(
        &self,
        client: &ClientId,
        kind: &ContainerKind,
        options: &GetOptions,
    ) -> RegistryResult<ResolvedContainer> {
        self.shared.get(client, kind, options).await
    }

    async fn release(&self, client: &ClientId, container: &ContainerId) -> RegistryResult<()> {
        let now = self.shared.ticks.now();
        self.shared
            .state
            .lock()
            .await
            .release(client, container, now);
        Ok(())
    }

    async fn request(
        &self,
        container: &ContainerId,
        operation: &str,
        data: Value,
    ) -> RegistryResult<Value> {
        let handle = {
            let state = self.shared.state.lock().await;
            state
                .containers
                .get(container)
                .and_then(|entry| state.agents.get(&entry.record.agent_id))
                .map(|agent| Arc::clone(&agent.handle))
                .ok_or_else(|| RegistryError::ContainerNotFound(container.clone()))?
        };
        Ok(handle.request(container, operation, data).await?)
    }

    async fn ping(&self, client: &ClientId, agents: &[AgentId]) -> RegistryResult<()> {
        let now = self.shared.ticks.now();
        let mut state = self.shared.state.lock().await;
        state.client(client);
        for agent_id in agents {
            if let Some(agent) = state.agents.get_mut(agent_id) {
                agent.last_seen = now;
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> DirectoryEvents {
        DirectoryEvents::new(self.shared.events.subscribe())
    }
}
