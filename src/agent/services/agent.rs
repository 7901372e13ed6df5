//! Agent service: container hosting, on-demand creation and HA registration.

use crate::agent::ports::{Container, ContainerError, ContainerFactory, PushHandler};
use crate::directory::domain::{
    AgentEndpoint, AgentId, AgentRecord, ClientId, ContainerId, ContainerKind, ContainerRecord,
    EndpointRef, GetOptions, ResolvedContainer,
};
use crate::directory::ports::{AgentError, AgentHandle, AgentResult, Registry, RegistryResult};
use crate::tick::{Tick, TickScheduler};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// A container hosted by an agent, with its directory metadata.
#[derive(Clone)]
pub struct HostedContainer {
    /// Container identity.
    pub uuid: ContainerId,
    /// Container kind.
    pub kind: ContainerKind,
    /// Advertised endpoint.
    pub endpoint: EndpointRef,
    /// The instance.
    pub container: Arc<dyn Container>,
    /// Tick of the last request routed to the container.
    pub last_visit: Tick,
    /// Labels the container was created with.
    pub labels: Option<Vec<String>>,
    /// Factory payload the container was created with.
    pub extra: Option<Value>,
}

impl HostedContainer {
    fn record(&self, agent_id: &AgentId) -> ContainerRecord {
        ContainerRecord {
            uuid: self.uuid.clone(),
            agent_id: agent_id.clone(),
            kind: self.kind.clone(),
            endpoint: self.endpoint.clone(),
            last_visit: self.last_visit,
            labels: self.labels.clone(),
            extra: self.extra.clone(),
        }
    }
}

impl fmt::Debug for HostedContainer {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HostedContainer")
            .field("uuid", &self.uuid)
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("last_visit", &self.last_visit)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct AgentState {
    active: HashMap<ContainerId, HostedContainer>,
    stateless: HashMap<ContainerId, HostedContainer>,
    terminating: HashSet<ContainerId>,
}

impl AgentState {
    /// Looks in the stateless pool first: a candidate offered under an id
    /// shadows an active container with the same id.
    fn find(&self, uuid: &ContainerId) -> Option<&HostedContainer> {
        self.stateless.get(uuid).or_else(|| self.active.get(uuid))
    }

    fn find_mut(&mut self, uuid: &ContainerId) -> Option<&mut HostedContainer> {
        match self.stateless.get_mut(uuid) {
            Some(hosted) => Some(hosted),
            None => self.active.get_mut(uuid),
        }
    }
}

/// A process hosting containers and advertising them to the directory.
pub struct Agent {
    id: AgentId,
    endpoint: RwLock<Option<AgentEndpoint>>,
    factories: HashMap<ContainerKind, Arc<dyn ContainerFactory>>,
    ticks: Arc<dyn TickScheduler>,
    state: Mutex<AgentState>,
    creating: Mutex<HashMap<ContainerId, Arc<Mutex<()>>>>,
}

impl Agent {
    /// Creates an agent with no factories and no shared listener.
    #[must_use]
    pub fn new(id: AgentId, ticks: Arc<dyn TickScheduler>) -> Self {
        Self {
            id,
            endpoint: RwLock::new(None),
            factories: HashMap::new(),
            ticks,
            state: Mutex::new(AgentState::default()),
            creating: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the shared listener used for routed endpoints.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: AgentEndpoint) -> Self {
        self.endpoint = RwLock::new(Some(endpoint));
        self
    }

    /// Adds a factory for `kind`.
    #[must_use]
    pub fn with_factory(mut self, kind: ContainerKind, factory: Arc<dyn ContainerFactory>) -> Self {
        self.factories.insert(kind, factory);
        self
    }

    /// Agent identity.
    #[must_use]
    pub const fn id(&self) -> &AgentId {
        &self.id
    }

    /// Kinds this agent can create, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<ContainerKind> {
        let mut kinds: Vec<ContainerKind> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Current shared listener.
    pub async fn endpoint(&self) -> Option<AgentEndpoint> {
        self.endpoint.read().await.clone()
    }

    /// Replaces the shared listener; callers re-register afterwards.
    pub async fn set_endpoint(&self, endpoint: Option<AgentEndpoint>) {
        *self.endpoint.write().await = endpoint;
    }

    /// Returns a stateless candidate or active container matching
    /// `options.uuid`, or creates one with the kind's factory.
    ///
    /// Concurrent calls for the same uuid share a single factory call.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::UnknownKind`] when no factory serves `kind` and
    /// [`AgentError::Factory`] when the factory fails.
    pub async fn get(
        &self,
        kind: &ContainerKind,
        options: &GetOptions,
    ) -> AgentResult<HostedContainer> {
        let Some(uuid) = &options.uuid else {
            return self.create(kind, options).await;
        };
        if let Some(found) = self.state.lock().await.find(uuid).cloned() {
            return Ok(found);
        }

        let gate = Arc::clone(
            self.creating
                .lock()
                .await
                .entry(uuid.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        let _creation = gate.lock().await;
        if let Some(found) = self.state.lock().await.find(uuid).cloned() {
            return Ok(found);
        }
        let created = self.create(kind, options).await;
        self.creating.lock().await.remove(uuid);
        created
    }

    async fn create(
        &self,
        kind: &ContainerKind,
        options: &GetOptions,
    ) -> AgentResult<HostedContainer> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| AgentError::UnknownKind(kind.clone()))?;
        let endpoint = self.endpoint().await;
        let created = factory
            .create(options, endpoint.as_ref())
            .await
            .map_err(|err| AgentError::factory(kind.clone(), err))?;
        let hosted = HostedContainer {
            uuid: created.uuid,
            kind: kind.clone(),
            endpoint: created.endpoint,
            container: created.container,
            last_visit: self.ticks.now(),
            labels: options.labels.clone(),
            extra: options.extra.clone(),
        };
        debug!(agent_id = %self.id, container_id = %hosted.uuid, kind = %kind, "container created");
        self.state
            .lock()
            .await
            .active
            .insert(hosted.uuid.clone(), hosted.clone());
        Ok(hosted)
    }

    /// Lists stateless candidates and active containers, optionally by kind.
    pub async fn list(&self, kind: Option<&ContainerKind>) -> Vec<ContainerRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<ContainerRecord> = state
            .stateless
            .values()
            .chain(state.active.values())
            .filter(|hosted| kind.is_none_or(|wanted| hosted.kind == *wanted))
            .map(|hosted| hosted.record(&self.id))
            .collect();
        records.sort_by(|left, right| left.uuid.cmp(&right.uuid));
        records
    }

    /// Whether `uuid` is currently offered as a stateless candidate.
    pub async fn is_stateless(&self, uuid: &ContainerId) -> bool {
        self.state.lock().await.stateless.contains_key(uuid)
    }

    /// Whether `uuid` is currently an active container.
    pub async fn is_active(&self, uuid: &ContainerId) -> bool {
        self.state.lock().await.active.contains_key(uuid)
    }

    async fn live(&self, uuid: &ContainerId) -> AgentResult<Arc<dyn Container>> {
        let mut state = self.state.lock().await;
        if state.terminating.contains(uuid) {
            return Err(AgentError::Terminating(uuid.clone()));
        }
        let now = self.ticks.now();
        let hosted = state
            .find_mut(uuid)
            .ok_or_else(|| AgentError::ContainerNotFound(uuid.clone()))?;
        hosted.last_visit = now;
        Ok(Arc::clone(&hosted.container))
    }

    /// Forwards a data-plane call to a hosted container.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ContainerNotFound`] for unknown ids,
    /// [`AgentError::Terminating`] while the container shuts down, and
    /// [`AgentError::Container`] for container failures.
    pub async fn request(
        &self,
        uuid: &ContainerId,
        operation: &str,
        data: Value,
        client: Option<ClientId>,
    ) -> AgentResult<Value> {
        let container = self.live(uuid).await?;
        container
            .request(operation, data, client)
            .await
            .map_err(|err| match err {
                ContainerError::Terminated => AgentError::Terminating(uuid.clone()),
                other => AgentError::container(other),
            })
    }

    /// Attaches a client to a hosted container's push stream.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ContainerNotFound`] or
    /// [`AgentError::Terminating`].
    pub async fn connect(
        &self,
        uuid: &ContainerId,
        client: ClientId,
        push: PushHandler,
    ) -> AgentResult<()> {
        let container = self.live(uuid).await?;
        container.connect(client, push);
        Ok(())
    }

    /// Detaches a client from a hosted container. Unknown ids are ignored.
    pub async fn disconnect(&self, uuid: &ContainerId, client: &ClientId) {
        let container = self
            .state
            .lock()
            .await
            .find(uuid)
            .map(|hosted| Arc::clone(&hosted.container));
        if let Some(target) = container {
            target.disconnect(client);
        }
    }

    /// Refreshes a container's last-visit tick.
    pub async fn ping(&self, uuid: &ContainerId) {
        let now = self.ticks.now();
        if let Some(hosted) = self.state.lock().await.find_mut(uuid) {
            hosted.last_visit = now;
        }
    }

    /// Runs a container's termination hook and forgets it. Unknown ids are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Container`] when the hook fails; the container
    /// is forgotten either way.
    pub async fn terminate(&self, uuid: &ContainerId) -> AgentResult<()> {
        let container = {
            let mut state = self.state.lock().await;
            let Some(hosted) = state.find(uuid).map(|hosted| Arc::clone(&hosted.container)) else {
                return Ok(());
            };
            state.terminating.insert(uuid.clone());
            hosted
        };

        let outcome = container.terminate().await;

        let mut state = self.state.lock().await;
        state.active.remove(uuid);
        state.stateless.remove(uuid);
        state.terminating.remove(uuid);
        debug!(agent_id = %self.id, container_id = %uuid, "container terminated");
        outcome.map_err(AgentError::container)
    }

    /// Offers a pre-built container as an HA candidate under a fixed id.
    pub async fn add_stateless_container(
        &self,
        uuid: ContainerId,
        kind: ContainerKind,
        endpoint: EndpointRef,
        container: Arc<dyn Container>,
    ) {
        let hosted = HostedContainer {
            uuid: uuid.clone(),
            kind,
            endpoint,
            container,
            last_visit: self.ticks.now(),
            labels: None,
            extra: None,
        };
        self.state.lock().await.stateless.insert(uuid, hosted);
    }

    /// Withdraws an HA candidate without terminating it.
    pub async fn remove_stateless_container(&self, uuid: &ContainerId) -> Option<HostedContainer> {
        self.state.lock().await.stateless.remove(uuid)
    }

    /// Advertises every hosted container to `registry`.
    ///
    /// Candidates the directory rejects (another agent owns the id) are
    /// terminated locally; accepted candidates become active containers.
    /// Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Propagates directory failures; conflicts are never reported.
    pub async fn register(self: &Arc<Self>, registry: &dyn Registry) -> RegistryResult<()> {
        let (record, offered) = {
            let state = self.state.lock().await;
            let offered: HashSet<ContainerId> = state.stateless.keys().cloned().collect();
            let containers = state
                .stateless
                .values()
                .chain(state.active.values())
                .map(|hosted| hosted.record(&self.id))
                .collect();
            let record = AgentRecord {
                agent_id: self.id.clone(),
                containers,
                kinds: self.kinds(),
                endpoint: self.endpoint().await,
            };
            (record, offered)
        };

        let handle: Arc<dyn AgentHandle> = Arc::clone(self) as Arc<dyn AgentHandle>;
        let rejected = registry.register(record, handle).await?;

        for uuid in &rejected {
            warn!(
                agent_id = %self.id,
                container_id = %uuid,
                "lost ownership race, terminating local copy"
            );
            if let Err(err) = self.terminate(uuid).await {
                error!(
                    agent_id = %self.id,
                    container_id = %uuid,
                    error = %err,
                    "failed to terminate rejected container"
                );
            }
        }

        let mut state = self.state.lock().await;
        for uuid in offered.iter().filter(|uuid| !rejected.contains(uuid)) {
            if let Some(hosted) = state.stateless.remove(uuid) {
                info!(agent_id = %self.id, container_id = %uuid, "stateless candidate promoted");
                state.active.insert(uuid.clone(), hosted);
            }
        }
        Ok(())
    }

    /// Terminates every hosted container.
    pub async fn close(&self) {
        let uuids: Vec<ContainerId> = {
            let state = self.state.lock().await;
            state.active.keys().chain(state.stateless.keys()).cloned().collect()
        };
        for uuid in uuids {
            if let Err(err) = self.terminate(&uuid).await {
                error!(
                    agent_id = %self.id,
                    container_id = %uuid,
                    error = %err,
                    "failed to terminate container on close"
                );
            }
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Agent")
            .field("id", &self.id)
            .field("kinds", &self.kinds())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AgentHandle for Agent {
    async fn get(
        &self,
        kind: &ContainerKind,
        options: &GetOptions,
    ) -> AgentResult<ResolvedContainer> {
        let hosted = Self::get(self, kind, options).await?;
        Ok(ResolvedContainer {
            uuid: hosted.uuid,
            endpoint: hosted.endpoint,
        })
    }

    async fn request(
        &self,
        container: &ContainerId,
        operation: &str,
        data: Value,
    ) -> AgentResult<Value> {
        Self::request(self, container, operation, data, None).await
    }

    async fn terminate(&self, container: &ContainerId) -> AgentResult<()> {
        Self::terminate(self, container).await
    }
}
