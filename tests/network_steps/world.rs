//! Shared world state for network BDD scenarios.

use async_trait::async_trait;
use eyre::WrapErr;
use mockable::DefaultClock;
use rstest::fixture;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use switchboard::agent::ports::{
    Container, ContainerError, ContainerResult, CreatedContainer, PushHandler, factory_fn,
};
use switchboard::agent::services::Agent;
use switchboard::client::adapters::InMemoryConnector;
use switchboard::client::domain::ClientResult;
use switchboard::client::ports::Connector;
use switchboard::client::services::{ClientRuntime, ContainerReference};
use switchboard::config::NetworkConfig;
use switchboard::directory::domain::{
    AgentId, AgentRecord, AgentRecordInfo, ClientId, ContainerEndpoint, ContainerId, ContainerKind,
    ContainerRecord, GetOptions, ResolvedContainer,
};
use switchboard::directory::ports::{AgentHandle, DirectoryEvents, Registry, RegistryResult};
use switchboard::directory::services::DirectoryService;
use switchboard::tick::TickManager;
use tokio::task::JoinHandle;

/// Scenario world for directory and runtime behaviour tests.
pub struct NetworkWorld {
    /// Logical clock, never advanced unless a step says so.
    pub ticks: TickManager,
    /// The authoritative directory.
    pub directory: Arc<DirectoryService<DefaultClock>>,
    /// Directory wrapper counting releases and unregistrations.
    pub counting: Arc<CountingRegistry>,
    /// Runtime under test, once created.
    pub runtime: Option<Arc<ClientRuntime>>,
    /// Agents created by the scenario, by name.
    pub agents: HashMap<String, Arc<Agent>>,
    /// Resolution started in the background.
    pub pending: Option<JoinHandle<ClientResult<ContainerReference>>>,
}

impl NetworkWorld {
    /// Creates a world around an empty directory.
    #[must_use]
    pub fn new() -> Self {
        let ticks = TickManager::manual(1);
        let directory = Arc::new(DirectoryService::new(
            Arc::new(ticks.clone()),
            Arc::new(DefaultClock),
            NetworkConfig::testing(),
        ));
        let counting = Arc::new(CountingRegistry::new(
            Arc::clone(&directory) as Arc<dyn Registry>
        ));
        Self {
            ticks,
            directory,
            counting,
            runtime: None,
            agents: HashMap::new(),
            pending: None,
        }
    }

    /// Builds a runtime on the counting wrapper.
    pub fn start_runtime(&mut self, id: &str) {
        self.runtime = Some(Arc::new(ClientRuntime::new(
            ClientId::new(id),
            Arc::clone(&self.counting) as Arc<dyn Registry>,
            Arc::new(InMemoryConnector::new()) as Arc<dyn Connector>,
            Arc::new(self.ticks.clone()),
            NetworkConfig::testing(),
        )));
    }

    /// The runtime created by an earlier step.
    pub fn runtime(&self) -> Result<Arc<ClientRuntime>, eyre::Report> {
        self.runtime
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| eyre::eyre!("no client runtime in scenario world"))
    }

    /// An agent created by an earlier step.
    pub fn agent(&self, name: &str) -> Result<Arc<Agent>, eyre::Report> {
        self.agents
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| eyre::eyre!("no agent named '{name}' in scenario world"))
    }

    /// Creates (or returns) an agent that mints containers of `raw_kind`.
    pub fn agent_with_kind(
        &mut self,
        name: &str,
        raw_kind: &str,
    ) -> Result<Arc<Agent>, eyre::Report> {
        if let Some(existing) = self.agents.get(name) {
            return Ok(Arc::clone(existing));
        }
        let container_kind = ContainerKind::new(raw_kind)?;
        let owner = AgentId::new(name);
        let factory_owner = owner.clone();
        let agent = Arc::new(
            Agent::new(owner, Arc::new(self.ticks.clone())).with_factory(
                container_kind,
                factory_fn(move |options: GetOptions, _| {
                    let agent_id = factory_owner.clone();
                    async move {
                        let uuid = options.uuid.unwrap_or_else(ContainerId::generate);
                        Ok::<_, ContainerError>(CreatedContainer {
                            endpoint: ContainerEndpoint::no_connect(agent_id, uuid.clone())
                                .encode(),
                            container: Arc::new(StaticContainer) as Arc<dyn Container>,
                            uuid,
                        })
                    }
                }),
            ),
        );
        self.agents.insert(name.to_owned(), Arc::clone(&agent));
        Ok(agent)
    }

    /// Creates (or returns) an agent without factories.
    pub fn plain_agent(&mut self, name: &str) -> Arc<Agent> {
        let ticks = self.ticks.clone();
        Arc::clone(
            self.agents
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(Agent::new(AgentId::new(name), Arc::new(ticks)))),
        )
    }

    /// Has agent `name` offer a stateless candidate of kind `k` under `uuid`.
    pub fn offer_stateless(&mut self, name: &str, uuid: &str) -> Result<(), eyre::Report> {
        let agent = self.plain_agent(name);
        let container_id = ContainerId::new(uuid);
        let endpoint =
            ContainerEndpoint::no_connect(agent.id().clone(), container_id.clone()).encode();
        run_async(agent.add_stateless_container(
            container_id,
            ContainerKind::new("k")?,
            endpoint,
            Arc::new(StaticContainer) as Arc<dyn Container>,
        ));
        Ok(())
    }

    /// Registers agent `name` with the directory.
    pub fn register(&self, name: &str) -> Result<(), eyre::Report> {
        let agent = self.agent(name)?;
        run_async(agent.register(self.directory.as_ref()))
            .wrap_err_with(|| format!("register agent '{name}'"))
    }
}

impl Default for NetworkWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixture that creates a new scenario world.
#[fixture]
pub fn world() -> NetworkWorld {
    NetworkWorld::default()
}

/// Runs an async operation within sync step definitions.
pub fn run_async<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}

/// Container answering every call with a fixed payload.
pub struct StaticContainer;

#[async_trait]
impl Container for StaticContainer {
    async fn request(
        &self,
        operation: &str,
        _data: Value,
        _client: Option<ClientId>,
    ) -> ContainerResult<Value> {
        Ok(json!({ "operation": operation }))
    }

    async fn terminate(&self) -> ContainerResult<()> {
        Ok(())
    }

    fn connect(&self, _client: ClientId, _push: PushHandler) {}

    fn disconnect(&self, _client: &ClientId) {}
}

/// Registry wrapper counting releases and unregistrations.
pub struct CountingRegistry {
    inner: Arc<dyn Registry>,
    /// Release calls seen.
    pub releases: AtomicUsize,
    /// Unregister calls seen.
    pub unregisters: AtomicUsize,
}

impl CountingRegistry {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn Registry>) -> Self {
        Self {
            inner,
            releases: AtomicUsize::new(0),
            unregisters: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Registry for CountingRegistry {
    async fn register(
        &self,
        record: AgentRecord,
        agent: Arc<dyn AgentHandle>,
    ) -> RegistryResult<Vec<ContainerId>> {
        self.inner.register(record, agent).await
    }

    async fn unregister(&self, agent: &AgentId) -> RegistryResult<()> {
        self.unregisters.fetch_add(1, Ordering::SeqCst);
        self.inner.unregister(agent).await
    }

    async fn agents(&self) -> RegistryResult<Vec<AgentRecordInfo>> {
        self.inner.agents().await
    }

    async fn kinds(&self) -> RegistryResult<Vec<ContainerKind>> {
        self.inner.kinds().await
    }

    async fn list(&self, kind: Option<&ContainerKind>) -> RegistryResult<Vec<ContainerRecord>> {
        self.inner.list(kind).await
    }

    async fn get(
        &self,
        client: &ClientId,
        kind: &ContainerKind,
        options: &GetOptions,
    ) -> RegistryResult<ResolvedContainer> {
        self.inner.get(client, kind, options).await
    }

    async fn release(&self, client: &ClientId, container: &ContainerId) -> RegistryResult<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release(client, container).await
    }

    async fn request(
        &self,
        container: &ContainerId,
        operation: &str,
        data: Value,
    ) -> RegistryResult<Value> {
        self.inner.request(container, operation, data).await
    }

    async fn ping(&self, client: &ClientId, agents: &[AgentId]) -> RegistryResult<()> {
        self.inner.ping(client, agents).await
    }

    fn subscribe(&self) -> DirectoryEvents {
        self.inner.subscribe()
    }
}
