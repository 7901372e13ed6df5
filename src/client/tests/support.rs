//! Fixtures shared by the client runtime tests.

use crate::agent::ports::{
    Container, ContainerError, ContainerResult, CreatedContainer, PushError, PushHandler,
    factory_fn, push_handler,
};
use crate::agent::services::{Agent, ClientFanout};
use crate::client::adapters::InMemoryConnector;
use crate::client::services::ClientRuntime;
use crate::config::NetworkConfig;
use crate::directory::domain::{
    AgentEndpoint, AgentId, AgentRecord, AgentRecordInfo, ClientId, ContainerEndpoint,
    ContainerId, ContainerKind, ContainerRecord, GetOptions, ResolvedContainer,
};
use crate::directory::ports::{AgentHandle, DirectoryEvents, Registry, RegistryResult};
use crate::directory::services::DirectoryService;
use crate::tick::TickManager;
use async_trait::async_trait;
use mockable::DefaultClock;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub(super) fn kind(raw: &str) -> ContainerKind {
    ContainerKind::new(raw).expect("valid test kind")
}

/// Container answering every call with its tag and pushing on demand.
pub(super) struct EchoContainer {
    tag: String,
    fanout: ClientFanout,
}

impl EchoContainer {
    pub(super) fn new(tag: &str, uuid: &ContainerId) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_owned(),
            fanout: ClientFanout::for_container(uuid.clone()),
        })
    }

    pub(super) async fn push(&self, data: &Value) {
        for delivery in self.fanout.broadcast(data) {
            delivery.await.expect("push delivery task");
        }
    }

    pub(super) fn connected(&self) -> usize {
        self.fanout.len()
    }
}

#[async_trait]
impl Container for EchoContainer {
    async fn request(
        &self,
        operation: &str,
        data: Value,
        _client: Option<ClientId>,
    ) -> ContainerResult<Value> {
        if operation == "fail" {
            return Err(ContainerError::UnsupportedOperation(operation.to_owned()));
        }
        Ok(json!({ "from": self.tag, "operation": operation, "data": data }))
    }

    async fn terminate(&self) -> ContainerResult<()> {
        Ok(())
    }

    fn connect(&self, client: ClientId, push: PushHandler) {
        self.fanout.connect(client, push);
    }

    fn disconnect(&self, client: &ClientId) {
        self.fanout.disconnect(client);
    }
}

/// How a hosting agent's factory addresses the containers it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Addressing {
    Direct,
    Routed,
    NoConnect,
}

/// One directory, one connector and the containers agents created.
pub(super) struct Network {
    pub(super) ticks: TickManager,
    pub(super) directory: Arc<DirectoryService<DefaultClock>>,
    pub(super) connector: Arc<InMemoryConnector>,
    pub(super) containers: Arc<Mutex<HashMap<ContainerId, Arc<EchoContainer>>>>,
    ports: Arc<AtomicU16>,
}

impl Network {
    pub(super) fn new() -> Self {
        let ticks = TickManager::manual(1);
        let directory = Arc::new(DirectoryService::new(
            Arc::new(ticks.clone()),
            Arc::new(DefaultClock),
            NetworkConfig::testing(),
        ));
        Self {
            ticks,
            directory,
            connector: Arc::new(InMemoryConnector::new()),
            containers: Arc::default(),
            ports: Arc::new(AtomicU16::new(7000)),
        }
    }

    pub(super) fn runtime(&self, id: &str) -> ClientRuntime {
        self.runtime_over(id, Arc::clone(&self.directory) as Arc<dyn Registry>)
    }

    pub(super) fn runtime_over(&self, id: &str, registry: Arc<dyn Registry>) -> ClientRuntime {
        ClientRuntime::new(
            ClientId::new(id),
            registry,
            Arc::clone(&self.connector) as Arc<dyn crate::client::ports::Connector>,
            Arc::new(self.ticks.clone()),
            NetworkConfig::testing(),
        )
    }

    pub(super) fn container(&self, uuid: &ContainerId) -> Arc<EchoContainer> {
        self.containers
            .lock()
            .expect("container table lock")
            .get(uuid)
            .map(Arc::clone)
            .expect("container was created")
    }

    /// Agent whose factory for kind `k` honours the requested uuid.
    pub(super) fn agent(&self, id: &str, addressing: Addressing) -> Arc<Agent> {
        self.build_agent(id, addressing, true)
    }

    /// Agent whose factory always mints a fresh uuid.
    pub(super) fn forgetful_agent(&self, id: &str, addressing: Addressing) -> Arc<Agent> {
        self.build_agent(id, addressing, false)
    }

    fn build_agent(&self, id: &str, addressing: Addressing, honours_uuid: bool) -> Arc<Agent> {
        let agent_id = AgentId::new(id);
        let listener = AgentEndpoint::new(agent_id.clone(), format!("{id}.agents"), 9000);
        let connector = Arc::clone(&self.connector);
        let containers = Arc::clone(&self.containers);
        let ports = Arc::clone(&self.ports);
        let owner = agent_id.clone();
        let mut builder = Agent::new(agent_id, Arc::new(self.ticks.clone()));
        if addressing == Addressing::Routed {
            builder = builder.with_endpoint(listener.clone());
        }
        let agent = Arc::new(builder.with_factory(
            kind("k"),
            factory_fn(move |options: GetOptions, agent_endpoint: Option<AgentEndpoint>| {
                let uuid = options
                    .uuid
                    .filter(|_| honours_uuid)
                    .unwrap_or_else(ContainerId::generate);
                let container = EchoContainer::new(owner.as_str(), &uuid);
                let endpoint = match (addressing, agent_endpoint) {
                    (Addressing::Routed, Some(shared)) => {
                        ContainerEndpoint::routed(&shared, uuid.clone())
                    }
                    (Addressing::Direct, _) => {
                        let port = ports.fetch_add(1, Ordering::SeqCst);
                        let host = format!("{owner}.local");
                        connector.listen_direct(
                            host.clone(),
                            port,
                            Arc::clone(&container) as Arc<dyn Container>,
                        );
                        ContainerEndpoint::direct(owner.clone(), uuid.clone(), host, port)
                    }
                    _ => ContainerEndpoint::no_connect(owner.clone(), uuid.clone()),
                };
                containers
                    .lock()
                    .expect("container table lock")
                    .insert(uuid.clone(), Arc::clone(&container));
                async move {
                    Ok::<_, ContainerError>(CreatedContainer {
                        uuid,
                        container: container as Arc<dyn Container>,
                        endpoint: endpoint.encode(),
                    })
                }
            }),
        ));
        if addressing == Addressing::Routed {
            self.connector.listen_agent(listener, Arc::clone(&agent));
        }
        agent
    }
}

/// Push handler forwarding into a channel.
pub(super) fn push_sink() -> (PushHandler, mpsc::UnboundedReceiver<Value>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let handler = push_handler(move |data| {
        let target = sender.clone();
        async move {
            target.send(data).map_err(|err| Box::new(err) as PushError)
        }
    });
    (handler, receiver)
}

/// Polls `check` until it holds or two seconds pass.
pub(super) async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Registry wrapper counting releases and unregistrations.
///
/// A redirect makes lookups pinned to one id answer with another, as a
/// directory does when a container was replaced under a new id.
pub(super) struct CountingRegistry {
    inner: Arc<dyn Registry>,
    pub(super) releases: AtomicUsize,
    pub(super) unregisters: AtomicUsize,
    redirect: Mutex<Option<(ContainerId, ContainerId)>>,
}

impl CountingRegistry {
    pub(super) fn new(inner: Arc<dyn Registry>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            releases: AtomicUsize::new(0),
            unregisters: AtomicUsize::new(0),
            redirect: Mutex::new(None),
        })
    }

    pub(super) fn redirect(&self, from: &str, to: &str) {
        *self.redirect.lock().expect("redirect lock") =
            Some((ContainerId::new(from), ContainerId::new(to)));
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
        let redirect = self.redirect.lock().expect("redirect lock").clone();
        match (redirect, &options.uuid) {
            (Some((from, to)), Some(uuid)) if *uuid == from => {
                let pinned = GetOptions {
                    uuid: Some(to),
                    ..options.clone()
                };
                self.inner.get(client, kind, &pinned).await
            }
            _ => self.inner.get(client, kind, options).await,
        }
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
