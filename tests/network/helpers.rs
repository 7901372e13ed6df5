//! Shared fixtures for end-to-end network tests.

use async_trait::async_trait;
use mockable::DefaultClock;
use once_cell::sync::Lazy;
use rstest::fixture;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use switchboard::agent::ports::{
    Container, ContainerError, ContainerResult, CreatedContainer, PushError, PushHandler,
    factory_fn, push_handler,
};
use switchboard::agent::services::{Agent, ClientFanout};
use switchboard::client::adapters::InMemoryConnector;
use switchboard::client::ports::Connector;
use switchboard::client::services::ClientRuntime;
use switchboard::config::NetworkConfig;
use switchboard::directory::domain::{
    AgentEndpoint, AgentId, ClientId, ContainerEndpoint, ContainerId, ContainerKind, GetOptions,
};
use switchboard::directory::ports::Registry;
use switchboard::directory::services::DirectoryService;
use switchboard::rpc::adapters::LoopbackChannel;
use switchboard::rpc::ports::RpcChannel;
use switchboard::rpc::services::{RegistryProxy, RegistryServer};
use switchboard::tick::TickManager;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

static TRACING: Lazy<()> = Lazy::new(|| {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .init();
});

/// Builds a validated kind.
pub fn kind(raw: &str) -> ContainerKind {
    ContainerKind::new(raw).expect("valid test kind")
}

/// Container answering with its tag and pushing to connected clients.
pub struct TaggedContainer {
    tag: String,
    fanout: ClientFanout,
}

impl TaggedContainer {
    /// Creates a container whose replies carry `tag`.
    pub fn new(tag: &str, uuid: &ContainerId) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_owned(),
            fanout: ClientFanout::for_container(uuid.clone()),
        })
    }

    /// Pushes `data` to every connected client and waits for delivery.
    pub async fn push(&self, data: &Value) {
        for delivery in self.fanout.broadcast(data) {
            delivery.await.expect("push delivery task");
        }
    }
}

#[async_trait]
impl Container for TaggedContainer {
    async fn request(
        &self,
        operation: &str,
        data: Value,
        _client: Option<ClientId>,
    ) -> ContainerResult<Value> {
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

/// A directory exposed through a registry server, plus a shared connector.
pub struct Stack {
    /// Logical clock, stepped by hand.
    pub ticks: TickManager,
    /// The authoritative directory.
    pub directory: Arc<DirectoryService<DefaultClock>>,
    /// Connector every runtime dials through.
    pub connector: Arc<InMemoryConnector>,
    created: Arc<Mutex<HashMap<ContainerId, Arc<TaggedContainer>>>>,
    server: RegistryServer<DefaultClock>,
    ports: AtomicU16,
}

impl Stack {
    /// Builds an empty stack.
    pub fn new() -> Self {
        Lazy::force(&TRACING);
        let ticks = TickManager::manual(1);
        let directory = Arc::new(DirectoryService::new(
            Arc::new(ticks.clone()),
            Arc::new(DefaultClock),
            NetworkConfig::testing(),
        ));
        Self {
            ticks,
            server: RegistryServer::new(Arc::clone(&directory)),
            directory,
            connector: Arc::new(InMemoryConnector::new()),
            created: Arc::default(),
            ports: AtomicU16::new(7000),
        }
    }

    /// Opens a client runtime talking to the directory over a loopback
    /// channel.
    pub async fn remote_runtime(&self, id: &str) -> ClientRuntime {
        let (client_end, server_end) = LoopbackChannel::pair();
        self.server.accept(Arc::new(server_end));
        let channel: Arc<dyn RpcChannel> = Arc::new(client_end);
        let proxy = RegistryProxy::connect(Arc::clone(&channel), ClientId::new(id))
            .await
            .expect("registry session");
        ClientRuntime::new(
            ClientId::new(id),
            proxy as Arc<dyn Registry>,
            Arc::clone(&self.connector) as Arc<dyn Connector>,
            Arc::new(self.ticks.clone()),
            NetworkConfig::testing(),
        )
        .with_transport(channel)
    }

    /// Agent creating routed containers of kind `k` behind a shared
    /// listener.
    pub fn routed_agent(&self, id: &str) -> Arc<Agent> {
        let agent_id = AgentId::new(id);
        let listener = AgentEndpoint::new(agent_id.clone(), format!("{id}.agents"), 9000);
        let tag = id.to_owned();
        let created = Arc::clone(&self.created);
        let agent = Arc::new(
            Agent::new(agent_id, Arc::new(self.ticks.clone()))
                .with_endpoint(listener.clone())
                .with_factory(
                    kind("k"),
                    factory_fn(move |options: GetOptions, advertised: Option<AgentEndpoint>| {
                        let uuid = options.uuid.unwrap_or_else(ContainerId::generate);
                        let container = TaggedContainer::new(&tag, &uuid);
                        created
                            .lock()
                            .expect("container table lock")
                            .insert(uuid.clone(), Arc::clone(&container));
                        async move {
                            let shared = advertised.ok_or_else(|| {
                                ContainerError::UnsupportedOperation("routed endpoint".to_owned())
                            })?;
                            Ok::<_, ContainerError>(CreatedContainer {
                                endpoint: ContainerEndpoint::routed(&shared, uuid.clone()).encode(),
                                container: container as Arc<dyn Container>,
                                uuid,
                            })
                        }
                    }),
                ),
        );
        self.connector.listen_agent(listener, Arc::clone(&agent));
        agent
    }

    /// A container some routed agent created.
    pub fn created(&self, uuid: &ContainerId) -> Arc<TaggedContainer> {
        self.created
            .lock()
            .expect("container table lock")
            .get(uuid)
            .map(Arc::clone)
            .expect("container was created")
    }

    /// Agent offering `container` as a stateless candidate under `uuid`,
    /// reachable directly.
    pub async fn candidate_agent(
        &self,
        id: &str,
        uuid: &ContainerId,
        container: Arc<TaggedContainer>,
    ) -> Arc<Agent> {
        let agent = Arc::new(Agent::new(AgentId::new(id), Arc::new(self.ticks.clone())));
        self.offer(&agent, uuid, container).await;
        agent
    }

    /// Adds a stateless candidate to `agent`, listening on a fresh port.
    pub async fn offer(&self, agent: &Agent, uuid: &ContainerId, container: Arc<TaggedContainer>) {
        let host = format!("{}.local", agent.id());
        let port = self.ports.fetch_add(1, Ordering::SeqCst);
        self.connector
            .listen_direct(host.clone(), port, Arc::clone(&container) as Arc<dyn Container>);
        let endpoint =
            ContainerEndpoint::direct(agent.id().clone(), uuid.clone(), host, port).encode();
        agent
            .add_stateless_container(uuid.clone(), kind("k"), endpoint, container)
            .await;
    }
}

impl Default for Stack {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixture that creates a fresh stack.
#[fixture]
pub fn stack() -> Stack {
    Stack::default()
}

/// Push handler forwarding into a channel.
pub fn push_sink() -> (PushHandler, mpsc::UnboundedReceiver<Value>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let handler = push_handler(move |data| {
        let target = sender.clone();
        async move { target.send(data).map_err(|err| Box::new(err) as PushError) }
    });
    (handler, receiver)
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
