//! In-process connector: listeners are registered by address.

use super::ChannelAgentLink;
use crate::agent::ports::{Container, ContainerError, PushHandler};
use crate::agent::services::Agent;
use crate::client::ports::{AgentLink, ConnectError, ConnectResult, Connector, DirectLink};
use crate::directory::domain::{AgentEndpoint, ClientId, ContainerEndpoint};
use crate::rpc::adapters::LoopbackChannel;
use crate::rpc::domain::RemoteError;
use crate::rpc::services::AgentListener;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Connector resolving addresses against listeners registered in-process.
///
/// Direct endpoints reach a [`Container`] listening at `host:port`. Agent
/// endpoints reach an [`AgentListener`] through a fresh loopback channel,
/// so routed traffic uses the same protocol as a networked deployment.
#[derive(Default)]
pub struct InMemoryConnector {
    containers: RwLock<HashMap<(String, u16), Arc<dyn Container>>>,
    agents: RwLock<HashMap<AgentEndpoint, AgentListener>>,
    agent_connections: AtomicUsize,
    direct_connections: AtomicUsize,
}

impl InMemoryConnector {
    /// Creates a connector with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `container` reachable at `host:port`.
    pub fn listen_direct(&self, host: impl Into<String>, port: u16, container: Arc<dyn Container>) {
        self.containers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((host.into(), port), container);
    }

    /// Makes `agent` reachable at `endpoint` for routed connections.
    pub fn listen_agent(&self, endpoint: AgentEndpoint, agent: Arc<Agent>) {
        self.agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint, AgentListener::new(agent));
    }

    /// Stops listening at `host:port`.
    pub fn shutdown_direct(&self, host: &str, port: u16) {
        self.containers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(host.to_owned(), port));
    }

    /// Number of agent connections opened so far.
    #[must_use]
    pub fn agent_connections(&self) -> usize {
        self.agent_connections.load(Ordering::SeqCst)
    }

    /// Number of direct connections opened so far.
    #[must_use]
    pub fn direct_connections(&self) -> usize {
        self.direct_connections.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for InMemoryConnector {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("InMemoryConnector")
            .field("agent_connections", &self.agent_connections())
            .field("direct_connections", &self.direct_connections())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect_direct(
        &self,
        client: &ClientId,
        endpoint: &ContainerEndpoint,
    ) -> ConnectResult<Arc<dyn DirectLink>> {
        let container = self
            .containers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(endpoint.host().to_owned(), endpoint.port()))
            .map(Arc::clone)
            .ok_or_else(|| ConnectError::Unreachable {
                host: endpoint.host().to_owned(),
                port: endpoint.port(),
            })?;
        self.direct_connections.fetch_add(1, Ordering::SeqCst);
        debug!(
            client_id = %client,
            container_id = %endpoint.container(),
            "direct connection opened"
        );
        Ok(Arc::new(InProcessDirectLink {
            client: client.clone(),
            container,
        }))
    }

    async fn connect_agent(
        &self,
        client: &ClientId,
        endpoint: &AgentEndpoint,
    ) -> ConnectResult<Arc<dyn AgentLink>> {
        let listener = self
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
            .ok_or_else(|| ConnectError::Unreachable {
                host: endpoint.host().to_owned(),
                port: endpoint.port(),
            })?;
        let (client_end, agent_end) = LoopbackChannel::pair();
        listener.accept(Arc::new(agent_end));
        self.agent_connections.fetch_add(1, Ordering::SeqCst);
        debug!(client_id = %client, agent = %endpoint, "agent connection opened");
        Ok(Arc::new(ChannelAgentLink::open(Arc::new(client_end), client.clone())))
    }
}

struct InProcessDirectLink {
    client: ClientId,
    container: Arc<dyn Container>,
}

fn remote(err: &ContainerError) -> ConnectError {
    ConnectError::Remote(RemoteError::from(err))
}

#[async_trait]
impl DirectLink for InProcessDirectLink {
    async fn request(&self, operation: &str, data: Value) -> ConnectResult<Value> {
        self.container
            .request(operation, data, Some(self.client.clone()))
            .await
            .map_err(|err| remote(&err))
    }

    async fn attach(&self, push: PushHandler) -> ConnectResult<()> {
        self.container.connect(self.client.clone(), push);
        Ok(())
    }

    async fn close(&self) {
        self.container.disconnect(&self.client);
    }
}
