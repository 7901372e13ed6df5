//! Client side of the registry protocol.

use crate::directory::domain::{
    AgentId, AgentRecord, AgentRecordInfo, ClientId, ContainerId, ContainerKind, ContainerRecord,
    ErrorKind, GetOptions, NetworkEvent, ResolvedContainer,
};
use crate::directory::ports::{AgentHandle, DirectoryEvents, Registry, RegistryResult};
use crate::rpc::domain::{RemoteError, RpcRequest};
use crate::rpc::ports::{RpcChannel, RpcHandler, decode_reply};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 256;

/// [`Registry`] implementation that forwards every call over a channel.
///
/// Agents registered through the proxy stay reachable by the remote
/// directory: inbound `agentGet`, `agentRequest` and `terminate` calls are
/// dispatched to the local handles. Directory change batches pushed by the
/// server are republished to [`Registry::subscribe`] subscribers.
pub struct RegistryProxy {
    client: ClientId,
    channel: Arc<dyn RpcChannel>,
    agents: RwLock<HashMap<AgentId, Arc<dyn AgentHandle>>>,
    events: broadcast::Sender<NetworkEvent>,
}

impl RegistryProxy {
    /// Opens a registry session for `client` on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::directory::ports::RegistryError::Transport`] when the server cannot be
    /// reached.
    pub async fn connect(
        channel: Arc<dyn RpcChannel>,
        client: ClientId,
    ) -> RegistryResult<Arc<Self>> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let proxy = Arc::new(Self {
            client: client.clone(),
            channel: Arc::clone(&channel),
            agents: RwLock::new(HashMap::new()),
            events,
        });
        channel.serve(Arc::new(ProxyHandler {
            proxy: Arc::downgrade(&proxy),
        }));
        channel.call(RpcRequest::Hello { client }).await?;
        info!(client_id = %proxy.client, "registry proxy connected");
        Ok(proxy)
    }

    /// Identity this proxy opened its session with.
    #[must_use]
    pub const fn client(&self) -> &ClientId {
        &self.client
    }

    /// Closes the underlying channel.
    pub async fn close(&self) {
        self.channel.close().await;
    }

    async fn call<T: DeserializeOwned>(&self, request: RpcRequest) -> RegistryResult<T> {
        let reply = self.channel.call(request).await?;
        Ok(decode_reply(reply)?)
    }

    async fn local_agent(&self, agent: &AgentId) -> Result<Arc<dyn AgentHandle>, RemoteError> {
        self.agents
            .read()
            .await
            .get(agent)
            .map(Arc::clone)
            .ok_or_else(|| {
                RemoteError::new(
                    ErrorKind::NotFound,
                    format!("agent {agent} is not hosted here"),
                )
            })
    }
}

impl std::fmt::Debug for RegistryProxy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RegistryProxy")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Registry for RegistryProxy {
    async fn register(
        &self,
        record: AgentRecord,
        agent: Arc<dyn AgentHandle>,
    ) -> RegistryResult<Vec<ContainerId>> {
        self.agents
            .write()
            .await
            .insert(record.agent_id.clone(), agent);
        self.call(RpcRequest::Register { record }).await
    }

    async fn unregister(&self, agent: &AgentId) -> RegistryResult<()> {
        self.agents.write().await.remove(agent);
        self.call::<Value>(RpcRequest::Unregister {
            agent: agent.clone(),
        })
        .await?;
        Ok(())
    }

    async fn agents(&self) -> RegistryResult<Vec<AgentRecordInfo>> {
        self.call(RpcRequest::GetAgents).await
    }

    async fn kinds(&self) -> RegistryResult<Vec<ContainerKind>> {
        self.call(RpcRequest::GetKinds).await
    }

    async fn list(&self, kind: Option<&ContainerKind>) -> RegistryResult<Vec<ContainerRecord>> {
        self.call(RpcRequest::ListContainers {
            kind: kind.cloned(),
        })
        .await
    }

    async fn get(
        &self,
        client: &ClientId,
        kind: &ContainerKind,
        options: &GetOptions,
    ) -> RegistryResult<ResolvedContainer> {
        self.call(RpcRequest::GetContainer {
            client: client.clone(),
            kind: kind.clone(),
            options: options.clone(),
        })
        .await
    }

    async fn release(&self, client: &ClientId, container: &ContainerId) -> RegistryResult<()> {
        self.call::<Value>(RpcRequest::ReleaseContainer {
            client: client.clone(),
            container: container.clone(),
        })
        .await?;
        Ok(())
    }

    async fn request(
        &self,
        container: &ContainerId,
        operation: &str,
        data: Value,
    ) -> RegistryResult<Value> {
        self.call(RpcRequest::SendContainer {
            container: container.clone(),
            operation: operation.to_owned(),
            data,
        })
        .await
    }

    async fn ping(&self, client: &ClientId, agents: &[AgentId]) -> RegistryResult<()> {
        self.call::<Value>(RpcRequest::Ping {
            client: client.clone(),
            agents: agents.to_vec(),
        })
        .await?;
        Ok(())
    }

    fn subscribe(&self) -> DirectoryEvents {
        DirectoryEvents::new(self.events.subscribe())
    }
}

struct ProxyHandler {
    proxy: Weak<RegistryProxy>,
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, RemoteError> {
    serde_json::to_value(value).map_err(|err| RemoteError::malformed(&err))
}

#[async_trait]
impl RpcHandler for ProxyHandler {
    async fn handle(&self, request: RpcRequest) -> Result<Value, RemoteError> {
        let code = request.code();
        let proxy = self
            .proxy
            .upgrade()
            .ok_or_else(|| RemoteError::new(ErrorKind::Shutdown, "registry proxy dropped"))?;
        match request {
            RpcRequest::ContainerUpdate { event } => {
                if proxy.events.send(event).is_err() {
                    debug!(client_id = %proxy.client, "no local directory subscribers");
                }
                Ok(Value::Null)
            }
            RpcRequest::AgentGet {
                agent,
                kind,
                options,
            } => {
                let handle = proxy.local_agent(&agent).await?;
                let resolved = handle
                    .get(&kind, &options)
                    .await
                    .map_err(|err| RemoteError::from(&err))?;
                encode(&resolved)
            }
            RpcRequest::AgentRequest {
                agent,
                container,
                operation,
                data,
            } => {
                let handle = proxy.local_agent(&agent).await?;
                handle
                    .request(&container, &operation, data)
                    .await
                    .map_err(|err| RemoteError::from(&err))
            }
            RpcRequest::Terminate { agent, container } => {
                let handle = proxy.local_agent(&agent).await?;
                handle
                    .terminate(&container)
                    .await
                    .map_err(|err| RemoteError::from(&err))?;
                Ok(Value::Null)
            }
            _ => Err(RemoteError::unsupported(code)),
        }
    }

    async fn closed(&self) {
        if let Some(proxy) = self.proxy.upgrade() {
            warn!(client_id = %proxy.client, "registry channel closed");
        }
    }
}
