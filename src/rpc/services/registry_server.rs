//! Registry side of the protocol: one session per accepted channel.

use crate::directory::domain::{
    AgentId, AgentRecord, ClientId, ContainerId, ContainerKind, GetOptions, ResolvedContainer,
};
use crate::directory::ports::{AgentHandle, AgentResult, Registry, RegistryResult};
use crate::directory::services::{DirectoryService, EventListener, ListenerError};
use crate::rpc::domain::{RemoteError, RpcRequest};
use crate::rpc::ports::{RpcChannel, RpcHandler, decode_reply};
use async_trait::async_trait;
use futures::FutureExt;
use mockable::Clock;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Exposes an in-process directory to remote client runtimes.
pub struct RegistryServer<C>
where
    C: Clock + Send + Sync + 'static,
{
    directory: Arc<DirectoryService<C>>,
}

impl<C> RegistryServer<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Wraps a directory.
    #[must_use]
    pub const fn new(directory: Arc<DirectoryService<C>>) -> Self {
        Self { directory }
    }

    /// Serves the registry protocol on `channel`.
    ///
    /// When the channel closes the session's client is removed and every
    /// agent it registered is unregistered, unless the agent has registered
    /// again through another session since.
    pub fn accept(&self, channel: Arc<dyn RpcChannel>) {
        let session = RegistrySession {
            directory: Arc::clone(&self.directory),
            channel: Arc::clone(&channel),
            client: Mutex::new(None),
            agents: Mutex::new(BTreeMap::new()),
        };
        channel.serve(Arc::new(session));
    }
}

struct RegistrySession<C>
where
    C: Clock + Send + Sync + 'static,
{
    directory: Arc<DirectoryService<C>>,
    channel: Arc<dyn RpcChannel>,
    client: Mutex<Option<ClientId>>,
    agents: Mutex<BTreeMap<AgentId, Arc<dyn AgentHandle>>>,
}

fn reply<T: Serialize>(outcome: RegistryResult<T>) -> Result<Value, RemoteError> {
    match outcome {
        Ok(value) => serde_json::to_value(value).map_err(|err| RemoteError::malformed(&err)),
        Err(err) => Err(RemoteError::from(&err)),
    }
}

impl<C> RegistrySession<C>
where
    C: Clock + Send + Sync + 'static,
{
    fn event_listener(&self, client: &ClientId) -> EventListener {
        let channel = Arc::clone(&self.channel);
        let target = client.clone();
        Arc::new(move |event| {
            let link = Arc::clone(&channel);
            let client_id = target.clone();
            async move {
                link.call(RpcRequest::ContainerUpdate { event })
                    .await
                    .map(|_| ())
                    .map_err(|err| {
                        debug!(client_id = %client_id, error = %err, "event push failed");
                        Box::new(err) as ListenerError
                    })
            }
            .boxed()
        })
    }

    async fn hello(&self, client: ClientId) {
        let previous = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(client.clone());
        if let Some(stale) = previous.filter(|stale| *stale != client) {
            self.directory.remove_client(&stale).await;
        }
        info!(client_id = %client, "registry session opened");
        let listener = self.event_listener(&client);
        self.directory.add_client(client, Some(listener)).await;
    }

    async fn register(&self, record: AgentRecord) -> RegistryResult<Vec<ContainerId>> {
        let agent_id = record.agent_id.clone();
        let handle: Arc<dyn AgentHandle> = Arc::new(RemoteAgent {
            agent: agent_id.clone(),
            channel: Arc::clone(&self.channel),
        });
        let rejected = self.directory.register(record, Arc::clone(&handle)).await?;
        self.agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id, handle);
        Ok(rejected)
    }

    async fn unregister(&self, agent: &AgentId) -> RegistryResult<()> {
        self.agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent);
        self.directory.unregister(agent).await
    }
}

#[async_trait]
impl<C> RpcHandler for RegistrySession<C>
where
    C: Clock + Send + Sync + 'static,
{
    async fn handle(&self, request: RpcRequest) -> Result<Value, RemoteError> {
        let code = request.code();
        debug!(operation = code, "registry request");
        match request {
            RpcRequest::Hello { client } => {
                self.hello(client).await;
                Ok(Value::Null)
            }
            RpcRequest::Register { record } => reply(self.register(record).await),
            RpcRequest::Unregister { agent } => reply(self.unregister(&agent).await),
            RpcRequest::GetAgents => reply(self.directory.agents().await),
            RpcRequest::GetKinds => reply(self.directory.kinds().await),
            RpcRequest::ListContainers { kind } => reply(self.directory.list(kind.as_ref()).await),
            RpcRequest::GetContainer {
                client,
                kind,
                options,
            } => reply(self.directory.get(&client, &kind, &options).await),
            RpcRequest::ReleaseContainer { client, container } => {
                reply(self.directory.release(&client, &container).await)
            }
            RpcRequest::SendContainer {
                container,
                operation,
                data,
            } => reply(self.directory.request(&container, &operation, data).await),
            RpcRequest::Ping { client, agents } => {
                reply(self.directory.ping(&client, &agents).await)
            }
            _ => Err(RemoteError::unsupported(code)),
        }
    }

    async fn closed(&self) {
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let agents =
            std::mem::take(&mut *self.agents.lock().unwrap_or_else(PoisonError::into_inner));
        let mut unregistered: usize = 0;
        for (agent, handle) in &agents {
            if self.directory.unregister_if_owned(agent, handle).await {
                unregistered = unregistered.saturating_add(1);
            } else {
                debug!(agent_id = %agent, "agent owned by a newer session, left registered");
            }
        }
        if let Some(departed) = client {
            self.directory.remove_client(&departed).await;
            info!(client_id = %departed, agents = unregistered, "registry session closed");
        }
    }
}

/// Directory-side handle for an agent hosted behind a channel.
struct RemoteAgent {
    agent: AgentId,
    channel: Arc<dyn RpcChannel>,
}

#[async_trait]
impl AgentHandle for RemoteAgent {
    async fn get(
        &self,
        kind: &ContainerKind,
        options: &GetOptions,
    ) -> AgentResult<ResolvedContainer> {
        let answer = self
            .channel
            .call(RpcRequest::AgentGet {
                agent: self.agent.clone(),
                kind: kind.clone(),
                options: options.clone(),
            })
            .await?;
        Ok(decode_reply(answer)?)
    }

    async fn request(
        &self,
        container: &ContainerId,
        operation: &str,
        data: Value,
    ) -> AgentResult<Value> {
        Ok(self
            .channel
            .call(RpcRequest::AgentRequest {
                agent: self.agent.clone(),
                container: container.clone(),
                operation: operation.to_owned(),
                data,
            })
            .await?)
    }

    async fn terminate(&self, container: &ContainerId) -> AgentResult<()> {
        self.channel
            .call(RpcRequest::Terminate {
                agent: self.agent.clone(),
                container: container.clone(),
            })
            .await?;
        Ok(())
    }
}
