//! Agent side of routed connections.

use crate::agent::ports::{PushError, push_handler};
use crate::agent::services::Agent;
use crate::directory::domain::{ClientId, ContainerId};
use crate::rpc::domain::{RemoteError, RpcRequest};
use crate::rpc::ports::{RpcChannel, RpcHandler};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Shared listener multiplexing client connections to an agent's containers.
#[derive(Debug, Clone)]
pub struct AgentListener {
    agent: Arc<Agent>,
}

impl AgentListener {
    /// Wraps an agent.
    #[must_use]
    pub const fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    /// Serves `connect`, `disconnect` and `connectionRequest` on `channel`.
    ///
    /// Pushed data flows back on the same channel. Closing the channel
    /// disconnects every client attached through it.
    pub fn accept(&self, channel: Arc<dyn RpcChannel>) {
        channel.serve(Arc::new(ListenerSession {
            agent: Arc::clone(&self.agent),
            channel: Arc::clone(&channel),
            attached: Mutex::new(BTreeSet::new()),
        }));
    }
}

struct ListenerSession {
    agent: Arc<Agent>,
    channel: Arc<dyn RpcChannel>,
    attached: Mutex<BTreeSet<(ContainerId, ClientId)>>,
}

impl ListenerSession {
    async fn connect(&self, container: ContainerId, client: ClientId) -> Result<(), RemoteError> {
        let channel = Arc::clone(&self.channel);
        let source = container.clone();
        let push = push_handler(move |data| {
            let link = Arc::clone(&channel);
            let origin = source.clone();
            async move {
                link.call(RpcRequest::Push {
                    container: origin,
                    data,
                })
                .await
                .map(|_| ())
                .map_err(|err| Box::new(err) as PushError)
            }
        });
        self.agent
            .connect(&container, client.clone(), push)
            .await
            .map_err(|err| RemoteError::from(&err))?;
        debug!(container_id = %container, client_id = %client, "routed client attached");
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((container, client));
        Ok(())
    }

    async fn disconnect(&self, container: ContainerId, client: ClientId) {
        self.agent.disconnect(&container, &client).await;
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(container, client));
    }
}

#[async_trait]
impl RpcHandler for ListenerSession {
    async fn handle(&self, request: RpcRequest) -> Result<Value, RemoteError> {
        let code = request.code();
        match request {
            RpcRequest::Connect { container, client } => {
                self.connect(container, client).await?;
                Ok(Value::Null)
            }
            RpcRequest::Disconnect { container, client } => {
                self.disconnect(container, client).await;
                Ok(Value::Null)
            }
            RpcRequest::ConnectionRequest {
                container,
                client,
                operation,
                data,
            } => self
                .agent
                .request(&container, &operation, data, Some(client))
                .await
                .map_err(|err| RemoteError::from(&err)),
            _ => Err(RemoteError::unsupported(code)),
        }
    }

    async fn closed(&self) {
        let attached =
            std::mem::take(&mut *self.attached.lock().unwrap_or_else(PoisonError::into_inner));
        for (container, client) in attached {
            self.agent.disconnect(&container, &client).await;
        }
        debug!(agent_id = %self.agent.id(), "routed channel closed");
    }
}
