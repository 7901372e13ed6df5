//! Routed agent connection over an RPC channel.

use crate::agent::ports::PushHandler;
use crate::client::ports::{AgentLink, ConnectResult};
use crate::directory::domain::{ClientId, ContainerId};
use crate::rpc::domain::{RemoteError, RpcRequest};
use crate::rpc::ports::{RpcChannel, RpcHandler};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

type PushTable = Arc<Mutex<HashMap<ContainerId, PushHandler>>>;

/// [`AgentLink`] speaking the routed-connection protocol on a channel.
///
/// Pushes arriving on the channel are dispatched by container id to the
/// handler registered with [`AgentLink::connect`].
pub struct ChannelAgentLink {
    client: ClientId,
    channel: Arc<dyn RpcChannel>,
    pushes: PushTable,
}

impl ChannelAgentLink {
    /// Starts serving pushes on `channel` on behalf of `client`.
    #[must_use]
    pub fn open(channel: Arc<dyn RpcChannel>, client: ClientId) -> Self {
        let pushes = PushTable::default();
        channel.serve(Arc::new(PushDispatcher {
            pushes: Arc::clone(&pushes),
        }));
        Self {
            client,
            channel,
            pushes,
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<ContainerId, PushHandler>> {
        self.pushes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ChannelAgentLink {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ChannelAgentLink")
            .field("client", &self.client)
            .field("containers", &self.table().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AgentLink for ChannelAgentLink {
    async fn connect(&self, container: &ContainerId, push: PushHandler) -> ConnectResult<()> {
        self.table().insert(container.clone(), push);
        let outcome = self
            .channel
            .call(RpcRequest::Connect {
                container: container.clone(),
                client: self.client.clone(),
            })
            .await;
        if outcome.is_err() {
            self.table().remove(container);
        }
        outcome?;
        Ok(())
    }

    async fn disconnect(&self, container: &ContainerId) -> ConnectResult<()> {
        self.table().remove(container);
        self.channel
            .call(RpcRequest::Disconnect {
                container: container.clone(),
                client: self.client.clone(),
            })
            .await?;
        Ok(())
    }

    async fn request(
        &self,
        container: &ContainerId,
        operation: &str,
        data: Value,
    ) -> ConnectResult<Value> {
        Ok(self
            .channel
            .call(RpcRequest::ConnectionRequest {
                container: container.clone(),
                client: self.client.clone(),
                operation: operation.to_owned(),
                data,
            })
            .await?)
    }

    async fn close(&self) {
        self.table().clear();
        self.channel.close().await;
    }
}

struct PushDispatcher {
    pushes: PushTable,
}

#[async_trait]
impl RpcHandler for PushDispatcher {
    async fn handle(&self, request: RpcRequest) -> Result<Value, RemoteError> {
        match request {
            RpcRequest::Push { container, data } => {
                let target = self
                    .pushes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&container)
                    .map(PushHandler::clone);
                match target {
                    Some(push) => {
                        if let Err(err) = push(data).await {
                            warn!(container_id = %container, error = %err, "push handler failed");
                        }
                    }
                    None => {
                        debug!(container_id = %container, "push for detached container dropped");
                    }
                }
                Ok(Value::Null)
            }
            other => Err(RemoteError::unsupported(other.code())),
        }
    }

    async fn closed(&self) {
        self.pushes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
