//! Container and factory ports.

use crate::directory::domain::{AgentEndpoint, ClientId, ContainerId, EndpointRef, GetOptions};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Error type push handlers may return.
pub type PushError = Box<dyn std::error::Error + Send + Sync>;

/// Delivers data pushed by a container to one connected client.
pub type PushHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), PushError>> + Send + Sync>;

/// Wraps an async closure as a [`PushHandler`].
pub fn push_handler<F, Fut>(handler: F) -> PushHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PushError>> + Send + 'static,
{
    Arc::new(move |data| -> BoxFuture<'static, Result<(), PushError>> { Box::pin(handler(data)) })
}

/// One addressable unit of work hosted by an agent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Container: Send + Sync {
    /// Handles a data-plane call.
    async fn request(
        &self,
        operation: &str,
        data: Value,
        client: Option<ClientId>,
    ) -> ContainerResult<Value>;

    /// Releases the container's resources.
    async fn terminate(&self) -> ContainerResult<()>;

    /// Attaches a client that receives pushed data.
    fn connect(&self, client: ClientId, push: PushHandler);

    /// Detaches a client.
    fn disconnect(&self, client: &ClientId);
}

/// Errors reported by containers and factories.
#[derive(Debug, Clone, Error)]
pub enum ContainerError {
    /// The container is shutting down or already gone.
    #[error("container is terminated")]
    Terminated,

    /// The container does not implement the operation.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Container-specific failure.
    #[error("container failure: {0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync>),
}

impl ContainerError {
    /// Wraps a container-specific failure.
    pub fn failed(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Failed(Arc::new(err))
    }
}

/// A freshly built container and the endpoint it listens on.
#[derive(Clone)]
pub struct CreatedContainer {
    /// Container identity.
    pub uuid: ContainerId,
    /// The instance.
    pub container: Arc<dyn Container>,
    /// Endpoint clients should use.
    pub endpoint: EndpointRef,
}

impl fmt::Debug for CreatedContainer {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CreatedContainer")
            .field("uuid", &self.uuid)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Builds containers of one kind on demand.
#[async_trait]
pub trait ContainerFactory: Send + Sync {
    /// Creates a container honouring `options.uuid` when set.
    ///
    /// `agent_endpoint` is the hosting agent's shared listener, for
    /// factories that mint routed endpoints.
    async fn create(
        &self,
        options: &GetOptions,
        agent_endpoint: Option<&AgentEndpoint>,
    ) -> ContainerResult<CreatedContainer>;
}

struct FnFactory<F> {
    build: F,
}

#[async_trait]
impl<F, Fut> ContainerFactory for FnFactory<F>
where
    F: Fn(GetOptions, Option<AgentEndpoint>) -> Fut + Send + Sync,
    Fut: Future<Output = ContainerResult<CreatedContainer>> + Send,
{
    async fn create(
        &self,
        options: &GetOptions,
        agent_endpoint: Option<&AgentEndpoint>,
    ) -> ContainerResult<CreatedContainer> {
        (self.build)(options.clone(), agent_endpoint.cloned()).await
    }
}

/// Adapts an async closure into a [`ContainerFactory`].
pub fn factory_fn<F, Fut>(build: F) -> Arc<dyn ContainerFactory>
where
    F: Fn(GetOptions, Option<AgentEndpoint>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ContainerResult<CreatedContainer>> + Send + 'static,
{
    Arc::new(FnFactory { build })
}
