//! Data-plane connections that survive rebinding.

use super::runtime::RuntimeInner;
use crate::agent::ports::{PushError, PushHandler, push_handler};
use crate::client::domain::{ClientError, ClientResult};
use crate::client::ports::{AgentLink, ConnectResult, DirectLink};
use crate::directory::domain::{AgentEndpoint, ContainerId, EndpointRef};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, warn};

/// Agent link shared by the routed bindings to one listener.
///
/// `users` counts installed bindings; the runtime closes the link when the
/// last one is released.
pub(super) struct SharedLink {
    link: Arc<dyn AgentLink>,
    users: AtomicUsize,
}

impl SharedLink {
    pub(super) fn new(link: Arc<dyn AgentLink>) -> Arc<Self> {
        Arc::new(Self {
            link,
            users: AtomicUsize::new(0),
        })
    }

    pub(super) const fn link(&self) -> &Arc<dyn AgentLink> {
        &self.link
    }

    pub(super) fn acquire(&self) {
        self.users.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops one user; true when none remain.
    pub(super) fn leave(&self) -> bool {
        let previous = self
            .users
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |users| {
                Some(users.saturating_sub(1))
            })
            .unwrap_or_else(|users| users);
        previous <= 1
    }

    pub(super) async fn close(&self) {
        self.link.close().await;
    }
}

/// Underlying transport of a connection.
#[derive(Clone)]
pub(super) enum Binding {
    Direct(Arc<dyn DirectLink>),
    Routed {
        link: Arc<SharedLink>,
        agent: AgentEndpoint,
        container: ContainerId,
    },
}

impl Binding {
    async fn request(&self, operation: &str, data: Value) -> ConnectResult<Value> {
        match self {
            Self::Direct(link) => link.request(operation, data).await,
            Self::Routed {
                link, container, ..
            } => link.link.request(container, operation, data).await,
        }
    }

    /// Whether both values describe the same installed transport.
    pub(super) fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Direct(left), Self::Direct(right)) => Arc::ptr_eq(left, right),
            (
                Self::Routed {
                    link: left,
                    container: left_container,
                    ..
                },
                Self::Routed {
                    link: right,
                    container: right_container,
                    ..
                },
            ) => Arc::ptr_eq(left, right) && left_container == right_container,
            _ => false,
        }
    }

    /// Detaches from the transport. Direct links close; a routed binding
    /// hands back its shared link so the caller can settle the user count.
    pub(super) async fn detach(self) -> Option<(AgentEndpoint, Arc<SharedLink>)> {
        match self {
            Self::Direct(link) => {
                link.close().await;
                None
            }
            Self::Routed {
                link,
                agent,
                container,
            } => {
                if let Err(err) = link.link.disconnect(&container).await {
                    debug!(container_id = %container, error = %err, "routed disconnect failed");
                }
                Some((agent, link))
            }
        }
    }
}

/// State shared by every handle to one connection.
pub(super) struct ConnectionState {
    container: Mutex<ContainerId>,
    endpoint: Mutex<EndpointRef>,
    binding: tokio::sync::Mutex<Option<Binding>>,
    listeners: Mutex<Vec<PushHandler>>,
}

impl ConnectionState {
    pub(super) fn new(container: ContainerId, endpoint: EndpointRef) -> Arc<Self> {
        Arc::new(Self {
            container: Mutex::new(container),
            endpoint: Mutex::new(endpoint),
            binding: tokio::sync::Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub(super) fn container(&self) -> ContainerId {
        self.container
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(super) fn endpoint(&self) -> EndpointRef {
        self.endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Push handler that forwards to every listener registered with
    /// [`ContainerConnection::on_push`], whichever binding delivers.
    pub(super) fn fan_in(self: &Arc<Self>) -> PushHandler {
        let state = Arc::downgrade(self);
        push_handler(move |data: Value| {
            let listeners: Vec<PushHandler> = state
                .upgrade()
                .map(|live| {
                    live.listeners
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone()
                })
                .unwrap_or_default();
            async move {
                for listener in listeners {
                    if let Err(err) = listener(data.clone()).await {
                        warn!(error = %err, "push listener failed");
                    }
                }
                Ok::<(), PushError>(())
            }
        })
    }

    /// Installs `binding` for `container` at `endpoint`, returning the
    /// binding it replaces.
    pub(super) async fn install(
        &self,
        binding: Binding,
        container: ContainerId,
        endpoint: EndpointRef,
    ) -> Option<Binding> {
        let mut slot = self.binding.lock().await;
        *self.container.lock().unwrap_or_else(PoisonError::into_inner) = container;
        *self.endpoint.lock().unwrap_or_else(PoisonError::into_inner) = endpoint;
        slot.replace(binding)
    }

    /// Takes the binding out and forgets every push listener.
    pub(super) async fn detach(&self) -> Option<Binding> {
        let binding = self.binding.lock().await.take();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        binding
    }

    /// Whether `binding` is still the installed one.
    pub(super) async fn is_bound_to(&self, binding: &Binding) -> bool {
        self.binding
            .lock()
            .await
            .as_ref()
            .is_some_and(|current| current.same_as(binding))
    }

    async fn binding(&self) -> Option<Binding> {
        self.binding.lock().await.clone()
    }

    /// Detaches without a runtime to account shared links with.
    async fn shutdown(&self) {
        if let Some(binding) = self.detach().await
            && let Some((_, shared)) = binding.detach().await
            && shared.leave()
        {
            shared.close().await;
        }
    }
}

/// A live data-plane connection to a container.
///
/// The runtime rebinds the connection in place when the container moves,
/// so handles stay valid across endpoint changes and migrations.
#[derive(Clone)]
pub struct ContainerConnection {
    state: Arc<ConnectionState>,
    runtime: Weak<RuntimeInner>,
}

impl ContainerConnection {
    pub(super) const fn new(state: Arc<ConnectionState>, runtime: Weak<RuntimeInner>) -> Self {
        Self { state, runtime }
    }

    /// Container currently behind the connection.
    #[must_use]
    pub fn container_id(&self) -> ContainerId {
        self.state.container()
    }

    /// Endpoint the connection is currently bound to.
    #[must_use]
    pub fn endpoint(&self) -> EndpointRef {
        self.state.endpoint()
    }

    /// Sends a data-plane call over the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Released`] once closed and
    /// [`ClientError::Connect`] for transport or container failures.
    ///
    /// A call failing on a stale link is retried once after the runtime
    /// rebinds the connection on a fresh one.
    pub async fn request(&self, operation: &str, data: Value) -> ClientResult<Value> {
        let Some(active) = self.state.binding().await else {
            return Err(ClientError::Released(self.container_id()));
        };
        let err = match active.request(operation, data.clone()).await {
            Ok(reply) => return Ok(reply),
            Err(err) => err,
        };
        let runtime = match self.runtime.upgrade() {
            Some(runtime) if err.is_link_failure() => runtime,
            _ => return Err(err.into()),
        };
        debug!(container_id = %self.container_id(), error = %err, "request failed, rebinding");
        runtime.recover(&self.state, &active).await?;
        match self.state.binding().await {
            Some(fresh) => Ok(fresh.request(operation, data).await?),
            None => Err(ClientError::Released(self.container_id())),
        }
    }

    /// Registers a handler for data the container pushes.
    pub fn on_push(&self, handler: PushHandler) {
        self.state
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Closes the connection. The container reference stays valid.
    pub async fn close(&self) {
        match self.runtime.upgrade() {
            Some(runtime) => runtime.drop_connection(&self.state).await,
            None => self.state.shutdown().await,
        }
    }
}

impl std::fmt::Debug for ContainerConnection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ContainerConnection")
            .field("container", &self.container_id())
            .field("endpoint", &self.endpoint())
            .finish_non_exhaustive()
    }
}
