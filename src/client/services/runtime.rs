//! The client runtime.

use super::connection::{Binding, ConnectionState, ContainerConnection, SharedLink};
use super::reference::{ContainerReference, ReferenceSlot};
use crate::agent::services::Agent;
use crate::client::domain::{Backoff, ClientError, ClientResult};
use crate::client::ports::{ConnectResult, Connector};
use crate::config::NetworkConfig;
use crate::directory::domain::{
    AgentEndpoint, AgentId, ClientId, ConnectionStrategy, ContainerId, ContainerKind, EndpointRef,
    GetOptions, NetworkEvent, NetworkEventKind, ResolvedContainer,
};
use crate::directory::ports::{DirectoryEvents, EventStreamError, Registry};
use crate::directory::services::EventListener;
use crate::rpc::ports::RpcChannel;
use crate::tick::{TickScheduler, TickSubscription, tick_callback};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Resolves, caches and migrates container references for one caller.
///
/// The runtime keeps every reference and connection in tables keyed by the
/// backing container id. Directory change batches arrive on a background
/// task and rebind connections whose container moved; removed containers
/// are re-resolved in the background with the original request.
///
/// Call [`ClientRuntime::close`] to release everything; dropping the
/// runtime only stops its background work.
pub struct ClientRuntime {
    inner: Arc<RuntimeInner>,
}

pub(super) struct RuntimeInner {
    id: ClientId,
    pub(super) registry: Arc<dyn Registry>,
    connector: Arc<dyn Connector>,
    ticks: Arc<dyn TickScheduler>,
    config: NetworkConfig,
    transport: Mutex<Option<Arc<dyn RpcChannel>>>,
    agents: tokio::sync::Mutex<BTreeMap<AgentId, Arc<Agent>>>,
    references: tokio::sync::Mutex<HashMap<ContainerId, Arc<ReferenceSlot>>>,
    connections: tokio::sync::Mutex<HashMap<ContainerId, Arc<ConnectionState>>>,
    agent_links: tokio::sync::Mutex<HashMap<AgentEndpoint, Arc<SharedLink>>>,
    listeners: Mutex<Vec<EventListener>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    keepalive: Mutex<Option<TickSubscription>>,
    closed: AtomicBool,
}

impl ClientRuntime {
    /// Creates a runtime and starts its directory watcher and keep-alive
    /// ping. Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(
        id: ClientId,
        registry: Arc<dyn Registry>,
        connector: Arc<dyn Connector>,
        ticks: Arc<dyn TickScheduler>,
        config: NetworkConfig,
    ) -> Self {
        let events = registry.subscribe();
        let ping_interval = config.ping_interval_ticks;
        let inner = Arc::new(RuntimeInner {
            id,
            registry,
            connector,
            ticks: Arc::clone(&ticks),
            config,
            transport: Mutex::new(None),
            agents: tokio::sync::Mutex::new(BTreeMap::new()),
            references: tokio::sync::Mutex::new(HashMap::new()),
            connections: tokio::sync::Mutex::new(HashMap::new()),
            agent_links: tokio::sync::Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
            keepalive: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let watcher = tokio::spawn(watch_directory(Arc::downgrade(&inner), events));
        inner.track(watcher);

        let weak = Arc::downgrade(&inner);
        let keepalive = ticks.register(
            ping_interval,
            tick_callback(move || {
                let runtime = Weak::clone(&weak);
                async move {
                    if let Some(live) = runtime.upgrade() {
                        live.ping().await;
                    }
                }
            }),
        );
        *inner
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(keepalive);
        Self { inner }
    }

    /// Closes `transport` as the last step of [`Self::close`].
    #[must_use]
    pub fn with_transport(self, transport: Arc<dyn RpcChannel>) -> Self {
        *self
            .inner
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(transport);
        self
    }

    /// Caller identity.
    #[must_use]
    pub fn id(&self) -> &ClientId {
        &self.inner.id
    }

    /// The directory this runtime talks to.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.inner.registry
    }

    /// Returns a reference to a container of `kind`.
    ///
    /// When `options.uuid` is already held the existing reference is
    /// returned. Otherwise the directory is asked, retrying transient
    /// failures with a tick backoff that a newly added agent advertising
    /// `kind` cuts short.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] once the runtime is closed and
    /// non-retryable directory failures unchanged.
    pub async fn get(
        &self,
        kind: &ContainerKind,
        options: &GetOptions,
    ) -> ClientResult<ContainerReference> {
        self.inner.ensure_open()?;
        if let Some(uuid) = &options.uuid {
            let held = self.inner.references.lock().await.get(uuid).map(handle_slot);
            if let Some(slot) = held {
                return Ok(self.inner.reference(slot));
            }
        }

        let resolved = self.inner.resolve(kind, options).await?;
        let slot = {
            let mut references = self.inner.references.lock().await;
            match references.get(&resolved.uuid) {
                Some(existing) => handle_slot(existing),
                None => {
                    let slot = ReferenceSlot::new(
                        resolved.uuid.clone(),
                        resolved.endpoint,
                        kind.clone(),
                        options.clone(),
                    );
                    references.insert(resolved.uuid, Arc::clone(&slot));
                    slot
                }
            }
        };
        debug!(
            client_id = %self.inner.id,
            container_id = %slot.current().id(),
            kind = %kind,
            "container reference acquired"
        );
        Ok(self.inner.reference(slot))
    }

    /// Opens (or reuses) the data-plane connection for `reference`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoConnect`] for containers that only accept
    /// directory-proxied requests, [`ClientError::Released`] for closed
    /// references and [`ClientError::Connect`] when the connector fails.
    pub async fn connect(
        &self,
        reference: &ContainerReference,
    ) -> ClientResult<ContainerConnection> {
        self.inner.connect(reference).await
    }

    /// Hosts `agent` in this runtime and registers it with the directory.
    ///
    /// The agent is re-registered on [`Self::on_reconnect`], kept alive by
    /// the periodic ping and unregistered on [`Self::close`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DuplicateAgentEndpoint`] when another hosted
    /// agent already serves the same endpoint, and directory failures from
    /// the registration.
    pub async fn serve_agent(&self, agent: Arc<Agent>) -> ClientResult<()> {
        self.inner.ensure_open()?;
        let endpoint = agent.endpoint().await;
        {
            let mut agents = self.inner.agents.lock().await;
            if let Some(wanted) = &endpoint {
                for other in agents.values().filter(|other| other.id() != agent.id()) {
                    if other.endpoint().await.as_ref() == Some(wanted) {
                        return Err(ClientError::DuplicateAgentEndpoint(wanted.clone()));
                    }
                }
            }
            agents.insert(agent.id().clone(), Arc::clone(&agent));
        }
        agent.register(self.inner.registry.as_ref()).await?;
        info!(client_id = %self.inner.id, agent_id = %agent.id(), "agent served");
        Ok(())
    }

    /// Stops hosting an agent and unregisters it.
    ///
    /// # Errors
    ///
    /// Returns directory failures from the unregister call.
    pub async fn stop_agent(&self, agent: &AgentId) -> ClientResult<()> {
        if self.inner.agents.lock().await.remove(agent).is_some() {
            self.inner.registry.unregister(agent).await?;
        }
        Ok(())
    }

    /// Registers a callback for every directory change batch.
    ///
    /// A failing callback is logged and does not affect other callbacks.
    pub fn on_directory_event(&self, listener: EventListener) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Recovers after the transport to the directory re-establishes.
    ///
    /// Every hosted agent registers again, then every held reference is
    /// resolved again: a changed container id migrates the reference and
    /// its connection, a changed endpoint rebinds the connection in place.
    ///
    /// # Errors
    ///
    /// Returns the first registration or resolution failure.
    pub async fn on_reconnect(&self) -> ClientResult<()> {
        self.inner.ensure_open()?;
        let agents: Vec<Arc<Agent>> =
            self.inner.agents.lock().await.values().map(Arc::clone).collect();
        for agent in agents {
            agent.register(self.inner.registry.as_ref()).await?;
        }
        let slots: Vec<Arc<ReferenceSlot>> = self
            .inner
            .references
            .lock()
            .await
            .values()
            .map(Arc::clone)
            .collect();
        for slot in slots {
            let resolved = self.inner.resolve(slot.kind(), &slot.pinned_request()).await?;
            self.inner.apply_resolution(&slot, resolved).await?;
        }
        info!(client_id = %self.inner.id, "client runtime re-synchronised");
        Ok(())
    }

    /// Number of held references.
    pub async fn reference_count(&self) -> usize {
        self.inner.references.lock().await.len()
    }

    /// Number of cached data-plane connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    /// Releases everything the runtime holds.
    ///
    /// References are released from the directory, connections and shared
    /// agent links closed, hosted agents unregistered and finally the
    /// transport, if any, closed. Failures are logged and do not stop the
    /// remaining steps.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.stop_background();

        let slots: Vec<Arc<ReferenceSlot>> = self
            .inner
            .references
            .lock()
            .await
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in &slots {
            let container = slot.id();
            if let Err(err) = self.inner.registry.release(&self.inner.id, &container).await {
                warn!(
                    container_id = %container,
                    error = %err,
                    "failed to release container on close"
                );
            }
        }

        let connections: Vec<Arc<ConnectionState>> = self
            .inner
            .connections
            .lock()
            .await
            .drain()
            .map(|(_, state)| state)
            .collect();
        for state in connections {
            self.inner.close_state(&state).await;
        }
        let links: Vec<Arc<SharedLink>> = self
            .inner
            .agent_links
            .lock()
            .await
            .drain()
            .map(|(_, link)| link)
            .collect();
        for link in links {
            link.close().await;
        }

        let agents: Vec<AgentId> = std::mem::take(&mut *self.inner.agents.lock().await)
            .into_keys()
            .collect();
        for agent in &agents {
            if let Err(err) = self.inner.registry.unregister(agent).await {
                warn!(agent_id = %agent, error = %err, "failed to unregister agent on close");
            }
        }

        let transport = self
            .inner
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(channel) = transport {
            channel.close().await;
        }
        info!(
            client_id = %self.inner.id,
            references = slots.len(),
            agents = agents.len(),
            "client runtime closed"
        );
    }
}

impl Drop for ClientRuntime {
    fn drop(&mut self) {
        self.inner.stop_background();
    }
}

impl std::fmt::Debug for ClientRuntime {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientRuntime")
            .field("id", &self.inner.id)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl RuntimeInner {
    pub(super) fn ensure_open(&self) -> ClientResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    fn reference(self: &Arc<Self>, slot: Arc<ReferenceSlot>) -> ContainerReference {
        ContainerReference::new(slot, Arc::downgrade(self))
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|running| !running.is_finished());
        tasks.push(task);
    }

    fn stop_background(&self) {
        let tasks =
            std::mem::take(&mut *self.background.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        let keepalive = self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = keepalive {
            subscription.unsubscribe();
        }
    }

    /// Fails unless the handles of `origin` are open and the slot standing
    /// for it is still held under its current id.
    pub(super) async fn ensure_held(&self, origin: &Arc<ReferenceSlot>) -> ClientResult<()> {
        self.ensure_open()?;
        let references = self.references.lock().await;
        let slot = origin.current();
        let container = slot.id();
        let held = !origin.is_closed()
            && references
                .get(&container)
                .is_some_and(|current| Arc::ptr_eq(current, &slot));
        if held {
            Ok(())
        } else {
            Err(ClientError::Released(container))
        }
    }

    async fn ping(&self) {
        let agents: Vec<AgentId> = self.agents.lock().await.keys().cloned().collect();
        if let Err(err) = self.registry.ping(&self.id, &agents).await {
            warn!(client_id = %self.id, error = %err, "keep-alive ping failed");
        }
    }

    /// Asks the directory until it answers, backing off on transient
    /// failures.
    async fn resolve(
        &self,
        kind: &ContainerKind,
        options: &GetOptions,
    ) -> ClientResult<ResolvedContainer> {
        let mut events = self.registry.subscribe();
        let mut backoff = Backoff::new(self.config.retry_cap_ticks());
        let mut attempts: u64 = 0;
        loop {
            self.ensure_open()?;
            attempts = attempts.saturating_add(1);
            match self.registry.get(&self.id, kind, options).await {
                Ok(resolved) => {
                    if attempts > 1 {
                        info!(
                            kind = %kind,
                            container_id = %resolved.uuid,
                            attempts,
                            "container resolved after retries"
                        );
                    }
                    return Ok(resolved);
                }
                Err(err) if err.is_retryable() => {
                    let wait = backoff.next_wait();
                    debug!(kind = %kind, wait, error = %err, "resolution failed, backing off");
                    if wait_or_wake(self.ticks.wait_ticks(wait), &mut events, kind).await {
                        debug!(kind = %kind, "agent for kind appeared, retrying now");
                        backoff.reset();
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub(super) async fn connect(
        self: &Arc<Self>,
        reference: &ContainerReference,
    ) -> ClientResult<ContainerConnection> {
        self.ensure_held(reference.slot()).await?;
        let container = reference.id();
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(&container) {
            return Ok(ContainerConnection::new(
                Arc::clone(existing),
                Arc::downgrade(self),
            ));
        }
        let endpoint = reference.endpoint();
        let state = ConnectionState::new(container.clone(), endpoint.clone());
        let binding = self.bind(&state, &container, &endpoint).await?;
        state.install(binding, container.clone(), endpoint).await;
        connections.insert(container.clone(), Arc::clone(&state));
        debug!(client_id = %self.id, container_id = %container, "connection established");
        Ok(ContainerConnection::new(state, Arc::downgrade(self)))
    }

    async fn bind(
        &self,
        state: &Arc<ConnectionState>,
        container: &ContainerId,
        endpoint: &EndpointRef,
    ) -> ClientResult<Binding> {
        let decoded = endpoint.decode()?;
        match decoded.strategy() {
            ConnectionStrategy::NoConnect => Err(ClientError::NoConnect(container.clone())),
            ConnectionStrategy::Direct => {
                let link = self.connector.connect_direct(&self.id, &decoded).await?;
                link.attach(state.fan_in()).await?;
                Ok(Binding::Direct(link))
            }
            ConnectionStrategy::Routed => {
                let agent = decoded
                    .agent_endpoint()
                    .ok_or_else(|| ClientError::NoConnect(container.clone()))?;
                match self.attach_routed(state, container, &agent).await {
                    Err(err) if err.is_link_failure() => {
                        debug!(agent = %agent, error = %err, "agent link failed, reconnecting");
                        Ok(self.attach_routed(state, container, &agent).await?)
                    }
                    outcome => Ok(outcome?),
                }
            }
        }
    }

    /// Attaches `container` through the shared link to `agent`. A link
    /// that fails the attach is no longer handed out.
    async fn attach_routed(
        &self,
        state: &Arc<ConnectionState>,
        container: &ContainerId,
        agent: &AgentEndpoint,
    ) -> ConnectResult<Binding> {
        let shared = self.agent_link(agent).await?;
        if let Err(err) = shared.link().connect(container, state.fan_in()).await {
            if err.is_link_failure() {
                self.evict_link(agent, &shared).await;
            }
            self.release_link(agent, shared).await;
            return Err(err);
        }
        Ok(Binding::Routed {
            link: shared,
            agent: agent.clone(),
            container: container.clone(),
        })
    }

    /// Shared connection to an agent listener, opened on first use. The
    /// caller becomes one of its users.
    async fn agent_link(&self, endpoint: &AgentEndpoint) -> ConnectResult<Arc<SharedLink>> {
        let mut links = self.agent_links.lock().await;
        if let Some(existing) = links.get(endpoint) {
            existing.acquire();
            return Ok(Arc::clone(existing));
        }
        let shared = SharedLink::new(self.connector.connect_agent(&self.id, endpoint).await?);
        shared.acquire();
        links.insert(endpoint.clone(), Arc::clone(&shared));
        Ok(shared)
    }

    /// Stops handing out `shared`; its current users keep it until they
    /// release it.
    async fn evict_link(&self, endpoint: &AgentEndpoint, shared: &Arc<SharedLink>) {
        let mut links = self.agent_links.lock().await;
        if links
            .get(endpoint)
            .is_some_and(|current| Arc::ptr_eq(current, shared))
        {
            links.remove(endpoint);
            debug!(client_id = %self.id, agent = %endpoint, "stale agent link evicted");
        }
    }

    /// Gives up one use of `shared`, closing it once nobody uses it.
    async fn release_link(&self, endpoint: &AgentEndpoint, shared: Arc<SharedLink>) {
        let idle = {
            let mut links = self.agent_links.lock().await;
            let idle = shared.leave();
            if idle
                && links
                    .get(endpoint)
                    .is_some_and(|current| Arc::ptr_eq(current, &shared))
            {
                links.remove(endpoint);
            }
            idle
        };
        if idle {
            debug!(client_id = %self.id, agent = %endpoint, "agent link idle, closing");
            shared.close().await;
        }
    }

    async fn release_binding(&self, binding: Binding) {
        if let Some((endpoint, shared)) = binding.detach().await {
            self.release_link(&endpoint, shared).await;
        }
    }

    async fn close_state(&self, state: &Arc<ConnectionState>) {
        if let Some(binding) = state.detach().await {
            self.release_binding(binding).await;
        }
    }

    async fn rebind(
        &self,
        state: &Arc<ConnectionState>,
        container: &ContainerId,
        endpoint: &EndpointRef,
    ) -> ClientResult<()> {
        let binding = self.bind(state, container, endpoint).await?;
        if let Some(previous) = state
            .install(binding, container.clone(), endpoint.clone())
            .await
        {
            self.release_binding(previous).await;
        }
        info!(client_id = %self.id, container_id = %container, "connection rebound");
        Ok(())
    }

    /// Moves a connection off a binding that failed a call. Nothing happens
    /// when another caller already replaced that binding.
    pub(super) async fn recover(
        &self,
        state: &Arc<ConnectionState>,
        failed: &Binding,
    ) -> ClientResult<()> {
        if let Binding::Routed { link, agent, .. } = failed {
            self.evict_link(agent, link).await;
        }
        if !state.is_bound_to(failed).await {
            return Ok(());
        }
        self.rebind(state, &state.container(), &state.endpoint()).await
    }

    pub(super) async fn drop_connection(&self, state: &Arc<ConnectionState>) {
        {
            let mut connections = self.connections.lock().await;
            let container = state.container();
            if connections
                .get(&container)
                .is_some_and(|current| Arc::ptr_eq(current, state))
            {
                connections.remove(&container);
            }
        }
        self.close_state(state).await;
    }

    /// Closes the handles of `origin`. The container is released once no
    /// reference standing on it remains.
    pub(super) async fn release(&self, origin: &Arc<ReferenceSlot>) -> ClientResult<()> {
        if !origin.mark_closed() {
            return Ok(());
        }
        let container = {
            let mut references = self.references.lock().await;
            let slot = origin.current();
            let container = slot.id();
            if !references
                .get(&container)
                .is_some_and(|current| Arc::ptr_eq(current, &slot))
                || !slot.drop_holder()
            {
                return Ok(());
            }
            references.remove(&container);
            container
        };
        let connection = self.connections.lock().await.remove(&container);
        if let Some(state) = connection {
            self.close_state(&state).await;
        }
        self.registry.release(&self.id, &container).await?;
        debug!(client_id = %self.id, container_id = %container, "container reference released");
        Ok(())
    }

    /// Points `slot` at a fresh resolution, migrating or rebinding as
    /// needed.
    ///
    /// Migrating onto a container another reference already holds merges
    /// the two: `slot` forwards to the held one, which keeps its connection.
    /// The migrating connection is closed in that case.
    async fn apply_resolution(
        &self,
        slot: &Arc<ReferenceSlot>,
        resolved: ResolvedContainer,
    ) -> ClientResult<()> {
        let previous = slot.id();
        if resolved.uuid == previous {
            if resolved.endpoint != slot.endpoint() {
                self.apply_endpoint(slot, resolved.endpoint).await?;
            }
            return Ok(());
        }

        let (moved, displaced) = {
            let mut references = self.references.lock().await;
            if !references
                .get(&previous)
                .is_some_and(|current| Arc::ptr_eq(current, slot))
            {
                return Ok(());
            }
            references.remove(&previous);
            slot.set_id(resolved.uuid.clone());
            slot.set_endpoint(resolved.endpoint.clone());
            match references.get(&resolved.uuid) {
                Some(existing) => {
                    info!(
                        client_id = %self.id,
                        container_id = %resolved.uuid,
                        "migration target already held, merging references"
                    );
                    slot.merge_into(existing);
                }
                None => {
                    references.insert(resolved.uuid.clone(), Arc::clone(slot));
                }
            }
            let mut connections = self.connections.lock().await;
            match connections.remove(&previous) {
                Some(state) if connections.contains_key(&resolved.uuid) => (None, Some(state)),
                Some(state) => {
                    connections.insert(resolved.uuid.clone(), Arc::clone(&state));
                    (Some(state), None)
                }
                None => (None, None),
            }
        };
        info!(
            client_id = %self.id,
            from = %previous,
            to = %resolved.uuid,
            "container reference migrated"
        );
        if let Some(state) = displaced {
            debug!(container_id = %resolved.uuid, "closing connection displaced by migration");
            self.close_state(&state).await;
        }
        if let Some(state) = moved {
            self.rebind(&state, &resolved.uuid, &resolved.endpoint).await?;
        }
        Ok(())
    }

    async fn apply_endpoint(
        &self,
        slot: &Arc<ReferenceSlot>,
        endpoint: EndpointRef,
    ) -> ClientResult<()> {
        slot.set_endpoint(endpoint.clone());
        let container = slot.id();
        let connection = self.connections.lock().await.get(&container).map(Arc::clone);
        match connection {
            Some(state) if state.endpoint() != endpoint => {
                self.rebind(&state, &container, &endpoint).await
            }
            _ => Ok(()),
        }
    }

    async fn held(&self, container: &ContainerId) -> Option<Arc<ReferenceSlot>> {
        self.references.lock().await.get(container).map(Arc::clone)
    }

    async fn reconcile(self: &Arc<Self>, event: &NetworkEvent) {
        for change in &event.containers {
            let Some(slot) = self.held(&change.container.uuid).await else {
                continue;
            };
            match change.event {
                NetworkEventKind::Added | NetworkEventKind::Updated => {
                    if change.container.endpoint != slot.endpoint()
                        && let Err(err) = self
                            .apply_endpoint(&slot, change.container.endpoint.clone())
                            .await
                    {
                        error!(
                            container_id = %change.container.uuid,
                            error = %err,
                            "failed to rebind moved container"
                        );
                    }
                }
                NetworkEventKind::Removed => self.spawn_refresh(slot),
            }
        }
    }

    /// Re-validates every held reference against a fresh listing.
    async fn resync(self: &Arc<Self>) {
        let records = match self.registry.list(None).await {
            Ok(records) => records,
            Err(err) => {
                warn!(client_id = %self.id, error = %err, "directory resync failed");
                return;
            }
        };
        let listed: HashMap<ContainerId, EndpointRef> = records
            .into_iter()
            .map(|record| (record.uuid, record.endpoint))
            .collect();
        let slots: Vec<Arc<ReferenceSlot>> =
            self.references.lock().await.values().map(Arc::clone).collect();
        for slot in slots {
            match listed.get(&slot.id()) {
                Some(endpoint) if *endpoint != slot.endpoint() => {
                    if let Err(err) = self.apply_endpoint(&slot, endpoint.clone()).await {
                        error!(
                            container_id = %slot.id(),
                            error = %err,
                            "failed to rebind after resync"
                        );
                    }
                }
                Some(_) => {}
                None => self.spawn_refresh(slot),
            }
        }
    }

    /// Re-resolves a reference whose container disappeared.
    fn spawn_refresh(self: &Arc<Self>, slot: Arc<ReferenceSlot>) {
        if !slot.begin_refresh() {
            return;
        }
        let runtime = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            if let Some(live) = runtime.upgrade() {
                let outcome = match live.resolve(slot.kind(), &slot.pinned_request()).await {
                    Ok(resolved) => live.apply_resolution(&slot, resolved).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = outcome {
                    warn!(
                        container_id = %slot.id(),
                        error = %err,
                        "background re-resolution failed"
                    );
                }
            }
            slot.end_refresh();
        });
        self.track(task);
    }

    async fn notify_listeners(&self, event: &NetworkEvent) {
        let listeners: Vec<EventListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if let Err(err) = listener(event.clone()).await {
                error!(client_id = %self.id, error = %err, "directory event listener failed");
            }
        }
    }
}

/// Slot for a new handle on `held`; closed handles get a fresh alias.
fn handle_slot(held: &Arc<ReferenceSlot>) -> Arc<ReferenceSlot> {
    if held.is_closed() {
        ReferenceSlot::alias(held)
    } else {
        Arc::clone(held)
    }
}

/// Waits out `sleep` unless a batch announcing an agent for `kind` arrives
/// first. Returns whether the wait was cut short.
async fn wait_or_wake(
    mut sleep: BoxFuture<'static, ()>,
    events: &mut DirectoryEvents,
    kind: &ContainerKind,
) -> bool {
    loop {
        tokio::select! {
            () = &mut sleep => return false,
            received = events.recv() => match received {
                Ok(event) if event.adds_agent_with_kind(kind) => return true,
                Ok(_) => {}
                Err(EventStreamError::Lagged(_)) => return true,
                Err(EventStreamError::Closed) => {
                    sleep.await;
                    return false;
                }
            },
        }
    }
}

async fn watch_directory(runtime: Weak<RuntimeInner>, mut events: DirectoryEvents) {
    loop {
        let received = events.recv().await;
        let Some(live) = runtime.upgrade() else {
            return;
        };
        match received {
            Ok(event) => {
                live.reconcile(&event).await;
                live.notify_listeners(&event).await;
            }
            Err(EventStreamError::Lagged(missed)) => {
                warn!(client_id = %live.id, missed, "directory events lagged, resynchronising");
                live.resync().await;
            }
            Err(EventStreamError::Closed) => return,
        }
    }
}
