//! Caller-held container references.

use super::connection::ContainerConnection;
use super::runtime::RuntimeInner;
use crate::client::domain::{ClientError, ClientResult};
use crate::directory::domain::{ContainerId, ContainerKind, EndpointRef, GetOptions};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Mutable target of a reference, shared by every handle to it.
///
/// The runtime indexes slots by their current container id; migrating a
/// reference rewrites that key and the slot's `id` together. A slot whose
/// container migrates onto one already held forwards to the held slot,
/// which then counts it among its `holders`.
pub(super) struct ReferenceSlot {
    id: Mutex<ContainerId>,
    endpoint: Mutex<EndpointRef>,
    kind: ContainerKind,
    options: GetOptions,
    refreshing: AtomicBool,
    forward: Mutex<Option<Arc<ReferenceSlot>>>,
    holders: AtomicUsize,
    closed: AtomicBool,
}

impl ReferenceSlot {
    pub(super) fn new(
        id: ContainerId,
        endpoint: EndpointRef,
        kind: ContainerKind,
        options: GetOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Mutex::new(id),
            endpoint: Mutex::new(endpoint),
            kind,
            options,
            refreshing: AtomicBool::new(false),
            forward: Mutex::new(None),
            holders: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
        })
    }

    /// New handle slot sharing `target`, for a caller asking again after
    /// the previous handles were closed.
    pub(super) fn alias(target: &Arc<Self>) -> Arc<Self> {
        let alias = Self::new(
            target.id(),
            target.endpoint(),
            target.kind.clone(),
            target.options.clone(),
        );
        alias.merge_into(target);
        alias
    }

    /// Slot that currently stands for this one, following forwards.
    pub(super) fn current(self: &Arc<Self>) -> Arc<Self> {
        let mut slot = Arc::clone(self);
        loop {
            let next = slot
                .forward
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match next {
                Some(target) => slot = target,
                None => return slot,
            }
        }
    }

    /// Forwards this slot to `target`, handing over its holders.
    pub(super) fn merge_into(&self, target: &Arc<Self>) {
        let holders = self.holders.swap(0, Ordering::SeqCst);
        target.holders.fetch_add(holders, Ordering::SeqCst);
        *self.forward.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(target));
    }

    /// Marks the handles of this slot closed; false when already closed.
    pub(super) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(super) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drops one holder; true when it was the last.
    pub(super) fn drop_holder(&self) -> bool {
        let previous = self
            .holders
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |holders| {
                Some(holders.saturating_sub(1))
            })
            .unwrap_or_else(|holders| holders);
        previous <= 1
    }

    pub(super) fn id(&self) -> ContainerId {
        self.id.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(super) fn set_id(&self, id: ContainerId) {
        *self.id.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }

    pub(super) fn endpoint(&self) -> EndpointRef {
        self.endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(super) fn set_endpoint(&self, endpoint: EndpointRef) {
        *self.endpoint.lock().unwrap_or_else(PoisonError::into_inner) = endpoint;
    }

    pub(super) const fn kind(&self) -> &ContainerKind {
        &self.kind
    }

    /// The original acquisition request pinned to the current id.
    pub(super) fn pinned_request(&self) -> GetOptions {
        GetOptions {
            uuid: Some(self.id()),
            ..self.options.clone()
        }
    }

    /// Claims the slot for a background refresh; false when one is running.
    pub(super) fn begin_refresh(&self) -> bool {
        !self.refreshing.swap(true, Ordering::SeqCst)
    }

    pub(super) fn end_refresh(&self) {
        self.refreshing.store(false, Ordering::SeqCst);
    }
}

/// Handle to one logical container, stable across backing-instance
/// replacement.
///
/// Clones share the same target. Once the reference is closed every call
/// fails with [`ClientError::Released`]. When two references end up on the
/// same container both stay valid, and the container is released with the
/// last of them.
#[derive(Clone)]
pub struct ContainerReference {
    slot: Arc<ReferenceSlot>,
    runtime: Weak<RuntimeInner>,
}

impl ContainerReference {
    pub(super) const fn new(slot: Arc<ReferenceSlot>, runtime: Weak<RuntimeInner>) -> Self {
        Self { slot, runtime }
    }

    pub(super) const fn slot(&self) -> &Arc<ReferenceSlot> {
        &self.slot
    }

    fn runtime(&self) -> ClientResult<Arc<RuntimeInner>> {
        self.runtime.upgrade().ok_or(ClientError::Closed)
    }

    /// Current backing container id.
    #[must_use]
    pub fn id(&self) -> ContainerId {
        self.slot.current().id()
    }

    /// Requested kind.
    #[must_use]
    pub fn kind(&self) -> &ContainerKind {
        self.slot.kind()
    }

    /// Cached endpoint of the backing container.
    #[must_use]
    pub fn endpoint(&self) -> EndpointRef {
        self.slot.current().endpoint()
    }

    /// Whether both handles point at the same logical container.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot.current(), &other.slot.current())
    }

    /// Sends a data-plane call through the directory to the current
    /// backing container.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Released`] after [`Self::close`], and any
    /// directory or agent failure.
    pub async fn request(&self, operation: &str, data: Value) -> ClientResult<Value> {
        let runtime = self.runtime()?;
        runtime.ensure_held(&self.slot).await?;
        Ok(runtime.registry.request(&self.id(), operation, data).await?)
    }

    /// Opens (or reuses) a data-plane connection to the backing container.
    ///
    /// # Errors
    ///
    /// See [`crate::client::services::ClientRuntime::connect`].
    pub async fn connect(&self) -> ClientResult<ContainerConnection> {
        self.runtime()?.connect(self).await
    }

    /// Releases the reference. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns directory failures from the release call.
    pub async fn close(&self) -> ClientResult<()> {
        match self.runtime.upgrade() {
            Some(runtime) => runtime.release(&self.slot).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ContainerReference {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ContainerReference")
            .field("id", &self.id())
            .field("kind", self.kind())
            .finish_non_exhaustive()
    }
}
