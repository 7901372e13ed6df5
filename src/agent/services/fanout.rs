//! Push fan-out from one container to its connected clients.

use crate::agent::ports::PushHandler;
use crate::directory::domain::{ClientId, ContainerId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Connected clients of one container.
///
/// Containers delegate [`crate::agent::ports::Container::connect`] and
/// `disconnect` here and call [`ClientFanout::broadcast`] to push data.
/// Each delivery runs on its own task, so a failing or slow client never
/// delays the others.
#[derive(Default)]
pub struct ClientFanout {
    container: Option<ContainerId>,
    clients: Mutex<HashMap<ClientId, PushHandler>>,
}

impl ClientFanout {
    /// Creates a fan-out whose log lines carry `container`.
    #[must_use]
    pub fn for_container(container: ContainerId) -> Self {
        Self {
            container: Some(container),
            clients: Mutex::default(),
        }
    }

    /// Adds or replaces a client's push handler.
    pub fn connect(&self, client: ClientId, push: PushHandler) {
        self.lock().insert(client, push);
    }

    /// Drops a client's push handler.
    pub fn disconnect(&self, client: &ClientId) {
        self.lock().remove(client);
    }

    /// Number of connected clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no client is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Pushes `data` to every connected client without waiting for delivery.
    ///
    /// Returns the spawned delivery tasks; dropping them does not cancel
    /// delivery.
    pub fn broadcast(&self, data: &Value) -> Vec<JoinHandle<()>> {
        let targets: Vec<(ClientId, PushHandler)> = self
            .lock()
            .iter()
            .map(|(client, push)| (client.clone(), PushHandler::clone(push)))
            .collect();
        debug!(container_id = ?self.container, clients = targets.len(), "broadcasting push");
        targets
            .into_iter()
            .map(|(client, push)| {
                let payload = data.clone();
                let container = self.container.clone();
                tokio::spawn(async move {
                    if let Err(err) = push(payload).await {
                        warn!(
                            container_id = ?container,
                            client_id = %client,
                            error = %err,
                            "push delivery failed"
                        );
                    }
                })
            })
            .collect()
    }

    /// Pushes `data` to one client; unknown clients are ignored.
    pub fn send(&self, client: &ClientId, data: Value) -> Option<JoinHandle<()>> {
        let push = self.lock().get(client).map(PushHandler::clone)?;
        let target = client.clone();
        let container = self.container.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = push(data).await {
                warn!(
                    container_id = ?container,
                    client_id = %target,
                    error = %err,
                    "push delivery failed"
                );
            }
        }))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ClientId, PushHandler>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ClientFanout {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientFanout")
            .field("container", &self.container)
            .field("clients", &self.len())
            .finish()
    }
}
