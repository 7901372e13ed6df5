//! Test doubles shared by the directory unit tests.

use crate::config::NetworkConfig;
use crate::directory::domain::{
    AgentId, AgentRecord, ContainerEndpoint, ContainerId, ContainerKind, ContainerRecord,
    GetOptions, ResolvedContainer,
};
use crate::directory::ports::{AgentError, AgentHandle, AgentResult};
use crate::directory::services::DirectoryService;
use crate::tick::TickManager;
use async_trait::async_trait;
use mockable::DefaultClock;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(super) type TestDirectory = DirectoryService<DefaultClock>;

pub(super) fn kind(raw: &str) -> ContainerKind {
    ContainerKind::new(raw).expect("valid test kind")
}

pub(super) fn directory(ticks: &TickManager) -> TestDirectory {
    DirectoryService::new(
        Arc::new(ticks.clone()),
        Arc::new(DefaultClock),
        NetworkConfig::testing(),
    )
}

pub(super) fn container_record(agent: &str, uuid: &str, raw_kind: &str) -> ContainerRecord {
    ContainerRecord {
        uuid: ContainerId::new(uuid),
        agent_id: AgentId::new(agent),
        kind: kind(raw_kind),
        endpoint: ContainerEndpoint::direct(
            AgentId::new(agent),
            ContainerId::new(uuid),
            format!("{agent}.local"),
            7000,
        )
        .encode(),
        last_visit: 0,
        labels: None,
        extra: None,
    }
}

pub(super) fn agent_record(
    agent: &str,
    containers: Vec<ContainerRecord>,
    kinds: &[&str],
) -> AgentRecord {
    AgentRecord {
        agent_id: AgentId::new(agent),
        containers,
        kinds: kinds.iter().map(|raw| kind(raw)).collect(),
        endpoint: None,
    }
}

/// Agent double that mints containers on demand and records calls.
pub(super) struct StubAgent {
    id: AgentId,
    creations: AtomicUsize,
    terminated: Mutex<Vec<ContainerId>>,
    creation_delay: Duration,
    failing: bool,
}

impl StubAgent {
    pub(super) fn new(id: &str) -> Arc<Self> {
        Arc::new(Self::build(id, Duration::ZERO, false))
    }

    pub(super) fn slow(id: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(id, delay, false))
    }

    pub(super) fn failing(id: &str) -> Arc<Self> {
        Arc::new(Self::build(id, Duration::ZERO, true))
    }

    fn build(id: &str, creation_delay: Duration, failing: bool) -> Self {
        Self {
            id: AgentId::new(id),
            creations: AtomicUsize::new(0),
            terminated: Mutex::new(Vec::new()),
            creation_delay,
            failing,
        }
    }

    pub(super) fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    pub(super) fn terminated(&self) -> Vec<ContainerId> {
        self.terminated.lock().expect("terminated lock").clone()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("factory exploded")]
struct Exploded;

#[async_trait]
impl AgentHandle for StubAgent {
    async fn get(
        &self,
        kind: &ContainerKind,
        options: &GetOptions,
    ) -> AgentResult<ResolvedContainer> {
        self.creations.fetch_add(1, Ordering::SeqCst);
        if !self.creation_delay.is_zero() {
            tokio::time::sleep(self.creation_delay).await;
        }
        if self.failing {
            return Err(AgentError::factory(kind.clone(), Exploded));
        }
        let uuid = options.uuid.clone().unwrap_or_else(ContainerId::generate);
        let endpoint =
            ContainerEndpoint::direct(self.id.clone(), uuid.clone(), "stub.local", 7001).encode();
        Ok(ResolvedContainer { uuid, endpoint })
    }

    async fn request(
        &self,
        container: &ContainerId,
        operation: &str,
        data: Value,
    ) -> AgentResult<Value> {
        Ok(json!({
            "agent": self.id.as_str(),
            "container": container.as_str(),
            "operation": operation,
            "data": data,
        }))
    }

    async fn terminate(&self, container: &ContainerId) -> AgentResult<()> {
        self.terminated
            .lock()
            .expect("terminated lock")
            .push(container.clone());
        Ok(())
    }
}
