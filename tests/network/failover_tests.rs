//! Standby takeover and runtime shutdown across remote runtimes.

use super::helpers::{Stack, TaggedContainer, eventually, kind, stack};
use rstest::rstest;
use serde_json::json;
use std::sync::Arc;
use switchboard::directory::domain::{AgentId, ContainerId, GetOptions};
use switchboard::directory::ports::Registry;

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn first_registration_wins_and_the_standby_copy_is_dropped(stack: Stack) {
    let svc = ContainerId::new("svc-1");
    let primary_host = stack.remote_runtime("primary-host").await;
    let standby_host = stack.remote_runtime("standby-host").await;
    let primary = stack
        .candidate_agent("primary", &svc, TaggedContainer::new("primary", &svc))
        .await;
    let standby = stack
        .candidate_agent("standby", &svc, TaggedContainer::new("standby", &svc))
        .await;

    primary_host.serve_agent(Arc::clone(&primary)).await.expect("primary");
    standby_host.serve_agent(Arc::clone(&standby)).await.expect("standby");

    assert!(primary.is_active(&svc).await);
    assert!(!standby.is_active(&svc).await);
    assert!(!standby.is_stateless(&svc).await);
    let records = stack.directory.list(None).await.expect("list");
    assert_eq!(records.len(), 1);
    assert_eq!(
        records.first().map(|record| record.agent_id.clone()),
        Some(AgentId::new("primary"))
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn caller_follows_the_container_to_the_standby(stack: Stack) {
    let svc = ContainerId::new("svc-1");
    let primary_host = stack.remote_runtime("primary-host").await;
    let standby_host = stack.remote_runtime("standby-host").await;
    let primary = stack
        .candidate_agent("primary", &svc, TaggedContainer::new("primary", &svc))
        .await;
    let standby = stack
        .candidate_agent("standby", &svc, TaggedContainer::new("standby", &svc))
        .await;
    primary_host.serve_agent(primary).await.expect("primary");
    standby_host.serve_agent(Arc::clone(&standby)).await.expect("standby");

    let caller = stack.remote_runtime("caller").await;
    let reference = caller
        .get(&kind("k"), &GetOptions::for_uuid("svc-1"))
        .await
        .expect("reference");
    let connection = reference.connect().await.expect("connection");
    let before = connection.endpoint();
    let first = connection.request("who", json!(null)).await.expect("primary reply");
    assert_eq!(first["from"], json!("primary"));

    primary_host.close().await;
    stack
        .offer(&standby, &svc, TaggedContainer::new("standby", &svc))
        .await;
    standby_host.serve_agent(standby).await.expect("standby takes over");

    assert!(eventually(|| connection.endpoint() != before).await);
    let second = connection.request("who", json!(null)).await.expect("standby reply");
    assert_eq!(second["from"], json!("standby"));
    assert_eq!(reference.id(), svc);
    let agents = stack.directory.agents().await.expect("agents");
    let ids: Vec<AgentId> = agents.into_iter().map(|info| info.agent_id).collect();
    assert_eq!(ids, vec![AgentId::new("standby")]);
}
