//! Resolution, requests and pushes through a proxied directory.

use super::helpers::{Stack, eventually, kind, push_sink, stack};
use rstest::rstest;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use switchboard::directory::domain::{ContainerId, GetOptions};
use switchboard::directory::ports::Registry;
use switchboard::tick::TickScheduler;

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn container_hosted_by_one_runtime_serves_another(stack: Stack) {
    let host = stack.remote_runtime("host").await;
    host.serve_agent(stack.routed_agent("agent-a"))
        .await
        .expect("serve agent");
    let caller = stack.remote_runtime("caller").await;

    let reference = caller
        .get(&kind("k"), &GetOptions::for_uuid("c-1"))
        .await
        .expect("reference");
    let proxied = reference.request("echo", json!("via directory")).await.expect("proxied");
    let connection = reference.connect().await.expect("connection");
    let direct = connection.request("echo", json!("via link")).await.expect("routed");

    assert_eq!(proxied["from"], json!("agent-a"));
    assert_eq!(proxied["data"], json!("via directory"));
    assert_eq!(direct["data"], json!("via link"));
    assert_eq!(connection.container_id(), ContainerId::new("c-1"));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn caller_waiting_for_a_kind_wakes_when_a_remote_agent_registers(stack: Stack) {
    let caller = Arc::new(stack.remote_runtime("caller").await);
    let waiting = {
        let resolver = Arc::clone(&caller);
        tokio::spawn(async move { resolver.get(&kind("k"), &GetOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let host = stack.remote_runtime("host").await;
    host.serve_agent(stack.routed_agent("agent-a"))
        .await
        .expect("serve agent");

    let reference = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .expect("woken by the registration")
        .expect("resolver task")
        .expect("reference");
    assert_eq!(reference.kind(), &kind("k"));
    assert_eq!(stack.ticks.now(), 0);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn routed_pushes_cross_the_agent_link(stack: Stack) {
    let host = stack.remote_runtime("host").await;
    host.serve_agent(stack.routed_agent("agent-a"))
        .await
        .expect("serve agent");
    let caller = stack.remote_runtime("caller").await;
    let reference = caller
        .get(&kind("k"), &GetOptions::for_uuid("c-1"))
        .await
        .expect("reference");
    let connection = reference.connect().await.expect("connection");
    let (sink, mut received) = push_sink();
    connection.on_push(sink);

    stack
        .created(&ContainerId::new("c-1"))
        .push(&json!({ "progress": 100 }))
        .await;

    let pushed = tokio::time::timeout(Duration::from_secs(2), received.recv())
        .await
        .expect("push delivered");
    assert_eq!(pushed, Some(json!({ "progress": 100 })));
    assert!(eventually(|| stack.connector.agent_connections() == 1).await);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn closing_the_caller_orphans_what_it_held(stack: Stack) {
    let host = stack.remote_runtime("host").await;
    host.serve_agent(stack.routed_agent("agent-a"))
        .await
        .expect("serve agent");
    let caller = stack.remote_runtime("caller").await;
    for uuid in ["c-1", "c-2"] {
        caller
            .get(&kind("k"), &GetOptions::for_uuid(uuid))
            .await
            .expect("reference");
    }
    assert!(stack.directory.orphaned().await.is_empty());

    caller.close().await;

    assert_eq!(
        stack.directory.orphaned().await,
        vec![ContainerId::new("c-1"), ContainerId::new("c-2")]
    );
    assert_eq!(stack.directory.agents().await.expect("agents").len(), 1);
}
