//! Given steps for network BDD scenarios.

use super::world::{NetworkWorld, run_async};
use eyre::WrapErr;
use rstest_bdd_macros::given;
use std::time::Duration;
use switchboard::directory::domain::{ContainerKind, GetOptions};

#[given(r#"a client runtime "{id}""#)]
fn a_client_runtime(world: &mut NetworkWorld, id: String) {
    world.start_runtime(&id);
}

#[given(r#"the runtime is waiting for a container of kind "{kind}""#)]
fn runtime_waiting_for_kind(world: &mut NetworkWorld, kind: String) -> Result<(), eyre::Report> {
    let runtime = world.runtime()?;
    let wanted = ContainerKind::new(kind)?;
    world.pending = Some(tokio::spawn(async move {
        runtime.get(&wanted, &GetOptions::default()).await
    }));
    run_async(tokio::time::sleep(Duration::from_millis(50)));
    Ok(())
}

#[given(r#"agent "{name}" offers stateless container "{uuid}""#)]
fn agent_offers_stateless(
    world: &mut NetworkWorld,
    name: String,
    uuid: String,
) -> Result<(), eyre::Report> {
    world.offer_stateless(&name, &uuid)
}

#[given("both agents register")]
fn both_agents_register_first(world: &mut NetworkWorld) -> Result<(), eyre::Report> {
    world.register("primary")?;
    world.register("standby")
}

#[given(r#"the runtime serves agents "{first}" and "{second}""#)]
fn runtime_serves_agents(
    world: &mut NetworkWorld,
    first: String,
    second: String,
) -> Result<(), eyre::Report> {
    let runtime = world.runtime()?;
    for name in [first, second] {
        let agent = world.agent_with_kind(&name, "k")?;
        run_async(runtime.serve_agent(agent)).wrap_err_with(|| format!("serve agent '{name}'"))?;
    }
    Ok(())
}

#[given(r#"the runtime holds {count} references of kind "{kind}""#)]
fn runtime_holds_references(
    world: &mut NetworkWorld,
    count: usize,
    kind: String,
) -> Result<(), eyre::Report> {
    let runtime = world.runtime()?;
    let wanted = ContainerKind::new(kind)?;
    for index in 1..=count {
        let options = GetOptions::for_uuid(format!("c-{index}"));
        run_async(runtime.get(&wanted, &options)).wrap_err("resolve reference")?;
    }
    Ok(())
}
