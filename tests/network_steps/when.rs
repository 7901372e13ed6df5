//! When steps for network BDD scenarios.

use super::world::{NetworkWorld, run_async};
use eyre::WrapErr;
use rstest_bdd_macros::when;
use switchboard::directory::domain::AgentId;
use switchboard::directory::ports::Registry;

#[when(r#"an agent "{name}" advertising kind "{kind}" registers"#)]
fn agent_advertising_kind_registers(
    world: &mut NetworkWorld,
    name: String,
    kind: String,
) -> Result<(), eyre::Report> {
    world.agent_with_kind(&name, &kind)?;
    world.register(&name)
}

#[when("both agents register")]
fn both_agents_register(world: &mut NetworkWorld) -> Result<(), eyre::Report> {
    world.register("primary")?;
    world.register("standby")
}

#[when(r#"agent "{name}" unregisters"#)]
fn agent_unregisters(world: &mut NetworkWorld, name: String) -> Result<(), eyre::Report> {
    run_async(world.directory.unregister(&AgentId::new(name.as_str())))
        .wrap_err_with(|| format!("unregister agent '{name}'"))
}

#[when(r#"agent "{name}" offers stateless container "{uuid}" again"#)]
fn agent_offers_again(
    world: &mut NetworkWorld,
    name: String,
    uuid: String,
) -> Result<(), eyre::Report> {
    world.offer_stateless(&name, &uuid)?;
    world.register(&name)
}

#[when("the runtime is closed")]
fn runtime_closed(world: &mut NetworkWorld) -> Result<(), eyre::Report> {
    let runtime = world.runtime()?;
    run_async(runtime.close());
    Ok(())
}
