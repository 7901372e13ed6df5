//! Then steps for network BDD scenarios.

use super::world::{NetworkWorld, run_async};
use eyre::{WrapErr, ensure};
use rstest_bdd_macros::then;
use std::sync::atomic::Ordering;
use std::time::Duration;
use switchboard::directory::domain::{AgentId, ContainerId, ContainerKind};
use switchboard::directory::ports::Registry;
use switchboard::tick::TickScheduler;

#[then(r#"the waiting request resolves to a container of kind "{kind}""#)]
fn waiting_request_resolves(world: &mut NetworkWorld, kind: String) -> Result<(), eyre::Report> {
    let pending = world
        .pending
        .take()
        .ok_or_else(|| eyre::eyre!("no pending resolution in scenario world"))?;
    let reference = run_async(tokio::time::timeout(Duration::from_secs(2), pending))
        .wrap_err("resolution was not woken")?
        .wrap_err("resolver task failed")?
        .wrap_err("resolution failed")?;
    ensure!(
        reference.kind() == &ContainerKind::new(kind.as_str())?,
        "resolved kind {} instead of {kind}",
        reference.kind()
    );
    Ok(())
}

#[then("the logical clock has not advanced")]
fn clock_not_advanced(world: &mut NetworkWorld) -> Result<(), eyre::Report> {
    let now = world.ticks.now();
    ensure!(now == 0, "clock advanced to tick {now}");
    Ok(())
}

#[then(r#"the directory lists container "{uuid}" owned by "{owner}""#)]
fn directory_lists_owner(
    world: &mut NetworkWorld,
    uuid: String,
    owner: String,
) -> Result<(), eyre::Report> {
    let records = run_async(world.directory.list(None)).wrap_err("list containers")?;
    let wanted = ContainerId::new(uuid.as_str());
    let owners: Vec<AgentId> = records
        .into_iter()
        .filter(|record| record.uuid == wanted)
        .map(|record| record.agent_id)
        .collect();
    ensure!(
        owners == vec![AgentId::new(owner.as_str())],
        "container {uuid} owned by {owners:?}"
    );
    Ok(())
}

#[then(r#"agent "{name}" no longer holds container "{uuid}""#)]
fn agent_dropped_container(
    world: &mut NetworkWorld,
    name: String,
    uuid: String,
) -> Result<(), eyre::Report> {
    let agent = world.agent(&name)?;
    let container_id = ContainerId::new(uuid.as_str());
    ensure!(
        !run_async(agent.is_active(&container_id)),
        "{name} still serves {uuid}"
    );
    ensure!(
        !run_async(agent.is_stateless(&container_id)),
        "{name} still offers {uuid}"
    );
    Ok(())
}

#[then("the directory saw {releases} releases and {unregisters} unregistrations")]
fn directory_saw_counts(
    world: &mut NetworkWorld,
    releases: usize,
    unregisters: usize,
) -> Result<(), eyre::Report> {
    let seen_releases = world.counting.releases.load(Ordering::SeqCst);
    let seen_unregisters = world.counting.unregisters.load(Ordering::SeqCst);
    ensure!(seen_releases == releases, "saw {seen_releases} releases");
    ensure!(
        seen_unregisters == unregisters,
        "saw {seen_unregisters} unregistrations"
    );
    let agents = run_async(world.directory.agents()).wrap_err("list agents")?;
    ensure!(agents.is_empty(), "agents still registered: {agents:?}");
    Ok(())
}
