//! Client runtime: resolution, connection caching and reference migration.
//!
//! A [`services::ClientRuntime`] turns "a container of kind K" into a
//! [`services::ContainerReference`] whose identity survives the backing
//! instance moving or being replaced. Resolution retries transient
//! failures with a tick-based [`domain::Backoff`] that a qualifying
//! directory event cuts short. Data-plane connections are opened through a
//! [`ports::Connector`], either straight to the container or multiplexed
//! over one shared link per agent.

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod services;

#[cfg(test)]
mod tests;
