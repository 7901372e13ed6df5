//! Switchboard: container directory and routing layer.
//!
//! This crate lets callers ask for "a container of kind K" and get back a
//! handle that keeps working while the backing instance is created,
//! re-registered, moved or replaced by a standby agent.
//!
//! # Architecture
//!
//! Switchboard follows hexagonal architecture principles:
//!
//! - **Domain**: Identities, records, endpoints and change events
//! - **Ports**: Trait contracts for registries, containers and transports
//! - **Adapters**: In-process channels and connectors
//!
//! # Modules
//!
//! - [`tick`]: Logical clock driving every timer
//! - [`directory`]: Authoritative agent/container directory
//! - [`agent`]: Container hosting and HA registration
//! - [`rpc`]: Registry and routed-connection wire protocol
//! - [`client`]: Resolution, connection caching and reference migration
//! - [`config`]: Timing configuration shared by every component

pub mod agent;
pub mod client;
pub mod config;
pub mod directory;
pub mod rpc;
pub mod tick;
