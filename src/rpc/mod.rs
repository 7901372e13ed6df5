//! Wire protocol for the registry and for routed agent connections.
//!
//! Every operation is a [`domain::RpcRequest`] variant addressed by a
//! short string code and answered by one JSON value or a
//! [`domain::RemoteError`]. The byte transport is abstracted behind
//! [`ports::RpcChannel`]; [`adapters::LoopbackChannel`] connects two
//! in-process peers through a JSON round trip.
//!
//! [`services`] provides both ends of the registry protocol
//! ([`services::RegistryServer`] and [`services::RegistryProxy`]) and the
//! agent-side listener for routed connections.

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod services;

#[cfg(test)]
mod tests;
