//! Container/agent directory.
//!
//! The directory is the authoritative map from agent identity to advertised
//! kinds and address, and from container identity to owning agent, address
//! and kind. The module follows the crate's hexagonal layout:
//!
//! - Domain types in [`domain`]
//! - Port contracts in [`ports`]
//! - The in-process registry in [`services`]

pub mod domain;
pub mod ports;
pub mod services;

#[cfg(test)]
mod tests;
