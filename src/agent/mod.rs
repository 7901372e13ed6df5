//! Agents host containers and advertise them to the directory.
//!
//! An agent keeps two sets of containers: active ones it owns in the
//! directory, and stateless candidates it offers as interchangeable
//! replicas under a fixed id. Registering with the directory is how a
//! candidate either wins ownership (and becomes active) or loses the race
//! (and is terminated).
//!
//! - Container and factory contracts in [`ports`]
//! - The [`services::Agent`] itself and the push fan-out helper in
//!   [`services`]

pub mod ports;
pub mod services;

#[cfg(test)]
mod tests;
