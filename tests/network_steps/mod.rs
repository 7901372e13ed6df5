//! Step definitions for the network behaviour scenarios.

pub mod world;

mod given;
mod then;
mod when;
