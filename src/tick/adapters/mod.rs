//! Scheduler implementations.

mod manager;

pub use manager::TickManager;
