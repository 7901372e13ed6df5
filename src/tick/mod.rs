//! Logical clock and cooperative timers.
//!
//! Every time-dependent behaviour in the crate (resolution backoff,
//! keep-alive pings, registry housekeeping) is expressed in ticks of an
//! injected [`ports::TickScheduler`]. Production code drives the clock from
//! a Tokio interval; tests step it by hand.

pub mod adapters;
pub mod ports;

pub use adapters::TickManager;
pub use ports::{Tick, TickCallback, TickScheduler, TickSubscription, tick_callback};
