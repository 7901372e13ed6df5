//! Channel implementations.

mod loopback;

pub use loopback::LoopbackChannel;
