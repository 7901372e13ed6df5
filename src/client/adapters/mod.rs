//! Connector implementations.

mod channel;
mod memory;

pub use channel::ChannelAgentLink;
pub use memory::InMemoryConnector;
