//! Agent services.

mod agent;
mod fanout;

pub use agent::{Agent, HostedContainer};
pub use fanout::ClientFanout;
