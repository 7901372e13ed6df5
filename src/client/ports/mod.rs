//! Connection ports.

mod connector;

pub use connector::{AgentLink, ConnectError, ConnectResult, Connector, DirectLink};
