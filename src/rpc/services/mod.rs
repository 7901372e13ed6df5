//! Protocol endpoints.

mod agent_listener;
mod registry_proxy;
mod registry_server;

pub use agent_listener::AgentListener;
pub use registry_proxy::RegistryProxy;
pub use registry_server::RegistryServer;
