//! Port contracts for the directory.

mod agent;
mod events;
mod registry;

pub use agent::{AgentError, AgentHandle, AgentResult};
pub use events::{DirectoryEvents, EventStreamError};
pub use registry::{Registry, RegistryError, RegistryResult};
