//! Directory services.

mod directory;
mod state;

pub use directory::{DirectoryService, EventListener, ListenerError};
