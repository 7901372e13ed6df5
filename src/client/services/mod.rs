//! Client runtime services.

mod connection;
mod reference;
mod runtime;

pub use connection::ContainerConnection;
pub use reference::ContainerReference;
pub use runtime::ClientRuntime;
