//! Protocol messages and error payloads.

mod error;
mod message;

pub use error::RemoteError;
pub use message::RpcRequest;
