//! Transport contracts.

mod channel;

pub use channel::{RpcChannel, RpcError, RpcHandler, RpcResult, TransportError, decode_reply};

#[cfg(test)]
pub(crate) use channel::MockRpcChannel;
