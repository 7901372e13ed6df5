//! Client-side value types.

mod backoff;
mod error;

pub use backoff::Backoff;
pub use error::{ClientError, ClientResult};
