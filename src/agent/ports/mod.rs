//! Contracts implemented by container code.

mod container;

pub use container::{
    Container, ContainerError, ContainerFactory, ContainerResult, CreatedContainer, PushError,
    PushHandler, factory_fn, push_handler,
};

#[cfg(test)]
pub(crate) use container::MockContainer;
