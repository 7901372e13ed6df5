//! Directory domain types: identities, endpoints, records and change events.

mod endpoint;
mod error;
mod event;
mod ids;
mod record;

pub use endpoint::{AgentEndpoint, ConnectionStrategy, ContainerEndpoint, EndpointRef};
pub use error::{DirectoryDomainError, ErrorKind};
pub use event::{AgentEvent, ContainerEvent, NetworkEvent, NetworkEventKind};
pub use ids::{AgentId, ClientId, ContainerId, ContainerKind};
pub use record::{AgentRecord, AgentRecordInfo, ContainerRecord, GetOptions, ResolvedContainer};
