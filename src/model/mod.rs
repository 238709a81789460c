//! The graph model: vertices, edges, queues, groups, and content claims.

pub mod claim;
pub mod connectable;
pub mod connection;
pub mod flowfile;
pub mod group;
pub mod queue;

pub use claim::{ContentClaim, ContentClaimManager};
pub use connectable::{Connectable, ProcessorHandle, ANONYMOUS_RELATIONSHIP};
pub use connection::Connection;
pub use flowfile::{FlowFileRecord, FlowFileRecordBuilder};
pub use group::{
    GroupError, Label, ProcessGroup, RemoteFlowContents, RemotePortDescriptor, RemoteProcessGroup,
};
pub use queue::{FlowFileQueue, QueueSize};
