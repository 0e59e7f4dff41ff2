//! One-sided replication over registered memory.
//!
//! Applications propose keyed records; a per-division worker frames them
//! into a staging region and writes each frame into every peer's mirror of
//! that region. Peers poll their mirrors, validate frames by canary and
//! checksum, and hand payloads to a replay callback. Records owned by
//! another node are held until that owner acknowledges them.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod core;
pub mod error;
pub mod node;
pub mod replayer;
pub mod replicator;
pub mod transport;
pub mod wire;
pub mod worker;

/// Prelude for convenient imports of primary API types.
pub mod prelude {
    pub use crate::config::{FaultPolicy, NodeConfig};
    pub use crate::core::{Division, NodeId, ProposeOutcome};
    pub use crate::error::{ReplicationError, Result};
    pub use crate::node::Node;
    pub use crate::replayer::ReplayStatus;
    pub use crate::transport::{LoopbackFabric, RdmaTransport};
    pub use crate::wire::RequestType;
}

pub use crate::config::{FaultPolicy, NodeConfig};
pub use crate::core::{Division, MetricsSnapshot, NodeId, ProposeOutcome};
pub use crate::error::{ReplicationError, Result};
pub use crate::node::Node;
pub use crate::replayer::{ReplayCallback, ReplayStatus};
pub use crate::replicator::Submission;
pub use crate::transport::{FabricPort, LoopbackFabric, RdmaTransport};
pub use crate::wire::RequestType;
