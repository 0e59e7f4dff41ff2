//! One-sided remote memory access.
//!
//! The replication core only needs four things from a transport: resolve a
//! local region, resolve a peer's region descriptor, post a one-sided
//! read or write, and wait for its completion. [`RdmaTransport`] is that
//! surface; [`LoopbackFabric`] implements it in-process.

pub mod fabric;
pub mod region;

use std::sync::Arc;

use crate::core::division::{Division, NodeId};

pub use fabric::{FabricPort, LoopbackFabric, WriteRecord};
pub use region::MemoryRegion;

/// Names a region by the node whose log it carries and the division.
///
/// On node `n`, region `(n, d)` is the staging area the local writer frames
/// into; region `(s, d)` for `s != n` mirrors node `s`'s log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId {
    pub source: NodeId,
    pub division: Division,
}

impl RegionId {
    pub const fn new(source: NodeId, division: Division) -> Self {
        Self { source, division }
    }
}

/// A peer region as addressed by one-sided operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDescriptor {
    pub addr: u64,
    pub size: u32,
    pub remote_key: u32,
}

/// Queue pair to one peer for one division.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub peer: NodeId,
    pub division: Division,
}

impl Endpoint {
    pub const fn new(peer: NodeId, division: Division) -> Self {
        Self { peer, division }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Write,
    Read,
}

/// One one-sided operation: `len` bytes between `local_offset` of a local
/// region and `remote_addr` of a peer region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRequest {
    pub opcode: Opcode,
    pub local: RegionId,
    pub local_offset: u32,
    pub len: u32,
    pub remote_addr: u64,
    pub remote_key: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    RemoteAccessError,
    Flushed,
}

impl CompletionStatus {
    #[inline(always)]
    pub fn is_success(self) -> bool {
        self == CompletionStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("node {0} is not reachable on this fabric")]
    UnknownNode(NodeId),
    #[error("no region registered for {0:?}")]
    UnknownRegion(RegionId),
    #[error("no region at {addr:#x} accepts remote key {remote_key:#x}")]
    RemoteAccess { addr: u64, remote_key: u32 },
    #[error("{len} bytes at offset {offset} exceed a region of {size} bytes")]
    OutOfBounds { offset: u64, len: usize, size: u32 },
    #[error("no completion outstanding on {0:?}")]
    NothingOutstanding(Endpoint),
}

/// Transport surface consumed by the replicator and replayers.
pub trait RdmaTransport: Send + Sync {
    /// Node this transport speaks for.
    fn node_id(&self) -> NodeId;

    fn node_count(&self) -> u16;

    fn local_region(&self, id: RegionId) -> Result<Arc<MemoryRegion>, TransportError>;

    fn remote_region(&self, node: NodeId, id: RegionId) -> Result<RegionDescriptor, TransportError>;

    fn post_one_sided(
        &self,
        endpoint: Endpoint,
        request: WorkRequest,
    ) -> Result<(), TransportError>;

    fn wait_completion(&self, endpoint: Endpoint) -> Result<CompletionStatus, TransportError>;
}
