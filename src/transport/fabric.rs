//! In-process fabric: every node's regions live in one address space and a
//! post is executed as an immediate copy with its completion queued on the
//! issuing endpoint.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    CompletionStatus, Endpoint, MemoryRegion, Opcode, RdmaTransport, RegionDescriptor, RegionId,
    TransportError, WorkRequest,
};
use crate::core::division::{Division, NodeId};

/// Synthetic address of the first registered region.
const BASE_ADDR: u64 = 0x7f00_0000_0000;

/// Unmapped gap between consecutive regions.
const GUARD_BYTES: u64 = 4096;

const KEY_SEED: u32 = 0x5a00;

/// A completed one-sided write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub from: NodeId,
    pub to: NodeId,
    pub division: Division,
    pub remote_addr: u64,
    pub len: u32,
}

struct NodeSlot {
    /// Indexed by `source * Division::COUNT + division`.
    regions: Vec<Arc<MemoryRegion>>,
    completions: Mutex<HashMap<Endpoint, VecDeque<CompletionStatus>>>,
    pending_faults: AtomicU32,
}

struct FabricInner {
    nodes: Vec<NodeSlot>,
    writes: Mutex<Vec<WriteRecord>>,
}

impl FabricInner {
    fn node(&self, node: NodeId) -> Result<&NodeSlot, TransportError> {
        self.nodes.get(node as usize).ok_or(TransportError::UnknownNode(node))
    }

    fn region(&self, node: NodeId, id: RegionId) -> Result<&Arc<MemoryRegion>, TransportError> {
        let slot = self.node(node)?;
        slot.regions
            .get(id.source as usize * Division::COUNT + id.division.index())
            .ok_or(TransportError::UnknownRegion(id))
    }

    fn resolve(
        &self,
        node: NodeId,
        addr: u64,
        len: u32,
        remote_key: u32,
    ) -> Result<&Arc<MemoryRegion>, TransportError> {
        self.node(node)?
            .regions
            .iter()
            .find(|r| r.remote_key() == remote_key && r.contains(addr, len))
            .ok_or(TransportError::RemoteAccess { addr, remote_key })
    }
}

/// Shared fabric; hand each node its [`FabricPort`].
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

impl LoopbackFabric {
    /// Register `node_count * node_count * 2` regions of `region_size` bytes.
    pub fn new(node_count: u16, region_size: u32) -> Self {
        let stride = region_size as u64 + GUARD_BYTES;
        let mut next = 0u64;
        let nodes = (0..node_count)
            .map(|_| {
                let regions = (0..node_count)
                    .flat_map(|source| Division::ALL.map(|d| RegionId::new(source, d)))
                    .map(|id| {
                        let region = MemoryRegion::new(
                            id,
                            BASE_ADDR + next * stride,
                            KEY_SEED + next as u32,
                            region_size,
                        );
                        next += 1;
                        Arc::new(region)
                    })
                    .collect();
                NodeSlot {
                    regions,
                    completions: Mutex::new(HashMap::new()),
                    pending_faults: AtomicU32::new(0),
                }
            })
            .collect();

        Self {
            inner: Arc::new(FabricInner {
                nodes,
                writes: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn node_count(&self) -> u16 {
        self.inner.nodes.len() as u16
    }

    pub fn port(&self, node: NodeId) -> FabricPort {
        FabricPort {
            node,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Region `id` as registered on `node`.
    pub fn region(&self, node: NodeId, id: RegionId) -> Result<Arc<MemoryRegion>, TransportError> {
        self.inner.region(node, id).cloned()
    }

    /// Every write completed so far, in completion order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.inner.writes.lock().clone()
    }

    pub fn writes_between(&self, from: NodeId, to: NodeId, division: Division) -> Vec<WriteRecord> {
        self.inner
            .writes
            .lock()
            .iter()
            .filter(|w| w.from == from && w.to == to && w.division == division)
            .copied()
            .collect()
    }

    pub fn clear_writes(&self) {
        self.inner.writes.lock().clear();
    }

    /// Fail the next `count` posts issued by `node`. A failed write leaves
    /// the remote side untouched and completes with `RemoteAccessError`.
    pub fn fail_next_posts(&self, node: NodeId, count: u32) {
        if let Some(slot) = self.inner.nodes.get(node as usize) {
            slot.pending_faults.fetch_add(count, Ordering::AcqRel);
        }
    }
}

/// One node's view of a [`LoopbackFabric`].
#[derive(Clone)]
pub struct FabricPort {
    node: NodeId,
    inner: Arc<FabricInner>,
}

impl FabricPort {
    fn take_fault(&self) -> Result<bool, TransportError> {
        let faults = &self.inner.node(self.node)?.pending_faults;
        Ok(faults
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok())
    }

    fn complete(&self, endpoint: Endpoint, status: CompletionStatus) -> Result<(), TransportError> {
        self.inner
            .node(self.node)?
            .completions
            .lock()
            .entry(endpoint)
            .or_default()
            .push_back(status);
        Ok(())
    }

    fn execute(&self, endpoint: Endpoint, request: &WorkRequest) -> Result<(), TransportError> {
        let local = self.inner.region(self.node, request.local)?;
        let remote = self.inner.resolve(
            endpoint.peer,
            request.remote_addr,
            request.len,
            request.remote_key,
        )?;
        let remote_offset = (request.remote_addr - remote.base_addr()) as u32;
        let len = request.len as usize;

        match request.opcode {
            Opcode::Write => {
                let bytes = local.read_vec(request.local_offset, len)?;
                remote.write(remote_offset, &bytes)?;
                self.inner.writes.lock().push(WriteRecord {
                    from: self.node,
                    to: endpoint.peer,
                    division: endpoint.division,
                    remote_addr: request.remote_addr,
                    len: request.len,
                });
            }
            Opcode::Read => {
                let bytes = remote.read_vec(remote_offset, len)?;
                local.write(request.local_offset, &bytes)?;
            }
        }
        Ok(())
    }
}

impl RdmaTransport for FabricPort {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn node_count(&self) -> u16 {
        self.inner.nodes.len() as u16
    }

    fn local_region(&self, id: RegionId) -> Result<Arc<MemoryRegion>, TransportError> {
        self.inner.region(self.node, id).cloned()
    }

    fn remote_region(
        &self,
        node: NodeId,
        id: RegionId,
    ) -> Result<RegionDescriptor, TransportError> {
        Ok(self.inner.region(node, id)?.descriptor())
    }

    fn post_one_sided(
        &self,
        endpoint: Endpoint,
        request: WorkRequest,
    ) -> Result<(), TransportError> {
        if endpoint.peer == self.node {
            return Err(TransportError::UnknownNode(endpoint.peer));
        }
        self.inner.node(endpoint.peer)?;

        if self.take_fault()? {
            return self.complete(endpoint, CompletionStatus::RemoteAccessError);
        }

        let status = match self.execute(endpoint, &request) {
            Ok(()) => CompletionStatus::Success,
            Err(TransportError::RemoteAccess { .. }) | Err(TransportError::OutOfBounds { .. }) => {
                CompletionStatus::RemoteAccessError
            }
            Err(e) => return Err(e),
        };
        self.complete(endpoint, status)
    }

    fn wait_completion(&self, endpoint: Endpoint) -> Result<CompletionStatus, TransportError> {
        self.inner
            .node(self.node)?
            .completions
            .lock()
            .get_mut(&endpoint)
            .and_then(VecDeque::pop_front)
            .ok_or(TransportError::NothingOutstanding(endpoint))
    }
}
