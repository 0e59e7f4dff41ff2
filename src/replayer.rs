//! Replayers: one per (source node, division) pair.
//!
//! A replayer polls its local mirror of the source's log. A frame is taken
//! once its header canary matches its fields, the trailer matches the header,
//! the checksum holds and its proposal is newer than the last one taken.
//! Anything else is an in-flight write and is retried on the next poll.
//!
//! After a frame is handled its header canary is overwritten so the same
//! bytes cannot be taken twice, and the new position is published in the
//! mirror's `LogStat` for the source's writer to resume from.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::division::{Division, NodeId};
use crate::core::metrics::ReplicationMetrics;
use crate::error::{ReplicationError, Result};
use crate::replicator::Replicator;
use crate::transport::{MemoryRegion, RdmaTransport, RegionId};
use crate::wire::{
    align_up, corrupted_canary, decode_frame, HeaderSlot, LogStat, RequestType, LOG_BASE_OFFSET,
};
use crate::worker::{Worker, WorkerControl};

/// What the application did with a replayed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStatus {
    Applied,
    Rejected,
}

pub type ReplayCallback = Arc<dyn Fn(&[u8]) -> ReplayStatus + Send + Sync>;

/// Shared, replaceable replay callback.
#[derive(Clone, Default)]
pub struct ReplayHook(Arc<RwLock<Option<ReplayCallback>>>);

impl ReplayHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, callback: ReplayCallback) {
        *self.0.write() = Some(callback);
    }

    pub fn clear(&self) {
        self.0.write().take();
    }

    /// `None` when no callback is installed.
    pub fn invoke(&self, payload: &[u8]) -> Option<ReplayStatus> {
        let callback = self.0.read().clone()?;
        Some(callback(payload))
    }
}

impl core::fmt::Debug for ReplayHook {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReplayHook")
            .field("installed", &self.0.read().is_some())
            .finish()
    }
}

/// A settled frame found in the mirror.
struct Candidate {
    offset: u32,
    proposal: u32,
    bytes: Vec<u8>,
}

pub struct Replayer {
    node_id: NodeId,
    source: NodeId,
    division: Division,
    mirror: Arc<MemoryRegion>,
    replicator: Arc<Replicator>,
    hook: ReplayHook,
    metrics: Arc<ReplicationMetrics>,
    last: u32,
    next_offset: u32,
}

impl Replayer {
    pub fn new(
        transport: &dyn RdmaTransport,
        source: NodeId,
        division: Division,
        replicator: Arc<Replicator>,
        hook: ReplayHook,
    ) -> Result<Self> {
        let node_id = transport.node_id();
        if source == node_id || source >= transport.node_count() {
            return Err(ReplicationError::InvalidNode(source));
        }
        let mirror = transport.local_region(RegionId::new(source, division))?;
        Ok(Self {
            node_id,
            source,
            division,
            mirror,
            metrics: Arc::clone(replicator.metrics()),
            replicator,
            hook,
            last: 0,
            next_offset: LOG_BASE_OFFSET,
        })
    }

    /// Last proposal taken from this mirror.
    #[inline]
    pub fn last_proposal(&self) -> u32 {
        self.last
    }

    #[inline]
    pub fn next_offset(&self) -> u32 {
        self.next_offset
    }

    /// Validate the frame at `offset` without taking it.
    fn read_frame(&self, offset: u32) -> Result<Option<Candidate>> {
        let size = self.mirror.len() as usize;
        if offset < LOG_BASE_OFFSET || offset as usize + HeaderSlot::SIZE > size {
            return Ok(None);
        }

        let mut head = [0u8; HeaderSlot::SIZE];
        self.mirror.read(offset, &mut head)?;
        let Some(header) = HeaderSlot::from_bytes(&head) else {
            return Ok(None);
        };
        let (canary, proposal) = (header.canary, header.proposal);
        if canary != header.expected_canary() || proposal <= self.last {
            return Ok(None);
        }

        let len = header.frame_len();
        if offset as usize + len > size {
            return Ok(None);
        }
        if self.mirror.read_u32(offset + len as u32 - 4)? != canary {
            return Ok(None);
        }

        let bytes = self.mirror.read_vec(offset, len)?;
        if let Err(e) = decode_frame(&bytes) {
            tracing::trace!(source = self.source, offset, error = %e, "frame not settled");
            return Ok(None);
        }
        Ok(Some(Candidate {
            offset,
            proposal,
            bytes,
        }))
    }

    /// The next frame lands either right after the previous one or, if the
    /// writer wrapped, at the log base. Take the older of the two.
    fn probe(&self) -> Result<Option<Candidate>> {
        let mut best = self.read_frame(self.next_offset)?;
        if self.next_offset != LOG_BASE_OFFSET {
            if let Some(wrapped) = self.read_frame(LOG_BASE_OFFSET)? {
                if best.as_ref().map_or(true, |b| wrapped.proposal < b.proposal) {
                    best = Some(wrapped);
                }
            }
        }
        Ok(best)
    }

    fn replay(&self, payload: &[u8], proposal: u32) {
        match self.hook.invoke(payload) {
            Some(ReplayStatus::Applied) => self.metrics.record_replay(),
            Some(ReplayStatus::Rejected) => {
                tracing::warn!(
                    source = self.source,
                    division = %self.division,
                    proposal,
                    "replay rejected"
                );
            }
            None => {
                tracing::trace!(source = self.source, proposal, "no replay callback installed");
            }
        }
    }

    fn acknowledge(&self, key: &[u8]) -> Result<()> {
        match self
            .replicator
            .submit(&[], key, Some(self.node_id), RequestType::DepCheckAck)
        {
            Ok(_) => {
                self.metrics.record_ack();
                Ok(())
            }
            Err(ReplicationError::Stopped) => {
                tracing::debug!(source = self.source, "node stopping, acknowledgment dropped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn take(&mut self, candidate: Candidate) -> Result<()> {
        let frame = decode_frame(&candidate.bytes)?;
        let owner = frame.owner();

        match frame.request {
            RequestType::DepCheckAck => {
                if self.replicator.release_wait(frame.key_hash()) {
                    tracing::debug!(
                        source = self.source,
                        key_hash = frame.key_hash(),
                        "owner acknowledged"
                    );
                }
            }
            request => {
                self.replay(frame.payload, candidate.proposal);
                if owner == self.node_id {
                    if request == RequestType::DepCheckWait {
                        self.acknowledge(frame.key)?;
                    }
                } else if request == RequestType::Replicate && owner == self.source {
                    // The owner itself wrote the key.
                    self.replicator.release_wait(frame.key_hash());
                }
            }
        }

        let canary = frame.header.canary;
        let canary_at = candidate.offset + HeaderSlot::CANARY_OFFSET as u32;
        self.mirror.write_u32(canary_at, corrupted_canary(canary))?;
        self.last = candidate.proposal;
        self.next_offset = align_up(candidate.offset + candidate.bytes.len() as u32);
        self.mirror
            .publish_log_stat(&LogStat::ready(self.last, self.next_offset))?;
        Ok(())
    }
}

impl Worker for Replayer {
    fn name(&self) -> String {
        format!("replayer-{}-{}-{}", self.node_id, self.source, self.division)
    }

    fn prepare(&mut self, _control: &WorkerControl) -> Result<()> {
        let stat = self.mirror.log_stat()?;
        if stat.is_ready() {
            self.last = stat.proposal;
            self.next_offset = stat.write_offset;
        } else {
            self.mirror.fill(0, LOG_BASE_OFFSET as usize, 0)?;
            self.last = 0;
            self.next_offset = LOG_BASE_OFFSET;
        }
        self.mirror
            .publish_log_stat(&LogStat::ready(self.last, self.next_offset))?;
        tracing::info!(
            source = self.source,
            division = %self.division,
            proposal = self.last,
            offset = self.next_offset,
            "replayer polling"
        );
        Ok(())
    }

    fn poll(&mut self, control: &WorkerControl) -> Result<bool> {
        let mut progressed = false;
        while !control.should_stop() {
            let Some(candidate) = self.probe()? else {
                break;
            };
            self.take(candidate)?;
            progressed = true;
        }
        Ok(progressed)
    }
}
