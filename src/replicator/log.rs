//! Staging and shipping of frames for one division.
//!
//! Frames are encoded into the local staging region `(self, division)` and
//! copied with one-sided writes into every peer's mirror of that region.
//! Before each peer's write the staged headers are rewritten to carry that
//! peer's addresses and resealed.

use std::sync::Arc;

use crate::core::division::{Division, NodeId};
use crate::core::slot::SlotRecord;
use crate::error::{ReplicationError, Result};
use crate::transport::{
    Endpoint, MemoryRegion, Opcode, RdmaTransport, RegionDescriptor, RegionId, WorkRequest,
};
use crate::wire::{
    encode_frame, HeaderSlot, LogCursor, LogStat, RequestType, LOGSTAT_OFFSET,
    RESUME_SCRATCH_OFFSET,
};
use crate::worker::{Backoff, WorkerControl};

/// A frame written to staging and not yet shipped.
#[derive(Debug, Clone, Copy)]
pub struct StagedFrame {
    /// Ring index the frame came from.
    pub slot: u32,
    pub offset: u32,
    pub len: u32,
    pub header: HeaderSlot,
}

impl StagedFrame {
    #[inline(always)]
    pub fn proposal(&self) -> u32 {
        self.header.proposal
    }

    #[inline(always)]
    pub fn end(&self) -> u32 {
        self.offset + self.len
    }
}

struct PeerLog {
    endpoint: Endpoint,
    remote: RegionDescriptor,
}

pub struct LogWriter {
    node_id: NodeId,
    division: Division,
    transport: Arc<dyn RdmaTransport>,
    staging: Arc<MemoryRegion>,
    peers: Vec<PeerLog>,
    cursor: LogCursor,
    proposal: u32,
    scratch: Vec<u8>,
}

impl LogWriter {
    pub fn new(transport: Arc<dyn RdmaTransport>, division: Division) -> Result<Self> {
        let node_id = transport.node_id();
        let region = RegionId::new(node_id, division);
        let staging = transport.local_region(region)?;
        let peers = (0..transport.node_count())
            .filter(|&peer| peer != node_id)
            .map(|peer| -> Result<PeerLog> {
                Ok(PeerLog {
                    endpoint: Endpoint::new(peer, division),
                    remote: transport.remote_region(peer, region)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            node_id,
            division,
            cursor: LogCursor::new(staging.len()),
            transport,
            staging,
            peers,
            proposal: 0,
            scratch: Vec::new(),
        })
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[inline]
    pub fn division(&self) -> Division {
        self.division
    }

    /// Last proposal number handed out.
    #[inline]
    pub fn proposal(&self) -> u32 {
        self.proposal
    }

    #[inline]
    pub fn cursor(&self) -> &LogCursor {
        &self.cursor
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn execute(
        &self,
        peer: &PeerLog,
        opcode: Opcode,
        local_offset: u32,
        len: u32,
        remote_offset: u32,
    ) -> Result<()> {
        self.transport.post_one_sided(
            peer.endpoint,
            WorkRequest {
                opcode,
                local: self.staging.id(),
                local_offset,
                len,
                remote_addr: peer.remote.addr + remote_offset as u64,
                remote_key: peer.remote.remote_key,
            },
        )?;
        let status = self.transport.wait_completion(peer.endpoint)?;
        if !status.is_success() {
            return Err(ReplicationError::Completion {
                division: self.division,
                endpoint: peer.endpoint,
                status,
            });
        }
        Ok(())
    }

    /// Read every peer's published `LogStat` for this log and continue from
    /// the most advanced one. Spins until each peer's reader is ready.
    /// Returns false if the worker was told to stop first.
    pub fn resume(&mut self, control: &WorkerControl) -> Result<bool> {
        let mut best = LogStat::ready(0, self.cursor.offset());
        for peer in &self.peers {
            let mut backoff = Backoff::new();
            let stat = loop {
                if control.should_stop() {
                    return Ok(false);
                }
                self.staging.fill(RESUME_SCRATCH_OFFSET, LogStat::SIZE, 0)?;
                self.execute(
                    peer,
                    Opcode::Read,
                    RESUME_SCRATCH_OFFSET,
                    LogStat::SIZE as u32,
                    LOGSTAT_OFFSET,
                )?;
                let stat = self.staging.read_log_stat_at(RESUME_SCRATCH_OFFSET)?;
                if stat.is_ready() {
                    break stat;
                }
                backoff.snooze();
            };
            let (proposal, offset) = (stat.proposal, stat.write_offset);
            tracing::debug!(
                division = %self.division,
                peer = peer.endpoint.peer,
                proposal,
                offset,
                "peer log position"
            );
            if stat.proposal > best.proposal {
                best = stat;
            }
        }

        self.proposal = best.proposal;
        self.cursor = LogCursor::resume(self.staging.len(), best.write_offset);
        self.staging
            .publish_log_stat(&LogStat::ready(self.proposal, self.cursor.offset()))?;
        tracing::info!(
            division = %self.division,
            proposal = self.proposal,
            offset = self.cursor.offset(),
            "log resumed"
        );
        Ok(true)
    }

    /// Offset the next frame of `body_len` bytes would be staged at.
    #[inline]
    pub fn peek(&self, body_len: u32) -> u32 {
        self.cursor.peek(body_len)
    }

    /// Encode `record` under the next proposal number into staging.
    pub fn stage(
        &mut self,
        slot: u32,
        record: &SlotRecord,
        key_hash: u32,
        request: RequestType,
    ) -> Result<StagedFrame> {
        let mem_size = record.payload.len() as u16;
        let key_size = record.key.len() as u16;
        let offset = self.cursor.reserve(mem_size as u32 + key_size as u32);
        self.proposal = self.proposal.wrapping_add(1);

        let mut header =
            HeaderSlot::new(request, self.proposal, key_hash, mem_size, key_size, record.owner);
        header.mem_addr = self.staging.addr_of(offset + HeaderSlot::SIZE as u32);
        header.key_addr = header.mem_addr + mem_size as u64;

        self.scratch.clear();
        let len = encode_frame(&header, &record.payload, &record.key, &mut self.scratch);
        self.staging.write(offset, &self.scratch)?;

        Ok(StagedFrame {
            slot,
            offset,
            len: len as u32,
            header,
        })
    }

    /// Point a staged header at `base` (a peer's region) and reseal it.
    fn retarget(&self, frame: &StagedFrame, base: u64) -> Result<()> {
        let mut header = frame.header;
        header.mem_addr = base + (frame.offset + HeaderSlot::SIZE as u32) as u64;
        header.key_addr = header.mem_addr + header.mem_size as u64;
        let body = self
            .staging
            .read_vec(frame.offset + HeaderSlot::SIZE as u32, header.body_len())?;
        header.seal(&body);
        self.staging.write(frame.offset, &header.to_bytes())?;
        Ok(())
    }

    /// Ship a contiguous run of staged frames to every peer as one write
    /// each, then publish the local `LogStat`. Returns the bytes written
    /// per peer.
    pub fn ship(&self, frames: &[StagedFrame]) -> Result<u32> {
        let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
            return Ok(0);
        };
        let span = last.end() - first.offset;

        for peer in &self.peers {
            for frame in frames {
                self.retarget(frame, peer.remote.addr)?;
            }
            self.execute(peer, Opcode::Write, first.offset, span, first.offset)?;
        }

        self.staging
            .publish_log_stat(&LogStat::ready(last.proposal(), self.cursor.offset()))?;
        Ok(span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FaultPolicy;
    use crate::transport::LoopbackFabric;
    use crate::wire::{decode_frame, LOG_BASE_OFFSET};

    fn record(payload: &[u8], key: &[u8]) -> SlotRecord {
        SlotRecord {
            payload: payload.to_vec(),
            key: key.to_vec(),
            owner: 0,
        }
    }

    #[test]
    fn test_stage_and_ship_rewrites_addresses() {
        let fabric = LoopbackFabric::new(2, 1024);
        let mut log = LogWriter::new(Arc::new(fabric.port(0)), Division::Writer).unwrap();
        let frame = log.stage(0, &record(b"value", b"key"), 9, RequestType::Replicate).unwrap();
        assert_eq!(frame.offset, LOG_BASE_OFFSET);
        assert_eq!(frame.proposal(), 1);

        let span = log.ship(&[frame]).unwrap();
        assert_eq!(span, frame.len);

        let mirror = fabric.region(1, RegionId::new(0, Division::Writer)).unwrap();
        let bytes = mirror.read_vec(frame.offset, frame.len as usize).unwrap();
        let decoded = decode_frame(&bytes).unwrap();
        assert_eq!(decoded.payload, b"value");
        assert_eq!(decoded.key, b"key");
        assert_eq!(
            { decoded.header.mem_addr },
            mirror.addr_of(frame.offset + HeaderSlot::SIZE as u32)
        );
        assert_eq!({ decoded.header.key_addr }, { decoded.header.mem_addr } + 5);

        let staging = fabric.region(0, RegionId::new(0, Division::Writer)).unwrap();
        let stat = staging.log_stat().unwrap();
        assert!(stat.is_ready());
        assert_eq!({ stat.proposal }, 1);
    }

    #[test]
    fn test_resume_adopts_most_advanced_peer() {
        let fabric = LoopbackFabric::new(3, 1024);
        let id = RegionId::new(0, Division::DepCheck);
        fabric.region(1, id).unwrap().publish_log_stat(&LogStat::ready(4, 320)).unwrap();
        fabric.region(2, id).unwrap().publish_log_stat(&LogStat::ready(9, 512)).unwrap();

        let mut log = LogWriter::new(Arc::new(fabric.port(0)), Division::DepCheck).unwrap();
        let control = WorkerControl::new("resume", FaultPolicy::HaltDivision);
        assert!(log.resume(&control).unwrap());
        assert_eq!(log.proposal(), 9);
        assert_eq!(log.cursor().offset(), 512);

        let frame = log.stage(0, &record(b"x", b"k"), 1, RequestType::Replicate).unwrap();
        assert_eq!(frame.proposal(), 10);
        assert_eq!(frame.offset, 512);
    }

    #[test]
    fn test_resume_gives_up_when_stopped() {
        let fabric = LoopbackFabric::new(2, 1024);
        let mut log = LogWriter::new(Arc::new(fabric.port(0)), Division::Writer).unwrap();
        let control = WorkerControl::new("resume", FaultPolicy::HaltDivision);
        control.cancel_token().cancel();
        assert!(!log.resume(&control).unwrap());
    }

    #[test]
    fn test_failed_write_is_reported() {
        let fabric = LoopbackFabric::new(2, 1024);
        let mut log = LogWriter::new(Arc::new(fabric.port(0)), Division::Writer).unwrap();
        let frame = log.stage(0, &record(b"v", b"k"), 1, RequestType::Replicate).unwrap();
        fabric.fail_next_posts(0, 1);
        assert!(matches!(log.ship(&[frame]), Err(ReplicationError::Completion { .. })));
    }
}
