//! Per-division slot ring.
//!
//! Proposers claim indices in order with a CAS on `next_free`, fill the slot
//! and publish it with `ready`. The division worker consumes slots strictly
//! in index order. Once every index of the ring has been processed and every
//! blocking proposer has collected its result, the worker resets the whole
//! ring (an epoch) and claiming resumes from index 0.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use super::dependency::{Admission, DependencyChecker};
use super::division::{Division, NodeId};
use super::link::NodeIndex;
use super::padded::CachePadded;
use crate::error::{ReplicationError, Result};
use crate::wire::RequestType;
use crate::worker::{Backoff, CancelToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Footprint {
    Empty = 0,
    Inserted = 1,
    Switched = 2,
    Replicated = 3,
}

impl Footprint {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Inserted,
            2 => Self::Switched,
            3 => Self::Replicated,
            _ => Self::Empty,
        }
    }
}

impl From<Admission> for Footprint {
    fn from(a: Admission) -> Self {
        match a {
            Admission::Inserted => Footprint::Inserted,
            Admission::Switched => Footprint::Switched,
        }
    }
}

/// Result of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposeOutcome {
    /// Written to every peer under this proposal number.
    Replicated { division: Division, proposal: u32 },
    /// A newer proposal for the same key replaced this one before it was
    /// written; nothing was sent.
    Superseded { division: Division },
    /// Accepted without waiting (acknowledgments).
    Queued { division: Division },
}

impl ProposeOutcome {
    pub fn division(&self) -> Division {
        match *self {
            ProposeOutcome::Replicated { division, .. }
            | ProposeOutcome::Superseded { division }
            | ProposeOutcome::Queued { division } => division,
        }
    }

    pub fn proposal(&self) -> Option<u32> {
        match *self {
            ProposeOutcome::Replicated { proposal, .. } => Some(proposal),
            _ => None,
        }
    }
}

/// Record body. Written by the claiming proposer before `ready`, read by the
/// worker after it.
#[derive(Debug, Default)]
pub struct SlotRecord {
    pub payload: Vec<u8>,
    pub key: Vec<u8>,
    pub owner: NodeId,
}

pub struct LocalSlot {
    record: UnsafeCell<SlotRecord>,
    key_hash: AtomicU32,
    request: AtomicU8,
    footprint: AtomicU8,
    ready: AtomicBool,
    tracked: AtomicBool,
    superseded: AtomicBool,
    proposal: AtomicU32,
}

// SAFETY: `record` is written only between a successful claim and the
// `ready` release store, and read only after an acquire load of `ready`
// until the epoch reset clears it. The atomics carry that hand-off.
unsafe impl Sync for LocalSlot {}

impl LocalSlot {
    fn new() -> Self {
        Self {
            record: UnsafeCell::new(SlotRecord::default()),
            key_hash: AtomicU32::new(0),
            request: AtomicU8::new(RequestType::Replicate as u8),
            footprint: AtomicU8::new(Footprint::Empty as u8),
            ready: AtomicBool::new(false),
            tracked: AtomicBool::new(false),
            superseded: AtomicBool::new(false),
            proposal: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn footprint(&self) -> Footprint {
        Footprint::from_u8(self.footprint.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn key_hash(&self) -> u32 {
        self.key_hash.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn request(&self) -> RequestType {
        RequestType::from_u8(self.request.load(Ordering::Acquire)).unwrap_or(RequestType::Replicate)
    }

    #[inline]
    pub fn set_request(&self, request: RequestType) {
        self.request.store(request as u8, Ordering::Release);
    }

    /// Whether the slot registered a node with the dependency checker.
    #[inline(always)]
    pub fn is_tracked(&self) -> bool {
        self.tracked.load(Ordering::Acquire)
    }

    /// Borrow the record. Only valid once `is_ready` returned true and until
    /// the ring is reset, which only the caller (the worker) does.
    #[inline]
    pub fn record(&self) -> &SlotRecord {
        debug_assert!(self.is_ready());
        // SAFETY: see the `Sync` impl; the proposer no longer writes after
        // publishing `ready`.
        unsafe { &*self.record.get() }
    }

    fn clear(&self) {
        self.ready.store(false, Ordering::Relaxed);
        self.tracked.store(false, Ordering::Relaxed);
        self.superseded.store(false, Ordering::Relaxed);
        self.proposal.store(0, Ordering::Relaxed);
        self.key_hash.store(0, Ordering::Relaxed);
        self.request.store(RequestType::Replicate as u8, Ordering::Relaxed);
        self.footprint.store(Footprint::Empty as u8, Ordering::Release);
    }
}

/// Everything a proposer supplies for one slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotFill<'a> {
    pub payload: &'a [u8],
    pub key: &'a [u8],
    pub key_hash: u32,
    pub owner: NodeId,
    pub request: RequestType,
}

pub struct SlotRing {
    division: Division,
    lane: u32,
    slots: Box<[CachePadded<LocalSlot>]>,
    next_free: CachePadded<AtomicU32>,
    processed: CachePadded<AtomicU32>,
    released: CachePadded<AtomicU32>,
    epoch: AtomicU64,
    closed: AtomicBool,
}

impl SlotRing {
    pub fn new(division: Division, capacity: u32) -> Self {
        Self {
            division,
            lane: division.index() as u32,
            slots: (0..capacity).map(|_| CachePadded::new(LocalSlot::new())).collect(),
            next_free: CachePadded::new(AtomicU32::new(0)),
            processed: CachePadded::new(AtomicU32::new(0)),
            released: CachePadded::new(AtomicU32::new(0)),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub fn division(&self) -> Division {
        self.division
    }

    #[inline(always)]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    #[inline(always)]
    pub fn slot(&self, index: u32) -> &LocalSlot {
        &self.slots[index as usize]
    }

    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Indices handed out this epoch.
    #[inline]
    pub fn claimed(&self) -> u32 {
        self.next_free.load(Ordering::Acquire).min(self.capacity())
    }

    /// Indices the worker finished this epoch.
    #[inline]
    pub fn processed(&self) -> u32 {
        self.processed.load(Ordering::Acquire)
    }

    /// True when every claimed slot has been processed.
    pub fn is_idle(&self) -> bool {
        self.processed() >= self.claimed()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Claim the next index, spinning while the ring is full.
    pub fn claim(&self) -> Result<u32> {
        let mut backoff = Backoff::new();
        let mut current = self.next_free.load(Ordering::Acquire);
        loop {
            if self.is_closed() {
                return Err(ReplicationError::Stopped);
            }
            if current >= self.capacity() {
                backoff.snooze();
                current = self.next_free.load(Ordering::Acquire);
                continue;
            }
            match self.next_free.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(observed) => current = observed,
            }
        }
    }

    /// Fill a claimed slot, register it with `checker` unless it is an
    /// acknowledgment, and publish it to the worker.
    pub fn publish(
        &self,
        index: u32,
        fill: SlotFill<'_>,
        checker: &DependencyChecker,
    ) -> Footprint {
        let slot = self.slot(index);
        // SAFETY: `index` was returned by `claim` this epoch and `ready` is
        // still false, so no other thread touches the record.
        let record = unsafe { &mut *slot.record.get() };
        record.payload.clear();
        record.payload.extend_from_slice(fill.payload);
        record.key.clear();
        record.key.extend_from_slice(fill.key);
        record.owner = fill.owner;

        slot.key_hash.store(fill.key_hash, Ordering::Relaxed);
        slot.request.store(fill.request as u8, Ordering::Relaxed);

        let footprint = if fill.request == RequestType::DepCheckAck {
            Footprint::Inserted
        } else {
            slot.tracked.store(true, Ordering::Relaxed);
            checker.try_insert(self.node(checker, index), fill.key_hash).into()
        };
        slot.footprint.store(footprint as u8, Ordering::Relaxed);
        slot.ready.store(true, Ordering::Release);
        footprint
    }

    /// Dependency-table node owned by `index`.
    #[inline(always)]
    pub fn node(&self, checker: &DependencyChecker, index: u32) -> NodeIndex {
        checker.node_for(self.lane, index)
    }

    /// Worker side: mark `index` done and wake its proposer.
    pub fn complete(&self, index: u32, proposal: Option<u32>) {
        let slot = self.slot(index);
        slot.superseded.store(proposal.is_none(), Ordering::Relaxed);
        slot.proposal.store(proposal.unwrap_or(0), Ordering::Relaxed);
        slot.footprint.store(Footprint::Replicated as u8, Ordering::Release);
        self.processed.fetch_add(1, Ordering::AcqRel);
    }

    /// Proposer side: this slot needs no further attention from its proposer.
    #[inline]
    pub fn release(&self) {
        self.released.fetch_add(1, Ordering::AcqRel);
    }

    /// Flip the first pending `DepCheckWait` slot for `key_hash` to
    /// `Replicate`. Returns false when nothing was waiting on that key.
    pub fn release_wait(&self, key_hash: u32) -> bool {
        let end = self.claimed();
        for index in self.processed()..end {
            let slot = self.slot(index);
            if !slot.is_ready()
                || slot.footprint() == Footprint::Replicated
                || slot.key_hash() != key_hash
            {
                continue;
            }
            if slot
                .request
                .compare_exchange(
                    RequestType::DepCheckWait as u8,
                    RequestType::Replicate as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Worker side, after the last index is processed: wait for proposers to
    /// collect their results, retire the lane's dependency nodes and reopen
    /// the ring. Returns false if cancelled while waiting.
    pub fn reset_epoch(&self, checker: &DependencyChecker, cancel: &dyn Fn() -> bool) -> bool {
        let mut backoff = Backoff::new();
        while self.released.load(Ordering::Acquire) < self.capacity() {
            if cancel() {
                return false;
            }
            backoff.snooze();
        }

        let nodes: Vec<NodeIndex> = (0..self.capacity())
            .filter(|&i| self.slot(i).is_tracked())
            .map(|i| self.node(checker, i))
            .collect();
        checker.release(&nodes);

        for slot in self.slots.iter() {
            slot.clear();
        }
        self.processed.store(0, Ordering::Release);
        self.released.store(0, Ordering::Release);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.next_free.store(0, Ordering::Release);
        tracing::debug!(division = %self.division, epoch, "slot ring reset");
        true
    }

    /// Reset only if every proposer has already collected its result.
    #[inline]
    pub fn try_reset_epoch(&self, checker: &DependencyChecker) -> bool {
        self.reset_epoch(checker, &|| true)
    }
}

/// Proposer's claim on one published slot. Dropping it, waited on or not,
/// tells the ring the proposer is done with the slot.
pub struct Ticket {
    ring: Arc<SlotRing>,
    index: u32,
}

impl Ticket {
    pub fn new(ring: Arc<SlotRing>, index: u32) -> Self {
        Self { ring, index }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_done(&self) -> bool {
        self.ring.slot(self.index).footprint() == Footprint::Replicated
    }

    /// Spin until the worker completes the slot. Fails with `Stopped` when
    /// the ring is closed first or `cancel` fires.
    pub fn wait_with(self, cancel: Option<&CancelToken>) -> Result<ProposeOutcome> {
        let mut backoff = Backoff::new();
        let slot = self.ring.slot(self.index);
        let division = self.ring.division();
        loop {
            if slot.footprint() == Footprint::Replicated {
                let outcome = if slot.superseded.load(Ordering::Relaxed) {
                    ProposeOutcome::Superseded { division }
                } else {
                    ProposeOutcome::Replicated {
                        division,
                        proposal: slot.proposal.load(Ordering::Relaxed),
                    }
                };
                return Ok(outcome);
            }
            if self.ring.is_closed() || cancel.map_or(false, CancelToken::is_cancelled) {
                return Err(ReplicationError::Stopped);
            }
            backoff.snooze();
        }
    }

    pub fn wait(self) -> Result<ProposeOutcome> {
        self.wait_with(None)
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.ring.release();
    }
}
