//! Dependency-check division: records owned by a peer.
//!
//! Each record is written on its own. When the owner is another node the
//! frame goes out as `DepCheckWait` and the worker holds the slot until the
//! owner's acknowledgment flips its request back to `Replicate` through
//! [`super::Replicator::release_wait`]. Only then does the proposer return.

use std::sync::Arc;

use super::log::LogWriter;
use crate::core::dependency::DependencyChecker;
use crate::core::division::Division;
use crate::core::metrics::ReplicationMetrics;
use crate::core::slot::{LocalSlot, SlotRing};
use crate::error::Result;
use crate::transport::RdmaTransport;
use crate::wire::RequestType;
use crate::worker::{Backoff, Worker, WorkerControl};

pub struct DepCheckWorker {
    log: LogWriter,
    ring: Arc<SlotRing>,
    checker: Arc<DependencyChecker>,
    metrics: Arc<ReplicationMetrics>,
    next_index: u32,
}

impl DepCheckWorker {
    pub fn new(
        transport: Arc<dyn RdmaTransport>,
        ring: Arc<SlotRing>,
        checker: Arc<DependencyChecker>,
        metrics: Arc<ReplicationMetrics>,
    ) -> Result<Self> {
        debug_assert_eq!(ring.division(), Division::DepCheck);
        Ok(Self {
            log: LogWriter::new(transport, Division::DepCheck)?,
            ring,
            checker,
            metrics,
            next_index: 0,
        })
    }

    /// Spin until the slot's request leaves `DepCheckWait`. False if the
    /// worker is stopping.
    fn await_release(slot: &LocalSlot, control: &WorkerControl) -> bool {
        let mut backoff = Backoff::new();
        while slot.request() == RequestType::DepCheckWait {
            if control.should_stop() {
                return false;
            }
            backoff.snooze();
        }
        true
    }

    fn drain(&mut self, control: &WorkerControl) -> Result<bool> {
        let ring = Arc::clone(&self.ring);
        let mut progressed = false;

        while !control.should_stop() {
            if self.next_index == ring.capacity() {
                if !ring.try_reset_epoch(&self.checker) {
                    return Ok(progressed);
                }
                self.metrics.record_epoch_reset();
                self.next_index = 0;
                progressed = true;
                continue;
            }

            let index = self.next_index;
            let slot = ring.slot(index);
            if !slot.is_ready() {
                break;
            }
            let node = ring.node(&self.checker, index);

            if slot.is_tracked() && self.checker.is_superseded(node) {
                ring.complete(index, None);
                self.metrics.record_superseded();
                self.next_index += 1;
                progressed = true;
                continue;
            }

            let record = slot.record();
            let waits =
                record.owner != self.log.node_id() && slot.request() == RequestType::Replicate;
            if waits {
                slot.set_request(RequestType::DepCheckWait);
            }

            let frame = self.log.stage(index, record, slot.key_hash(), slot.request())?;
            self.log.ship(&[frame])?;
            self.metrics.record_batch(1, frame.len as u64 * self.log.peer_count() as u64, 0);

            if waits {
                tracing::trace!(
                    owner = record.owner,
                    key_hash = slot.key_hash(),
                    "waiting for owner ack"
                );
                if !Self::await_release(slot, control) {
                    // Abandoned; the stopping node fails the proposer.
                    return Ok(progressed);
                }
            }

            if slot.is_tracked() {
                self.checker.delete(node);
            }
            ring.complete(index, Some(frame.proposal()));
            self.next_index += 1;
            progressed = true;
        }
        Ok(progressed)
    }
}

impl Worker for DepCheckWorker {
    fn name(&self) -> String {
        format!("depcheck-{}", self.log.node_id())
    }

    fn prepare(&mut self, control: &WorkerControl) -> Result<()> {
        self.log.resume(control)?;
        Ok(())
    }

    fn poll(&mut self, control: &WorkerControl) -> Result<bool> {
        let result = self.drain(control);
        if result.is_err() {
            self.ring.close();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FaultPolicy;
    use crate::core::slot::{ProposeOutcome, SlotFill, Ticket};
    use crate::transport::{LoopbackFabric, RegionId};
    use crate::wire::{decode_frame, LogStat, LOG_BASE_OFFSET};

    fn worker(fabric: &LoopbackFabric) -> (DepCheckWorker, Arc<SlotRing>, Arc<DependencyChecker>) {
        fabric
            .region(1, RegionId::new(0, Division::DepCheck))
            .unwrap()
            .publish_log_stat(&LogStat::ready(0, LOG_BASE_OFFSET))
            .unwrap();
        let ring = Arc::new(SlotRing::new(Division::DepCheck, 8));
        let checker = Arc::new(DependencyChecker::new(16, 2, 8));
        let mut w = DepCheckWorker::new(
            Arc::new(fabric.port(0)),
            Arc::clone(&ring),
            Arc::clone(&checker),
            Arc::new(ReplicationMetrics::new()),
        )
        .unwrap();
        w.prepare(&WorkerControl::new("depcheck-test", FaultPolicy::HaltDivision)).unwrap();
        (w, ring, checker)
    }

    fn publish(ring: &SlotRing, checker: &DependencyChecker, owner: u16) -> u32 {
        let index = ring.claim().unwrap();
        ring.publish(
            index,
            SlotFill {
                payload: b"v",
                key: b"k",
                key_hash: DependencyChecker::hash(b"k"),
                owner,
                request: RequestType::Replicate,
            },
            checker,
        );
        index
    }

    #[test]
    fn test_wait_frame_blocks_until_released() {
        let fabric = LoopbackFabric::new(2, 4096);
        let (mut w, ring, checker) = worker(&fabric);
        let index = publish(&ring, &checker, 1);

        let releaser = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                while !ring.release_wait(DependencyChecker::hash(b"k")) {
                    std::thread::yield_now();
                }
            })
        };

        let control = WorkerControl::new("depcheck-test", FaultPolicy::HaltDivision);
        assert!(w.poll(&control).unwrap());
        releaser.join().unwrap();

        let mirror = fabric.region(1, RegionId::new(0, Division::DepCheck)).unwrap();
        let bytes = mirror.read_vec(LOG_BASE_OFFSET, 64).unwrap();
        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(frame.request, RequestType::DepCheckWait);
        assert_eq!(frame.owner(), 1);

        let outcome = Ticket::new(Arc::clone(&ring), index).wait().unwrap();
        assert_eq!(
            outcome,
            ProposeOutcome::Replicated { division: Division::DepCheck, proposal: 1 }
        );
    }

    #[test]
    fn test_stop_abandons_wait() {
        let fabric = LoopbackFabric::new(2, 4096);
        let (mut w, ring, checker) = worker(&fabric);
        let index = publish(&ring, &checker, 1);

        let control = Arc::new(WorkerControl::new("depcheck-test", FaultPolicy::HaltDivision));
        let canceller = {
            let control = Arc::clone(&control);
            let fabric = fabric.clone();
            std::thread::spawn(move || {
                while fabric.writes().is_empty() {
                    std::thread::yield_now();
                }
                control.cancel_token().cancel();
            })
        };
        assert!(!w.poll(&control).unwrap());
        canceller.join().unwrap();
        assert!(!Ticket::new(Arc::clone(&ring), index).is_done());
    }

    #[test]
    fn test_self_owned_record_does_not_wait() {
        let fabric = LoopbackFabric::new(2, 4096);
        let (mut w, ring, checker) = worker(&fabric);
        let index = publish(&ring, &checker, 0);
        let control = WorkerControl::new("depcheck-test", FaultPolicy::HaltDivision);
        assert!(w.poll(&control).unwrap());
        assert!(Ticket::new(Arc::clone(&ring), index).is_done());
    }
}
