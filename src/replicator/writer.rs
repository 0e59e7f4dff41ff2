//! Writer division: records this node owns.
//!
//! Slots are staged in ring order and shipped in batches of up to
//! `batch_size` frames, one write per peer per batch. A batch is flushed
//! when it is full, before a frame that would wrap the log, at the last
//! index of the ring, or when no slot is ready and the flush deadline has
//! passed since the batch was opened.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;

use super::log::{LogWriter, StagedFrame};
use crate::config::{NodeConfig, MAX_BATCH};
use crate::core::dependency::DependencyChecker;
use crate::core::division::Division;
use crate::core::metrics::ReplicationMetrics;
use crate::core::slot::SlotRing;
use crate::error::Result;
use crate::transport::RdmaTransport;
use crate::worker::{Worker, WorkerControl};

pub struct WriterWorker {
    log: LogWriter,
    ring: Arc<SlotRing>,
    checker: Arc<DependencyChecker>,
    metrics: Arc<ReplicationMetrics>,
    batch: ArrayVec<StagedFrame, MAX_BATCH>,
    batch_size: usize,
    deadline: Duration,
    opened: Option<Instant>,
    next_index: u32,
}

impl WriterWorker {
    pub fn new(
        config: &NodeConfig,
        transport: Arc<dyn RdmaTransport>,
        ring: Arc<SlotRing>,
        checker: Arc<DependencyChecker>,
        metrics: Arc<ReplicationMetrics>,
    ) -> Result<Self> {
        debug_assert_eq!(ring.division(), Division::Writer);
        Ok(Self {
            log: LogWriter::new(transport, Division::Writer)?,
            ring,
            checker,
            metrics,
            batch: ArrayVec::new(),
            batch_size: config.batch_size.clamp(1, MAX_BATCH),
            deadline: config.flush_deadline(),
            opened: None,
            next_index: 0,
        })
    }

    fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let span = self.log.ship(&self.batch)?;

        for frame in &self.batch {
            if self.ring.slot(frame.slot).is_tracked() {
                self.checker.delete(self.ring.node(&self.checker, frame.slot));
            }
            self.ring.complete(frame.slot, Some(frame.proposal()));
        }

        let frames = self.batch.len() as u64;
        self.metrics.record_batch(
            frames,
            span as u64 * self.log.peer_count() as u64,
            started.elapsed().as_nanos() as u64,
        );
        tracing::trace!(frames, span, proposal = self.log.proposal(), "writer batch flushed");
        self.batch.clear();
        self.opened = None;
        Ok(())
    }

    fn deadline_passed(&self) -> bool {
        self.opened.map_or(false, |t| t.elapsed() >= self.deadline)
    }

    fn drain(&mut self, control: &WorkerControl) -> Result<bool> {
        let ring = Arc::clone(&self.ring);
        let mut progressed = false;

        while !control.should_stop() {
            if self.next_index == ring.capacity() {
                self.flush()?;
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
            self.next_index += 1;
            progressed = true;

            if slot.is_tracked() && self.checker.is_superseded(ring.node(&self.checker, index)) {
                ring.complete(index, None);
                self.metrics.record_superseded();
                continue;
            }

            let record = slot.record();
            let body_len = (record.payload.len() + record.key.len()) as u32;
            if let Some(last) = self.batch.last() {
                if self.log.peek(body_len) < last.end() {
                    self.flush()?;
                }
            }

            let frame = self.log.stage(index, record, slot.key_hash(), slot.request())?;
            if self.batch.is_empty() {
                self.opened = Some(Instant::now());
            }
            self.batch.push(frame);

            if self.batch.len() >= self.batch_size || index + 1 == ring.capacity() {
                self.flush()?;
            }
        }

        if !self.batch.is_empty() && self.deadline_passed() {
            self.flush()?;
            progressed = true;
        }
        Ok(progressed)
    }
}

impl Worker for WriterWorker {
    fn name(&self) -> String {
        format!("writer-{}", self.log.node_id())
    }

    fn prepare(&mut self, control: &WorkerControl) -> Result<()> {
        self.log.resume(control)?;
        Ok(())
    }

    fn poll(&mut self, control: &WorkerControl) -> Result<bool> {
        let result = self.drain(control);
        if result.is_err() {
            // Nothing will complete these slots any more.
            self.ring.close();
        }
        result
    }
}
