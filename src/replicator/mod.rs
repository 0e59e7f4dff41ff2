//! Proposal intake and the two replication divisions.
//!
//! A proposal is routed by its owner: records this node owns go to the
//! writer division, which batches them. Records owned by a peer go to the
//! dependency-check division, which writes them one at a time and holds
//! each until the owner acknowledges it.

pub mod depcheck;
pub mod log;
pub mod writer;

use std::sync::Arc;
use std::time::Instant;

use crate::config::NodeConfig;
use crate::core::dependency::DependencyChecker;
use crate::core::division::{Division, NodeId};
use crate::core::metrics::ReplicationMetrics;
use crate::core::slot::{Footprint, ProposeOutcome, SlotFill, SlotRing, Ticket};
use crate::error::{ReplicationError, Result};
use crate::wire::RequestType;

pub use depcheck::DepCheckWorker;
pub use log::{LogWriter, StagedFrame};
pub use writer::WriterWorker;

/// A published proposal.
pub enum Submission {
    /// The proposer waits on the ticket for the write to complete.
    Pending(Ticket),
    /// Nobody waits; the worker completes it in the background.
    Queued(Division),
}

pub struct Replicator {
    node_id: NodeId,
    node_count: u16,
    max_body_len: usize,
    checker: Arc<DependencyChecker>,
    rings: [Arc<SlotRing>; Division::COUNT],
    metrics: Arc<ReplicationMetrics>,
}

impl Replicator {
    pub fn new(config: &NodeConfig, metrics: Arc<ReplicationMetrics>) -> Self {
        let checker = DependencyChecker::new(
            config.hash_buckets,
            Division::COUNT as u32,
            config.slots_per_ring,
        );
        Self {
            node_id: config.node_id,
            node_count: config.node_count,
            max_body_len: config.max_body_len() as usize,
            checker: Arc::new(checker),
            rings: Division::ALL.map(|d| Arc::new(SlotRing::new(d, config.slots_per_ring))),
            metrics,
        }
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[inline]
    pub fn ring(&self, division: Division) -> &Arc<SlotRing> {
        &self.rings[division.index()]
    }

    #[inline]
    pub fn checker(&self) -> &Arc<DependencyChecker> {
        &self.checker
    }

    #[inline]
    pub fn metrics(&self) -> &Arc<ReplicationMetrics> {
        &self.metrics
    }

    /// Default owner of a key: its hash modulo the cluster size.
    #[inline]
    pub fn owner_of(&self, key_hash: u32) -> NodeId {
        (key_hash % self.node_count as u32) as NodeId
    }

    #[inline]
    pub fn route(&self, owner: NodeId) -> Division {
        if owner == self.node_id {
            Division::Writer
        } else {
            Division::DepCheck
        }
    }

    fn check_sizes(&self, payload: &[u8], key: &[u8]) -> Result<()> {
        let max = u16::MAX as usize;
        if payload.len() > max {
            return Err(ReplicationError::PayloadTooLarge { len: payload.len(), max });
        }
        if key.len() > max {
            return Err(ReplicationError::KeyTooLarge { len: key.len(), max });
        }
        let body = payload.len() + key.len();
        if body > self.max_body_len {
            return Err(ReplicationError::FrameTooLarge {
                len: body,
                max: self.max_body_len,
            });
        }
        Ok(())
    }

    /// Claim, fill and publish a slot. Acknowledgments are released on the
    /// spot and come back as `Queued`.
    pub fn submit(
        &self,
        payload: &[u8],
        key: &[u8],
        owner_hint: Option<NodeId>,
        request: RequestType,
    ) -> Result<Submission> {
        self.check_sizes(payload, key)?;
        let key_hash = DependencyChecker::hash(key);
        let owner = match owner_hint {
            Some(node) if node >= self.node_count => {
                return Err(ReplicationError::InvalidNode(node));
            }
            Some(node) => node,
            None => self.owner_of(key_hash),
        };
        let division = self.route(owner);
        let ring = self.ring(division);

        let index = ring.claim()?;
        let footprint = ring.publish(
            index,
            SlotFill {
                payload,
                key,
                key_hash,
                owner,
                request,
            },
            &self.checker,
        );
        tracing::trace!(%division, index, key_hash, owner, ?footprint, "slot published");
        if footprint == Footprint::Switched {
            tracing::debug!(%division, key_hash, "proposal superseded an in-flight one");
        }

        if request == RequestType::DepCheckAck {
            ring.release();
            return Ok(Submission::Queued(division));
        }
        Ok(Submission::Pending(Ticket::new(Arc::clone(ring), index)))
    }

    /// Submit and block until the record is written to every peer, or
    /// superseded. Acknowledgments return immediately.
    pub fn propose(
        &self,
        payload: &[u8],
        key: &[u8],
        owner_hint: Option<NodeId>,
        request: RequestType,
    ) -> Result<ProposeOutcome> {
        let started = Instant::now();
        let outcome = match self.submit(payload, key, owner_hint, request)? {
            Submission::Pending(ticket) => ticket.wait()?,
            Submission::Queued(division) => return Ok(ProposeOutcome::Queued { division }),
        };
        self.metrics.record_proposal(started.elapsed().as_nanos() as u64);
        Ok(outcome)
    }

    /// Release the dependency-check slot waiting on `key_hash`, if any.
    pub fn release_wait(&self, key_hash: u32) -> bool {
        let released = self.ring(Division::DepCheck).release_wait(key_hash);
        if released {
            self.metrics.record_wait_released();
        }
        released
    }

    /// True when every claimed slot in both divisions has been processed.
    pub fn is_idle(&self) -> bool {
        self.rings.iter().all(|r| r.is_idle())
    }

    /// Refuse further claims and fail every waiting ticket.
    pub fn close(&self) {
        for ring in &self.rings {
            ring.close();
        }
    }
}
