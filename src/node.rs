//! Node context.
//!
//! One [`Node`] owns everything a cluster member runs: the replicator with
//! its slot rings and dependency checker, a replayer per (peer, division),
//! one worker per division, and the replay hook. There is no process-wide
//! state; several nodes can share a process, which is how the loopback
//! fabric tests run whole clusters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::{ConfigError, NodeConfig};
use crate::core::dependency::DependencyChecker;
use crate::core::division::{Division, NodeId};
use crate::core::metrics::{MetricsSnapshot, ReplicationMetrics};
use crate::core::slot::ProposeOutcome;
use crate::error::{ReplicationError, Result};
use crate::replayer::{ReplayHook, ReplayStatus, Replayer};
use crate::replicator::{DepCheckWorker, Replicator, Submission, WriterWorker};
use crate::transport::{RdmaTransport, RegionId};
use crate::wire::RequestType;
use crate::worker::{Backoff, WorkerId, WorkerPool, WorkerSignal};

pub struct Node {
    config: NodeConfig,
    replicator: Arc<Replicator>,
    hook: ReplayHook,
    metrics: Arc<ReplicationMetrics>,
    pool: Mutex<WorkerPool>,
    divisions: [WorkerId; Division::COUNT],
    replayers: Vec<WorkerId>,
    accepting: AtomicBool,
    stopped: AtomicBool,
}

impl Node {
    /// Validate `config`, launch every replayer (each waits until it is
    /// polling) and both division workers. Division workers finish their
    /// startup in the background once every peer's replayers are up; use
    /// [`Node::wait_ready`] to block on that.
    pub fn start(config: NodeConfig, transport: Arc<dyn RdmaTransport>) -> Result<Self> {
        config.validate()?;
        if transport.node_id() != config.node_id || transport.node_count() != config.node_count {
            return Err(ReplicationError::InvalidNode(transport.node_id()));
        }
        let registered = transport
            .local_region(RegionId::new(config.node_id, Division::Writer))?
            .len();
        if registered != config.region_size {
            return Err(ConfigError::RegionMismatch {
                configured: config.region_size,
                registered,
            }
            .into());
        }

        let metrics = Arc::new(ReplicationMetrics::new());
        let replicator = Arc::new(Replicator::new(&config, Arc::clone(&metrics)));
        let hook = ReplayHook::new();
        let mut pool = WorkerPool::new(config.max_workers, config.fault_policy);

        let mut replayers = Vec::with_capacity(config.required_workers() - Division::COUNT);
        for source in (0..config.node_count).filter(|&s| s != config.node_id) {
            for division in Division::ALL {
                let replayer = Replayer::new(
                    transport.as_ref(),
                    source,
                    division,
                    Arc::clone(&replicator),
                    hook.clone(),
                )?;
                replayers.push(pool.launch(replayer)?);
            }
        }

        let writer = WriterWorker::new(
            &config,
            Arc::clone(&transport),
            Arc::clone(replicator.ring(Division::Writer)),
            Arc::clone(replicator.checker()),
            Arc::clone(&metrics),
        )?;
        let depcheck = DepCheckWorker::new(
            Arc::clone(&transport),
            Arc::clone(replicator.ring(Division::DepCheck)),
            Arc::clone(replicator.checker()),
            Arc::clone(&metrics),
        )?;
        let divisions = [pool.launch_detached(writer)?, pool.launch_detached(depcheck)?];

        tracing::info!(
            node = config.node_id,
            nodes = config.node_count,
            replayers = replayers.len(),
            "node started"
        );

        Ok(Self {
            config,
            replicator,
            hook,
            metrics,
            pool: Mutex::new(pool),
            divisions,
            replayers,
            accepting: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    #[inline]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Key hash used for routing and dependency tracking.
    #[inline]
    pub fn hash(key: &[u8]) -> u32 {
        DependencyChecker::hash(key)
    }

    /// Default owner of `key`.
    pub fn owner_of(&self, key: &[u8]) -> NodeId {
        self.replicator.owner_of(Self::hash(key))
    }

    pub fn set_replay_callback<F>(&self, callback: F)
    where
        F: Fn(&[u8]) -> ReplayStatus + Send + Sync + 'static,
    {
        self.hook.set(Arc::new(callback));
    }

    pub fn clear_replay_callback(&self) {
        self.hook.clear();
    }

    /// Block until both division workers have finished startup.
    pub fn wait_ready(&self) -> Result<()> {
        let controls: Vec<_> = {
            let pool = self.pool.lock();
            self.divisions.iter().filter_map(|&id| pool.control(id)).collect()
        };
        for control in controls {
            let signal =
                control.wait_for(|s| !matches!(s, WorkerSignal::Pause | WorkerSignal::Ready));
            if signal == WorkerSignal::Faulted {
                return Err(ReplicationError::WorkerFaulted {
                    name: control.name().to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_accepting(&self) -> Result<()> {
        if self.accepting.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ReplicationError::Stopped)
        }
    }

    /// Publish a proposal without waiting for it.
    pub fn submit(
        &self,
        payload: &[u8],
        key: &[u8],
        owner_hint: Option<NodeId>,
        request: RequestType,
    ) -> Result<Submission> {
        self.check_accepting()?;
        self.replicator.submit(payload, key, owner_hint, request)
    }

    /// Replicate `payload` under `key` and block until every peer holds it,
    /// the owner acknowledged it (when the owner is a peer), or a newer
    /// proposal for the key superseded it.
    pub fn propose(
        &self,
        payload: &[u8],
        key: &[u8],
        owner_hint: Option<NodeId>,
        request: RequestType,
    ) -> Result<ProposeOutcome> {
        self.check_accepting()?;
        self.replicator.propose(payload, key, owner_hint, request)
    }

    /// `propose` with the default owner.
    pub fn replicate(&self, payload: &[u8], key: &[u8]) -> Result<ProposeOutcome> {
        self.propose(payload, key, None, RequestType::Replicate)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn division_signal(&self, division: Division) -> Option<WorkerSignal> {
        self.pool
            .lock()
            .control(self.divisions[division.index()])
            .map(|c| c.signal())
    }

    /// Hold a division worker between polls.
    pub fn pause_division(&self, division: Division) -> bool {
        self.pool.lock().pause(self.divisions[division.index()])
    }

    pub fn resume_division(&self, division: Division) -> bool {
        self.pool.lock().resume(self.divisions[division.index()])
    }

    pub fn replayer_count(&self) -> usize {
        self.replayers.len()
    }

    /// Refuse new proposals, let queued ones drain for up to
    /// `drain_timeout`, then fail whatever is still waiting and stop every
    /// worker. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.accepting.store(false, Ordering::Release);

        let deadline = Instant::now() + self.config.drain_timeout();
        let mut backoff = Backoff::new();
        while !self.replicator.is_idle() && Instant::now() < deadline {
            backoff.snooze();
        }
        let drained = self.replicator.is_idle();

        self.replicator.close();
        self.pool.lock().terminate_all();
        tracing::info!(node = self.config.node_id, drained, "node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}
