//! Node configuration.
//!
//! Loaded from TOML (every field optional) or built in code from
//! [`NodeConfig::default`]. `validate` runs before any region or worker is
//! touched.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::division::{Division, NodeId};
use crate::wire::{max_body_len, LOG_BASE_OFFSET};

/// Upper bound for `batch_size`; sizes the writer's fixed batch buffer.
pub const MAX_BATCH: usize = 32;

/// Offsets plus a frame size stay below `u32::MAX` up to this region size.
pub const MAX_REGION_SIZE: u32 = i32::MAX as u32;

/// Upper bound for `slots_per_ring` and `hash_buckets`; keeps the shared node
/// arena addressable by `u32`.
pub const MAX_SLOTS_PER_RING: u32 = 1 << 16;
pub const MAX_HASH_BUCKETS: u32 = 1 << 24;

/// Early-flush deadline per batched frame.
pub const FLUSH_DEADLINE_PER_FRAME_NS: u64 = 10_000;

/// What a division does after a failed post or a bad completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Log and abort the process.
    #[default]
    Abort,
    /// Log, mark the worker faulted and stop only that worker.
    HaltDivision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's id, `< node_count`.
    pub node_id: NodeId,
    pub node_count: u16,
    /// Bytes per registered region, control area included.
    pub region_size: u32,
    /// Slot ring capacity per division; one epoch is this many proposals.
    pub slots_per_ring: u32,
    pub hash_buckets: u32,
    /// Frames per batched write in the writer division.
    pub batch_size: usize,
    /// Early-flush deadline in nanoseconds. Defaults to
    /// `10_000 * batch_size` when unset.
    pub flush_deadline_ns: Option<u64>,
    /// Worker handle capacity.
    pub max_workers: usize,
    pub fault_policy: FaultPolicy,
    /// How long `stop` waits for queued proposals before terminating workers.
    pub drain_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            node_count: 3,
            region_size: 1 << 20,
            slots_per_ring: 512,
            hash_buckets: 1024,
            batch_size: 4,
            flush_deadline_ns: None,
            max_workers: 8,
            fault_policy: FaultPolicy::Abort,
            drain_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("node id {node_id} is outside a cluster of {node_count}")]
    NodeOutOfRange { node_id: NodeId, node_count: u16 },
    #[error("region size {region_size} must be within [{min}, {max}]")]
    RegionSize { region_size: u32, min: u32, max: u32 },
    #[error("batch size {0} must be within [1, {max}]", max = MAX_BATCH)]
    BatchSize(usize),
    #[error("slot ring size {0} must be within [2, {max}]", max = MAX_SLOTS_PER_RING)]
    SlotsPerRing(u32),
    #[error("hash bucket count {0} must be within [1, {max}]", max = MAX_HASH_BUCKETS)]
    HashBuckets(u32),
    #[error("configured region size {configured} does not match the registered {registered}")]
    RegionMismatch { configured: u32, registered: u32 },
    #[error("{needed} workers are needed but only {max} handles are configured")]
    WorkerCapacity { needed: usize, max: usize },
}

impl NodeConfig {
    /// Default configuration for `node_id` in a cluster of `node_count`.
    pub fn for_node(node_id: NodeId, node_count: u16) -> Self {
        let mut config = Self {
            node_id,
            node_count,
            ..Self::default()
        };
        config.max_workers = config.max_workers.max(config.required_workers());
        config
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(
            path = %path.as_ref().display(),
            node = config.node_id,
            "loaded node config"
        );
        Ok(config)
    }

    /// One worker per division plus one replayer per (peer, division).
    pub fn required_workers(&self) -> usize {
        Division::COUNT + Division::COUNT * (self.node_count as usize).saturating_sub(1)
    }

    pub fn flush_deadline(&self) -> Duration {
        Duration::from_nanos(
            self.flush_deadline_ns
                .unwrap_or(FLUSH_DEADLINE_PER_FRAME_NS * self.batch_size as u64),
        )
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Largest `payload + key` a single frame can carry in this configuration.
    pub fn max_body_len(&self) -> u32 {
        max_body_len(self.region_size).min(2 * u16::MAX as u32)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_count == 0 || self.node_id >= self.node_count {
            return Err(ConfigError::NodeOutOfRange {
                node_id: self.node_id,
                node_count: self.node_count,
            });
        }

        let min = LOG_BASE_OFFSET + crate::wire::FRAME_ALIGN;
        let max = MAX_REGION_SIZE;
        if self.region_size < min || self.region_size > max {
            return Err(ConfigError::RegionSize {
                region_size: self.region_size,
                min,
                max,
            });
        }

        if self.batch_size == 0 || self.batch_size > MAX_BATCH {
            return Err(ConfigError::BatchSize(self.batch_size));
        }
        if !(2..=MAX_SLOTS_PER_RING).contains(&self.slots_per_ring) {
            return Err(ConfigError::SlotsPerRing(self.slots_per_ring));
        }
        if !(1..=MAX_HASH_BUCKETS).contains(&self.hash_buckets) {
            return Err(ConfigError::HashBuckets(self.hash_buckets));
        }

        let needed = self.required_workers();
        if self.max_workers < needed {
            return Err(ConfigError::WorkerCapacity {
                needed,
                max: self.max_workers,
            });
        }
        Ok(())
    }
}
