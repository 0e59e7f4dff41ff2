//! Crate-level error type.

use crate::config::ConfigError;
use crate::core::division::{Division, NodeId};
use crate::transport::{CompletionStatus, Endpoint, TransportError};
use crate::wire::FrameError;

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("{division} completion on {endpoint:?} failed with {status:?}")]
    Completion {
        division: Division,
        endpoint: Endpoint,
        status: CompletionStatus,
    },
    #[error("payload of {len} bytes exceeds {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("key of {len} bytes exceeds {max}")]
    KeyTooLarge { len: usize, max: usize },
    #[error("frame body of {len} bytes does not fit a region log of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("node {0} is not part of the cluster")]
    InvalidNode(NodeId),
    #[error("node is stopped")]
    Stopped,
    #[error("worker {name} faulted during startup")]
    WorkerFaulted { name: String },
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T, E = ReplicationError> = core::result::Result<T, E>;
