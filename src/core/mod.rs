//! Lock-free building blocks: marked links, the sentinel-headed list, the
//! hash table and dependency checker built on it, and the slot rings.

pub mod dependency;
pub mod division;
pub mod hashtable;
pub mod link;
pub mod list;
pub mod metrics;
pub mod padded;
pub mod slot;

pub use dependency::{Admission, DependencyChecker};
pub use division::{Division, NodeId};
pub use hashtable::{hash_key, murmur3_32, LockFreeHashTable};
pub use link::{AtomicLink, Link, NodeIndex};
pub use list::{MarkedList, SearchResult};
pub use metrics::{LatencyHistogram, MetricsSnapshot, ReplicationMetrics};
pub use padded::CachePadded;
pub use slot::{Footprint, LocalSlot, ProposeOutcome, SlotFill, SlotRecord, SlotRing, Ticket};
