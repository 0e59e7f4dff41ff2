//! Per-key dependency tracking over [`LockFreeHashTable`].
//!
//! Every ring slot of every lane owns one table node. A proposal registers
//! its node under the key hash; a second proposal for the same key while the
//! first is still tracked switches the old node out, which is how the writer
//! learns the older proposal was superseded.
//!
//! Every traversal of the table runs under a `crossbeam_epoch` pin. A drained
//! lane's nodes are only reset once every pin taken before they were unlinked
//! has been dropped, so no search can still be walking through a node when it
//! is handed out again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_epoch as epoch;
use parking_lot::Mutex;

use super::hashtable::{hash_key, LockFreeHashTable};
use super::link::NodeIndex;
use crate::worker::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No live node had this key.
    Inserted,
    /// A live node with this key was replaced.
    Switched,
}

pub struct DependencyChecker {
    table: LockFreeHashTable,
    lanes: u32,
    lane_capacity: u32,
    releasing: Mutex<()>,
}

impl DependencyChecker {
    pub fn new(buckets: u32, lanes: u32, lane_capacity: u32) -> Self {
        let entries = lanes.checked_mul(lane_capacity).filter(|&n| n <= u32::MAX - buckets);
        let Some(entries) = entries else {
            panic!("{lanes} lanes of {lane_capacity} nodes overflow the node arena");
        };
        Self {
            table: LockFreeHashTable::new(buckets, entries),
            lanes,
            lane_capacity,
            releasing: Mutex::new(()),
        }
    }

    #[inline]
    pub fn hash(key: &[u8]) -> u32 {
        hash_key(key)
    }

    #[inline(always)]
    pub fn table(&self) -> &LockFreeHashTable {
        &self.table
    }

    #[inline(always)]
    pub fn lanes(&self) -> u32 {
        self.lanes
    }

    /// Table node owned by `slot` of `lane`.
    #[inline(always)]
    pub fn node_for(&self, lane: u32, slot: u32) -> NodeIndex {
        debug_assert!(lane < self.lanes && slot < self.lane_capacity);
        self.table.entry(lane * self.lane_capacity + slot)
    }

    /// Register `node` under `key_hash`. A lost race re-runs the search, so
    /// this never fails.
    pub fn try_insert(&self, node: NodeIndex, key_hash: u32) -> Admission {
        let _pin = epoch::pin();
        self.table.prepare(node, key_hash);
        let mut backoff = Backoff::new();
        loop {
            let at = self.table.search(key_hash);
            if at.found {
                if self.table.switch(node, at) {
                    return Admission::Switched;
                }
            } else if self.table.insert(node, at) {
                return Admission::Inserted;
            }
            backoff.snooze();
        }
    }

    #[inline]
    pub fn delete(&self, node: NodeIndex) {
        self.table.delete(node);
    }

    /// True once the node has been switched out or deleted.
    #[inline]
    pub fn is_superseded(&self, node: NodeIndex) -> bool {
        self.table.link(node).is_deleted()
    }

    /// True when `node` is reachable from the bucket its key hashes to.
    pub fn is_linked(&self, node: NodeIndex) -> bool {
        let _pin = epoch::pin();
        let bucket = self.table.bucket_of(self.table.key(node));
        self.table.reachable(bucket).contains(&node)
    }

    /// Retire a drained lane's nodes: mark them dead, sweep their buckets
    /// until none of them is reachable, wait out every search that might
    /// still hold one, then reset them for reuse.
    pub fn release(&self, nodes: &[NodeIndex]) {
        let _serial = self.releasing.lock();
        let mut buckets: Vec<NodeIndex> = nodes
            .iter()
            .map(|&n| {
                self.table.delete(n);
                self.table.bucket_of(self.table.key(n))
            })
            .collect();
        buckets.sort_unstable();
        buckets.dedup();

        let mut backoff = Backoff::new();
        for &bucket in &buckets {
            loop {
                let unlinked = {
                    let _pin = epoch::pin();
                    self.table.cleanup(bucket);
                    let reachable = self.table.reachable(bucket);
                    !nodes.iter().any(|n| reachable.contains(n))
                };
                if unlinked {
                    break;
                }
                backoff.snooze();
            }
        }

        wait_for_readers();
        for &n in nodes {
            self.table.reset(n);
        }
    }
}

/// Block until every epoch pin taken before this call has been dropped.
fn wait_for_readers() {
    let quiesced = Arc::new(AtomicBool::new(false));
    {
        let guard = epoch::pin();
        let flag = Arc::clone(&quiesced);
        guard.defer(move || flag.store(true, Ordering::Release));
        guard.flush();
    }

    let mut backoff = Backoff::new();
    while !quiesced.load(Ordering::Acquire) {
        epoch::pin().flush();
        backoff.snooze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::link::Link;

    #[test]
    fn test_first_proposal_inserts() {
        let checker = DependencyChecker::new(16, 2, 4);
        let h = DependencyChecker::hash(b"account-1");
        assert_eq!(checker.try_insert(checker.node_for(0, 0), h), Admission::Inserted);
        assert!(!checker.is_superseded(checker.node_for(0, 0)));
    }

    #[test]
    fn test_same_key_switches_and_marks_older() {
        let checker = DependencyChecker::new(16, 2, 4);
        let h = DependencyChecker::hash(b"account-1");
        let first = checker.node_for(1, 0);
        let second = checker.node_for(1, 1);

        assert_eq!(checker.try_insert(first, h), Admission::Inserted);
        assert_eq!(checker.try_insert(second, h), Admission::Switched);
        assert!(checker.is_superseded(first));
        assert!(!checker.is_superseded(second));
        assert_eq!(checker.table().link(first), Link::Deleted(second));
    }

    #[test]
    fn test_switch_across_lanes() {
        let checker = DependencyChecker::new(16, 2, 4);
        let h = DependencyChecker::hash(b"k");
        assert_eq!(checker.try_insert(checker.node_for(0, 3), h), Admission::Inserted);
        assert_eq!(checker.try_insert(checker.node_for(1, 0), h), Admission::Switched);
    }

    #[test]
    fn test_delete_then_reinsert_same_key() {
        let checker = DependencyChecker::new(8, 1, 4);
        let h = DependencyChecker::hash(b"k");
        checker.try_insert(checker.node_for(0, 0), h);
        checker.delete(checker.node_for(0, 0));
        assert_eq!(checker.try_insert(checker.node_for(0, 1), h), Admission::Inserted);
    }

    #[test]
    fn test_release_unlinks_and_resets() {
        let checker = DependencyChecker::new(4, 2, 3);
        let keys = [b"a".as_slice(), b"b", b"c"];
        for (slot, key) in keys.iter().enumerate() {
            checker.try_insert(checker.node_for(0, slot as u32), DependencyChecker::hash(key));
        }
        let other = checker.node_for(1, 0);
        checker.try_insert(other, DependencyChecker::hash(b"z"));

        let lane: Vec<_> = (0..3).map(|s| checker.node_for(0, s)).collect();
        checker.release(&lane);

        for bucket in 0..checker.table().buckets() {
            let reachable = checker.table().reachable(bucket);
            assert!(lane.iter().all(|n| !reachable.contains(n)));
        }
        for &n in &lane {
            assert_eq!(checker.table().link(n), Link::Plain(0));
            assert_eq!(checker.table().key(n), 0);
        }
        let z = DependencyChecker::hash(b"z");
        assert!(checker.table().live_keys(checker.table().bucket_of(z)).contains(&z));
    }
}
