//! Sentinel-headed lock-free lists over a shared node arena.
//!
//! Arena indices `[0, heads)` are sentinels. Each sentinel starts linked to
//! itself, so a bucket is a circle that ends where it began. Entry nodes live
//! after the sentinels and are kept in ascending key order. Marks follow
//! [`Link`]: a DELETED link means the node owning it is dead, a PROTECTED
//! link means a searcher matched the node and may switch it out.
//!
//! A key lives in the list headed by `key % heads`. A search that lands on a
//! node or sentinel of another list has followed a recycled node and starts
//! over from its own head.

use core::sync::atomic::{AtomicU32, Ordering};

use super::link::{AtomicLink, Link, NodeIndex};

#[derive(Debug)]
struct ListNode {
    next: AtomicLink,
    key: AtomicU32,
}

/// Outcome of [`MarkedList::search`].
///
/// When `found`, `left` is the matching node and `right` its successor (the
/// match's link is left PROTECTED). Otherwise `left` is the last node with a
/// smaller key and `right` the first node with a greater key or a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    pub found: bool,
    pub left: NodeIndex,
    pub right: NodeIndex,
}

pub struct MarkedList {
    nodes: Box<[ListNode]>,
    heads: u32,
}

impl MarkedList {
    pub fn new(heads: u32, entries: u32) -> Self {
        let total = heads as usize + entries as usize;
        let nodes = (0..total)
            .map(|i| ListNode {
                next: AtomicLink::new(Link::Plain(i as NodeIndex)),
                key: AtomicU32::new(0),
            })
            .collect();
        Self { nodes, heads }
    }

    #[inline(always)]
    pub fn heads(&self) -> u32 {
        self.heads
    }

    #[inline(always)]
    pub fn capacity(&self) -> u32 {
        self.nodes.len() as u32 - self.heads
    }

    #[inline(always)]
    pub fn is_sentinel(&self, node: NodeIndex) -> bool {
        node < self.heads
    }

    #[inline(always)]
    pub fn key(&self, node: NodeIndex) -> u32 {
        self.nodes[node as usize].key.load(Ordering::Acquire)
    }

    /// Only valid while the node is unlinked.
    #[inline(always)]
    pub fn set_key(&self, node: NodeIndex, key: u32) {
        self.nodes[node as usize].key.store(key, Ordering::Release);
    }

    #[inline(always)]
    pub fn link(&self, node: NodeIndex) -> Link {
        self.nodes[node as usize].next.load()
    }

    #[inline(always)]
    fn cas(&self, node: NodeIndex, current: Link, new: Link) -> Result<Link, Link> {
        self.nodes[node as usize].next.compare_exchange(current, new)
    }

    /// Locate `key` in the list rooted at `head`, unlinking dead nodes on the
    /// way. A match gets its own link marked PROTECTED.
    pub fn search(&self, head: NodeIndex, key: u32) -> SearchResult {
        'retry: loop {
            let mut pred = head;
            let mut pred_link = self.link(head);
            loop {
                let cur = pred_link.index();
                if self.is_sentinel(cur) {
                    if cur != head {
                        continue 'retry;
                    }
                    return SearchResult { found: false, left: pred, right: cur };
                }

                let cur_link = self.link(cur);
                if cur_link.is_deleted() {
                    let spliced = pred_link.with_target(cur_link.index());
                    match self.cas(pred, pred_link, spliced) {
                        Ok(_) => pred_link = spliced,
                        Err(observed) if observed.is_deleted() && !pred_link.is_deleted() => {
                            continue 'retry;
                        }
                        Err(observed) => pred_link = observed,
                    }
                    continue;
                }

                let cur_key = self.key(cur);
                if cur_key % self.heads != head {
                    continue 'retry;
                }
                if cur_key < key {
                    pred = cur;
                    pred_link = cur_link;
                    continue;
                }

                if cur_key > key {
                    return SearchResult { found: false, left: pred, right: cur };
                }

                match cur_link {
                    Link::Protected(right) => {
                        return SearchResult { found: true, left: cur, right };
                    }
                    Link::Plain(right) => {
                        if self.cas(cur, cur_link, Link::Protected(right)).is_ok() {
                            return SearchResult { found: true, left: cur, right };
                        }
                        continue 'retry;
                    }
                    Link::Deleted(_) => continue 'retry,
                }
            }
        }
    }

    /// Link `new` between `left` and `right`. A PROTECTED mark on `left`
    /// belongs to another searcher and is overwritten. Returns false when
    /// `left` moved on and the caller has to search again.
    pub fn insert(&self, new: NodeIndex, left: NodeIndex, right: NodeIndex) -> bool {
        self.nodes[new as usize].next.store(Link::Plain(right));
        let mut expected = Link::Plain(right);
        loop {
            match self.cas(left, expected, Link::Plain(new)) {
                Ok(_) => return true,
                Err(Link::Protected(observed)) if observed == right && !expected.is_protected() => {
                    expected = Link::Protected(right);
                }
                Err(_) => return false,
            }
        }
    }

    /// Replace the matched node `left` with `new`. The match keeps a DELETED
    /// link to `new`, so `new` is reachable through it until a sweep.
    pub fn switch(&self, new: NodeIndex, left: NodeIndex, right: NodeIndex) -> bool {
        let mut right = right;
        loop {
            self.nodes[new as usize].next.store(Link::Plain(right));
            match self.cas(left, Link::Protected(right), Link::Deleted(new)) {
                Ok(_) => return true,
                Err(Link::Protected(observed)) => right = observed,
                Err(_) => return false,
            }
        }
    }

    /// Mark `node` dead. Idempotent.
    pub fn delete(&self, node: NodeIndex) {
        let mut current = self.link(node);
        while !current.is_deleted() {
            match self.cas(node, current, current.deleted()) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// One pass over the list splicing out runs of dead nodes. Returns how
    /// many nodes were unlinked.
    pub fn cleanup(&self, head: NodeIndex) -> usize {
        let mut spliced_total = 0;
        let mut pred = head;
        let mut pred_link = self.link(head);
        loop {
            let cur = pred_link.index();
            if self.is_sentinel(cur) {
                return spliced_total;
            }

            let cur_link = self.link(cur);
            if !cur_link.is_deleted() {
                pred = cur;
                pred_link = cur_link;
                continue;
            }

            let mut run = 1;
            let mut next = cur_link.index();
            while !self.is_sentinel(next) {
                let next_link = self.link(next);
                if !next_link.is_deleted() {
                    break;
                }
                run += 1;
                next = next_link.index();
            }

            let spliced = pred_link.with_target(next);
            match self.cas(pred, pred_link, spliced) {
                Ok(_) => {
                    spliced_total += run;
                    pred_link = spliced;
                }
                Err(observed) => pred_link = observed,
            }
        }
    }

    /// Return an unlinked node to its initial state. Its link points at the
    /// first sentinel, never back at itself.
    pub fn reset(&self, node: NodeIndex) {
        self.nodes[node as usize].next.store(Link::Plain(0));
        self.nodes[node as usize].key.store(0, Ordering::Release);
    }

    /// Every node reachable from `head`, dead or alive, in traversal order.
    pub fn reachable(&self, head: NodeIndex) -> Vec<NodeIndex> {
        let mut out = Vec::new();
        let mut cur = self.link(head).index();
        while !self.is_sentinel(cur) && out.len() < self.nodes.len() {
            out.push(cur);
            cur = self.link(cur).index();
        }
        out
    }

    /// Keys of the live nodes reachable from `head`, in traversal order.
    pub fn live_keys(&self, head: NodeIndex) -> Vec<u32> {
        self.reachable(head)
            .into_iter()
            .filter(|&n| !self.link(n).is_deleted())
            .map(|n| self.key(n))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAD: NodeIndex = 0;

    fn entry(i: u32) -> NodeIndex {
        1 + i
    }

    fn add(list: &MarkedList, node: NodeIndex, key: u32) -> bool {
        list.set_key(node, key);
        loop {
            let r = list.search(HEAD, key);
            if r.found {
                if list.switch(node, r.left, r.right) {
                    return false;
                }
            } else if list.insert(node, r.left, r.right) {
                return true;
            }
        }
    }

    #[test]
    fn test_empty_list_is_circular() {
        let list = MarkedList::new(1, 4);
        let r = list.search(HEAD, 10);
        assert_eq!(r, SearchResult { found: false, left: HEAD, right: HEAD });
        assert!(list.reachable(HEAD).is_empty());
    }

    #[test]
    fn test_insert_keeps_ascending_order() {
        let list = MarkedList::new(1, 8);
        for (i, key) in [50u32, 10, 30, 20, 40].iter().enumerate() {
            assert!(add(&list, entry(i as u32), *key));
        }
        assert_eq!(list.live_keys(HEAD), vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_search_protects_match() {
        let list = MarkedList::new(1, 4);
        add(&list, entry(0), 5);
        add(&list, entry(1), 9);

        let r = list.search(HEAD, 5);
        assert!(r.found);
        assert_eq!(r.left, entry(0));
        assert_eq!(r.right, entry(1));
        assert_eq!(list.link(entry(0)), Link::Protected(entry(1)));

        // A second search tolerates the existing protection.
        assert_eq!(list.search(HEAD, 5), r);
    }

    #[test]
    fn test_insert_over_protected_predecessor() {
        let list = MarkedList::new(1, 4);
        add(&list, entry(0), 5);
        let protect = list.search(HEAD, 5);
        assert!(protect.found);

        list.set_key(entry(1), 7);
        let r = list.search(HEAD, 7);
        assert!(!r.found);
        assert_eq!(r.left, entry(0));
        assert!(list.insert(entry(1), r.left, r.right));
        assert_eq!(list.live_keys(HEAD), vec![5, 7]);
    }

    #[test]
    fn test_switch_then_cleanup() {
        let list = MarkedList::new(1, 4);
        add(&list, entry(0), 3);
        add(&list, entry(1), 8);
        add(&list, entry(2), 12);

        assert!(!add(&list, entry(3), 8));
        assert_eq!(list.link(entry(1)), Link::Deleted(entry(3)));
        assert_eq!(list.live_keys(HEAD), vec![3, 8, 12]);
        assert!(list.reachable(HEAD).contains(&entry(1)));

        assert_eq!(list.cleanup(HEAD), 1);
        assert_eq!(list.reachable(HEAD), vec![entry(0), entry(3), entry(2)]);
        assert_eq!(list.link(entry(0)), Link::Plain(entry(3)));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let list = MarkedList::new(1, 2);
        add(&list, entry(0), 1);
        list.delete(entry(0));
        list.delete(entry(0));
        assert_eq!(list.link(entry(0)), Link::Deleted(HEAD));
        assert!(list.live_keys(HEAD).is_empty());
    }

    #[test]
    fn test_cleanup_splices_contiguous_run() {
        let list = MarkedList::new(1, 5);
        for i in 0..5 {
            add(&list, entry(i), i * 10);
        }
        list.delete(entry(1));
        list.delete(entry(2));
        list.delete(entry(3));
        assert_eq!(list.cleanup(HEAD), 3);
        assert_eq!(list.reachable(HEAD), vec![entry(0), entry(4)]);
    }

    #[test]
    fn test_search_unlinks_dead_nodes() {
        let list = MarkedList::new(1, 3);
        add(&list, entry(0), 1);
        add(&list, entry(1), 2);
        add(&list, entry(2), 3);
        list.delete(entry(1));

        let r = list.search(HEAD, 3);
        assert!(r.found);
        assert_eq!(list.reachable(HEAD), vec![entry(0), entry(2)]);
    }

    #[test]
    fn test_reset_unlinked_node() {
        let list = MarkedList::new(1, 1);
        add(&list, entry(0), 4);
        list.delete(entry(0));
        list.cleanup(HEAD);
        list.reset(entry(0));
        assert_eq!(list.link(entry(0)), Link::Plain(HEAD));
        assert!(add(&list, entry(0), 6));
        assert_eq!(list.live_keys(HEAD), vec![6]);
    }

    #[test]
    fn test_reset_node_never_loops_a_search() {
        let list = MarkedList::new(1, 2);
        add(&list, entry(0), 5);
        // A stalled searcher still sees the node linked after the reset.
        list.reset(entry(0));
        let r = list.search(HEAD, 10);
        assert_eq!(r, SearchResult { found: false, left: entry(0), right: HEAD });
    }
}
