//! Tagged links between arena nodes.
//!
//! A link names its target by arena index and carries one of two marks:
//! DELETED (the node owning this link is logically removed) or PROTECTED
//! (a searcher has claimed this node as a switch point). The whole link packs
//! into one `u64` so every transition is a single compare-and-swap.

use core::sync::atomic::{AtomicU64, Ordering};

/// Index into a node arena.
pub type NodeIndex = u32;

const MARK_MASK: u64 = 0b11;
const DELETED_BIT: u64 = 0b01;
const PROTECTED_BIT: u64 = 0b10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Link {
    Plain(NodeIndex),
    Deleted(NodeIndex),
    Protected(NodeIndex),
}

impl Link {
    #[inline(always)]
    pub const fn index(self) -> NodeIndex {
        match self {
            Link::Plain(i) | Link::Deleted(i) | Link::Protected(i) => i,
        }
    }

    #[inline(always)]
    pub const fn is_deleted(self) -> bool {
        matches!(self, Link::Deleted(_))
    }

    #[inline(always)]
    pub const fn is_protected(self) -> bool {
        matches!(self, Link::Protected(_))
    }

    /// Same target, DELETED mark.
    #[inline(always)]
    pub const fn deleted(self) -> Link {
        Link::Deleted(self.index())
    }

    /// Same mark, different target.
    #[inline(always)]
    pub const fn with_target(self, index: NodeIndex) -> Link {
        match self {
            Link::Plain(_) => Link::Plain(index),
            Link::Deleted(_) => Link::Deleted(index),
            Link::Protected(_) => Link::Protected(index),
        }
    }

    #[inline(always)]
    pub const fn pack(self) -> u64 {
        match self {
            Link::Plain(i) => (i as u64) << 2,
            Link::Deleted(i) => ((i as u64) << 2) | DELETED_BIT,
            Link::Protected(i) => ((i as u64) << 2) | PROTECTED_BIT,
        }
    }

    /// Both bits set never happens through this API; it decodes as DELETED
    /// since deletion always wins over protection.
    #[inline(always)]
    pub const fn unpack(raw: u64) -> Link {
        let index = (raw >> 2) as NodeIndex;
        match raw & MARK_MASK {
            0 => Link::Plain(index),
            PROTECTED_BIT => Link::Protected(index),
            _ => Link::Deleted(index),
        }
    }
}

/// Atomic cell holding a packed [`Link`].
#[derive(Debug)]
pub struct AtomicLink(AtomicU64);

impl AtomicLink {
    pub const fn new(link: Link) -> Self {
        Self(AtomicU64::new(link.pack()))
    }

    #[inline(always)]
    pub fn load(&self) -> Link {
        Link::unpack(self.0.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn store(&self, link: Link) {
        self.0.store(link.pack(), Ordering::Release);
    }

    /// Returns the observed link on failure.
    #[inline(always)]
    pub fn compare_exchange(&self, current: Link, new: Link) -> Result<Link, Link> {
        self.0
            .compare_exchange(current.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
            .map(Link::unpack)
            .map_err(Link::unpack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        for link in [Link::Plain(0), Link::Deleted(7), Link::Protected(u32::MAX)] {
            assert_eq!(Link::unpack(link.pack()), link);
        }
    }

    #[test]
    fn test_mark_transitions_keep_target() {
        let link = Link::Protected(42);
        assert_eq!(link.deleted(), Link::Deleted(42));
        assert_eq!(link.with_target(9), Link::Protected(9));
        assert!(link.is_protected());
        assert!(!link.is_deleted());
    }

    #[test]
    fn test_atomic_cas_reports_observed() {
        let cell = AtomicLink::new(Link::Plain(3));
        assert_eq!(cell.compare_exchange(Link::Plain(4), Link::Plain(5)), Err(Link::Plain(3)));
        assert_eq!(cell.compare_exchange(Link::Plain(3), Link::Deleted(3)), Ok(Link::Plain(3)));
        assert_eq!(cell.load(), Link::Deleted(3));
    }
}
