//! Fixed-size lock-free hash table: one [`MarkedList`] bucket per slot of the
//! bucket array, keyed by a 32-bit content hash.

use super::link::{Link, NodeIndex};
use super::list::{MarkedList, SearchResult};

/// MurmurHash3, x86 32-bit variant.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        let mut k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k ^= (*byte as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    fmix32(h)
}

#[inline(always)]
const fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Hash used for bucket placement and key identity.
#[inline]
pub fn hash_key(key: &[u8]) -> u32 {
    murmur3_32(key, 0)
}

pub struct LockFreeHashTable {
    list: MarkedList,
}

impl LockFreeHashTable {
    pub fn new(buckets: u32, entries: u32) -> Self {
        assert!(buckets > 0, "hash table needs at least one bucket");
        Self {
            list: MarkedList::new(buckets, entries),
        }
    }

    #[inline(always)]
    pub fn buckets(&self) -> u32 {
        self.list.heads()
    }

    #[inline(always)]
    pub fn capacity(&self) -> u32 {
        self.list.capacity()
    }

    /// Sentinel of the bucket holding `key_hash`.
    #[inline(always)]
    pub fn bucket_of(&self, key_hash: u32) -> NodeIndex {
        key_hash % self.list.heads()
    }

    /// Arena index of entry `n`.
    #[inline(always)]
    pub fn entry(&self, n: u32) -> NodeIndex {
        debug_assert!(n < self.capacity());
        self.list.heads() + n
    }

    #[inline(always)]
    pub fn key(&self, node: NodeIndex) -> u32 {
        self.list.key(node)
    }

    #[inline(always)]
    pub fn link(&self, node: NodeIndex) -> Link {
        self.list.link(node)
    }

    #[inline]
    pub fn prepare(&self, node: NodeIndex, key_hash: u32) {
        self.list.set_key(node, key_hash);
    }

    #[inline]
    pub fn search(&self, key_hash: u32) -> SearchResult {
        self.list.search(self.bucket_of(key_hash), key_hash)
    }

    #[inline]
    pub fn insert(&self, node: NodeIndex, at: SearchResult) -> bool {
        self.list.insert(node, at.left, at.right)
    }

    #[inline]
    pub fn switch(&self, node: NodeIndex, at: SearchResult) -> bool {
        self.list.switch(node, at.left, at.right)
    }

    #[inline]
    pub fn delete(&self, node: NodeIndex) {
        self.list.delete(node)
    }

    #[inline]
    pub fn cleanup(&self, bucket: NodeIndex) -> usize {
        self.list.cleanup(bucket)
    }

    #[inline]
    pub fn reset(&self, node: NodeIndex) {
        self.list.reset(node)
    }

    pub fn reachable(&self, bucket: NodeIndex) -> Vec<NodeIndex> {
        self.list.reachable(bucket)
    }

    pub fn live_keys(&self, bucket: NodeIndex) -> Vec<u32> {
        self.list.live_keys(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur3_known_vectors() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_32(b"hello", 0), 0x248b_fa47);
        assert_eq!(
            murmur3_32(b"The quick brown fox jumps over the lazy dog", 0),
            0x2e4f_f723
        );
    }

    #[test]
    fn test_hash_depends_on_length() {
        assert_ne!(hash_key(&[0]), hash_key(&[0, 0]));
    }

    #[test]
    fn test_bucket_placement() {
        let table = LockFreeHashTable::new(7, 4);
        assert_eq!(table.bucket_of(15), 1);
        assert_eq!(table.entry(0), 7);
        assert_eq!(table.capacity(), 4);
    }

    #[test]
    fn test_same_bucket_different_keys() {
        let table = LockFreeHashTable::new(4, 4);
        for (i, key) in [4u32, 8, 12].iter().enumerate() {
            let node = table.entry(i as u32);
            table.prepare(node, *key);
            let at = table.search(*key);
            assert!(!at.found);
            assert!(table.insert(node, at));
        }
        assert_eq!(table.live_keys(0), vec![4, 8, 12]);
        assert!(table.live_keys(1).is_empty());
    }
}
