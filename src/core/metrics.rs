//! Replication counters. Atomics only, no locks.

use core::sync::atomic::{AtomicU64, Ordering};

const LATENCY_BUCKETS: usize = 40;

/// Power-of-two latency histogram: bucket `i` counts samples below
/// `2^(i + 4)` ns; the last bucket absorbs everything larger.
#[repr(C, align(64))]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS],
}

impl LatencyHistogram {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            buckets: [ZERO; LATENCY_BUCKETS],
        }
    }

    #[inline(always)]
    pub const fn bucket_for(latency_ns: u64) -> usize {
        let bits = (64 - latency_ns.leading_zeros()) as usize;
        let idx = bits.saturating_sub(4);
        if idx >= LATENCY_BUCKETS {
            LATENCY_BUCKETS - 1
        } else {
            idx
        }
    }

    /// Exclusive upper bound of bucket `i`.
    #[inline(always)]
    pub const fn upper_bound(bucket: usize) -> u64 {
        if bucket >= LATENCY_BUCKETS - 1 {
            u64::MAX
        } else {
            1u64 << (bucket + 4)
        }
    }

    #[inline(always)]
    pub fn record(&self, latency_ns: u64) {
        self.buckets[Self::bucket_for(latency_ns)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }

    /// Upper bound of the bucket holding the `pct`-th percentile sample.
    pub fn percentile(&self, pct: u8) -> u64 {
        let total = self.total();
        if total == 0 {
            return 0;
        }
        let target = ((total as u128 * pct.min(100) as u128 + 99) / 100).max(1) as u64;
        let mut seen = 0u64;
        for (i, b) in self.buckets.iter().enumerate() {
            seen += b.load(Ordering::Relaxed);
            if seen >= target {
                return Self::upper_bound(i);
            }
        }
        u64::MAX
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct ReplicationMetrics {
    pub proposals: AtomicU64,
    pub superseded: AtomicU64,
    pub frames_written: AtomicU64,
    pub batches: AtomicU64,
    pub bytes_written: AtomicU64,
    pub replays: AtomicU64,
    pub acks_sent: AtomicU64,
    pub waits_released: AtomicU64,
    pub epoch_resets: AtomicU64,
    pub max_batch_latency_ns: AtomicU64,
    pub propose_latency: LatencyHistogram,
}

impl ReplicationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn record_proposal(&self, latency_ns: u64) {
        self.proposals.fetch_add(1, Ordering::Relaxed);
        self.propose_latency.record(latency_ns);
    }

    #[inline(always)]
    pub fn record_superseded(&self) {
        self.superseded.fetch_add(1, Ordering::Relaxed);
    }

    /// One flushed span of `frames` frames, written once per peer.
    #[inline(always)]
    pub fn record_batch(&self, frames: u64, bytes: u64, latency_ns: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.frames_written.fetch_add(frames, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.max_batch_latency_ns.fetch_max(latency_ns, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_replay(&self) {
        self.replays.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_ack(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_wait_released(&self) {
        self.waits_released.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_epoch_reset(&self) {
        self.epoch_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            proposals: load(&self.proposals),
            superseded: load(&self.superseded),
            frames_written: load(&self.frames_written),
            batches: load(&self.batches),
            bytes_written: load(&self.bytes_written),
            replays: load(&self.replays),
            acks_sent: load(&self.acks_sent),
            waits_released: load(&self.waits_released),
            epoch_resets: load(&self.epoch_resets),
            max_batch_latency_ns: load(&self.max_batch_latency_ns),
            propose_p50_ns: self.propose_latency.percentile(50),
            propose_p99_ns: self.propose_latency.percentile(99),
        }
    }
}

/// Point-in-time copy of [`ReplicationMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub proposals: u64,
    pub superseded: u64,
    pub frames_written: u64,
    pub batches: u64,
    pub bytes_written: u64,
    pub replays: u64,
    pub acks_sent: u64,
    pub waits_released: u64,
    pub epoch_resets: u64,
    pub max_batch_latency_ns: u64,
    pub propose_p50_ns: u64,
    pub propose_p99_ns: u64,
}

impl MetricsSnapshot {
    pub fn frames_per_batch(&self) -> u64 {
        if self.batches == 0 {
            0
        } else {
            self.frames_written / self.batches
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(LatencyHistogram::bucket_for(0), 0);
        assert_eq!(LatencyHistogram::bucket_for(15), 0);
        assert_eq!(LatencyHistogram::bucket_for(16), 1);
        assert_eq!(LatencyHistogram::bucket_for(1_000), 6);
        assert_eq!(LatencyHistogram::bucket_for(u64::MAX), LATENCY_BUCKETS - 1);
        assert_eq!(LatencyHistogram::upper_bound(6), 1024);
    }

    #[test]
    fn test_percentiles() {
        let h = LatencyHistogram::new();
        for _ in 0..99 {
            h.record(100);
        }
        h.record(1_000_000);
        assert_eq!(h.total(), 100);
        assert_eq!(h.percentile(50), 128);
        assert_eq!(h.percentile(99), 128);
        assert_eq!(h.percentile(100), 1 << 20);
    }

    #[test]
    fn test_batch_accounting() {
        let m = ReplicationMetrics::new();
        m.record_batch(4, 400, 10);
        m.record_batch(2, 200, 30);
        m.record_proposal(50);
        let s = m.snapshot();
        assert_eq!(s.batches, 2);
        assert_eq!(s.frames_written, 6);
        assert_eq!(s.frames_per_batch(), 3);
        assert_eq!(s.max_batch_latency_ns, 30);
        assert_eq!(s.proposals, 1);
    }
}
