//! Control record at the head of every region.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Marker a reader publishes once it is polling the region.
pub const READY_MARKER: u32 = 0xdead_face;

/// Offset of the published `LogStat` inside a region.
pub const LOGSTAT_OFFSET: u32 = 0;

/// Scratch area a writer reads peers' `LogStat` records into.
pub const RESUME_SCRATCH_OFFSET: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct LogStat {
    /// Last proposal number written (writer) or consumed (reader).
    pub proposal: u32,
    /// Where the next frame is expected.
    pub write_offset: u32,
    pub ready_marker: u32,
    pub reserved: u32,
}

const _: () = {
    assert!(core::mem::size_of::<LogStat>() == 16);
};

impl LogStat {
    pub const SIZE: usize = 16;

    pub const fn empty() -> Self {
        Self {
            proposal: 0,
            write_offset: 0,
            ready_marker: 0,
            reserved: 0,
        }
    }

    pub const fn ready(proposal: u32, write_offset: u32) -> Self {
        Self {
            proposal,
            write_offset,
            ready_marker: READY_MARKER,
            reserved: 0,
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready_marker == READY_MARKER
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf.copy_from_slice(self.as_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        Self::read_from_prefix(buf).ok().map(|(s, _)| s)
    }
}

impl Default for LogStat {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_marker() {
        assert!(!LogStat::empty().is_ready());
        let stat = LogStat::ready(9, 256);
        assert!(stat.is_ready());
        assert_eq!(LogStat::from_bytes(&stat.to_bytes()), Some(stat));
    }

    #[test]
    fn test_short_buffer() {
        assert_eq!(LogStat::from_bytes(&[0u8; 8]), None);
    }
}
