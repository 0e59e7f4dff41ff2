//! Node identity and the two replication lanes.

/// Node identifier, dense in `[0, node_count)`.
pub type NodeId = u16;

/// Replication lane. Each division has its own regions, slot ring and
/// worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Division {
    /// Records owned by this node; written without waiting.
    Writer = 0,
    /// Records owned by a peer; the proposer waits for the owner's ack.
    DepCheck = 1,
}

impl Division {
    pub const COUNT: usize = 2;
    pub const ALL: [Division; 2] = [Division::Writer, Division::DepCheck];

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Writer),
            1 => Some(Self::DepCheck),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Division::Writer => "writer",
            Division::DepCheck => "depcheck",
        }
    }
}

impl core::fmt::Display for Division {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}
