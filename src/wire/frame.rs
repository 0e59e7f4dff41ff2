//! Frame layout: [HeaderSlot:42][payload][key][SlotCanary:4]
//!
//! The canary is a deterministic function of header fields, so a reader
//! recomputes it without any side channel. A frame is complete when the
//! header canary, the recomputed canary and the trailer agree. The checksum
//! covers the remaining header fields and the body.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// What the receiver of a frame is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    /// Apply the record.
    Replicate = 0,
    /// Apply the record; the proposer waits for the owner's acknowledgment.
    DepCheckWait = 1,
    /// Owner acknowledgment for a pending `DepCheckWait` on the same key.
    DepCheckAck = 2,
}

impl RequestType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Replicate),
            1 => Some(Self::DepCheckWait),
            2 => Some(Self::DepCheckAck),
            _ => None,
        }
    }
}

/// Reasons a byte span is not a complete frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("span shorter than a frame header")]
    HeaderTruncated,
    #[error("frame body runs past the span")]
    BodyTruncated,
    #[error("header canary does not match its fields")]
    CanaryMismatch,
    #[error("trailing canary does not match the header")]
    TornWrite,
    #[error("frame checksum mismatch")]
    ChecksumMismatch,
    #[error("unknown request type {0}")]
    UnknownRequest(u8),
}

/// Fixed wire header.
///
/// `mem_addr` and `key_addr` hold local addresses while the frame is staged
/// and are rewritten to the receiving peer's addresses before each write.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct HeaderSlot {
    pub request: u8,
    pub reserved: [u8; 3],
    pub proposal: u32,
    pub mem_addr: u64,
    pub mem_size: u16,
    pub key_addr: u64,
    pub key_size: u16,
    pub owner: u16,
    pub key_hash: u32,
    pub checksum: u32,
    pub canary: u32,
}

const _: () = {
    assert!(core::mem::size_of::<HeaderSlot>() == 42);
};

/// Byte offset of `checksum` inside the header.
const CHECKSUM_OFFSET: usize = 34;

impl HeaderSlot {
    pub const SIZE: usize = 42;

    /// Byte offset of `canary` inside the header.
    pub const CANARY_OFFSET: usize = 38;

    pub fn new(
        request: RequestType,
        proposal: u32,
        key_hash: u32,
        mem_size: u16,
        key_size: u16,
        owner: u16,
    ) -> Self {
        Self {
            request: request as u8,
            reserved: [0u8; 3],
            proposal,
            mem_addr: 0,
            mem_size,
            key_addr: 0,
            key_size,
            owner,
            key_hash,
            checksum: 0,
            canary: compute_canary(key_hash, mem_size, key_size, proposal),
        }
    }

    #[inline]
    pub fn expected_canary(&self) -> u32 {
        compute_canary(self.key_hash, self.mem_size, self.key_size, self.proposal)
    }

    #[inline]
    pub fn request_type(&self) -> Result<RequestType, FrameError> {
        RequestType::from_u8(self.request).ok_or(FrameError::UnknownRequest(self.request))
    }

    #[inline(always)]
    pub fn body_len(&self) -> usize {
        self.mem_size as usize + self.key_size as usize
    }

    #[inline(always)]
    pub fn frame_len(&self) -> usize {
        frame_len(self.body_len())
    }

    /// CRC over every header byte before `checksum`, then the body.
    pub fn compute_checksum(&self, body: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.as_bytes()[..CHECKSUM_OFFSET]);
        hasher.update(body);
        hasher.finalize()
    }

    #[inline]
    pub fn seal(&mut self, body: &[u8]) {
        self.checksum = self.compute_checksum(body);
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf.copy_from_slice(self.as_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        Self::read_from_prefix(buf).ok().map(|(h, _)| h)
    }
}

/// Trailer written after the body.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct SlotCanary {
    pub value: u32,
}

const _: () = {
    assert!(core::mem::size_of::<SlotCanary>() == 4);
};

impl SlotCanary {
    pub const SIZE: usize = 4;
}

/// `key_hash + mem_size + key_size + proposal`, wrapping.
#[inline(always)]
pub const fn compute_canary(key_hash: u32, mem_size: u16, key_size: u16, proposal: u32) -> u32 {
    key_hash
        .wrapping_add(mem_size as u32)
        .wrapping_add(key_size as u32)
        .wrapping_add(proposal)
}

/// Value a reader stores over a consumed header canary.
#[inline(always)]
pub const fn corrupted_canary(canary: u32) -> u32 {
    if canary == 0 {
        u32::MAX
    } else {
        canary << 4
    }
}

#[inline(always)]
pub const fn frame_len(body_len: usize) -> usize {
    HeaderSlot::SIZE + body_len + SlotCanary::SIZE
}

/// Borrowed view of a validated frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameRef<'a> {
    pub header: HeaderSlot,
    pub request: RequestType,
    pub payload: &'a [u8],
    pub key: &'a [u8],
}

impl FrameRef<'_> {
    #[inline(always)]
    pub fn proposal(&self) -> u32 {
        self.header.proposal
    }

    #[inline(always)]
    pub fn owner(&self) -> u16 {
        self.header.owner
    }

    #[inline(always)]
    pub fn key_hash(&self) -> u32 {
        self.header.key_hash
    }
}

/// Append a sealed frame to `out`. Returns the frame length.
pub fn encode_frame(header: &HeaderSlot, payload: &[u8], key: &[u8], out: &mut Vec<u8>) -> usize {
    debug_assert_eq!(payload.len(), header.mem_size as usize);
    debug_assert_eq!(key.len(), header.key_size as usize);

    let start = out.len();
    let mut sealed = *header;
    out.extend_from_slice(sealed.as_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(key);
    sealed.seal(&out[start + HeaderSlot::SIZE..]);
    out[start..start + HeaderSlot::SIZE].copy_from_slice(sealed.as_bytes());
    out.extend_from_slice(SlotCanary { value: sealed.canary }.as_bytes());
    out.len() - start
}

/// Validate and borrow the frame at the start of `buf`.
pub fn decode_frame(buf: &[u8]) -> Result<FrameRef<'_>, FrameError> {
    let header = HeaderSlot::from_bytes(buf).ok_or(FrameError::HeaderTruncated)?;
    if header.canary != header.expected_canary() {
        return Err(FrameError::CanaryMismatch);
    }

    let body_end = HeaderSlot::SIZE + header.body_len();
    let frame_end = body_end + SlotCanary::SIZE;
    if buf.len() < frame_end {
        return Err(FrameError::BodyTruncated);
    }

    let trailer = SlotCanary::read_from_bytes(&buf[body_end..frame_end])
        .map_err(|_| FrameError::BodyTruncated)?;
    if trailer.value != header.canary {
        return Err(FrameError::TornWrite);
    }

    let body = &buf[HeaderSlot::SIZE..body_end];
    if header.compute_checksum(body) != header.checksum {
        return Err(FrameError::ChecksumMismatch);
    }

    let request = header.request_type()?;
    let (payload, key) = body.split_at(header.mem_size as usize);
    Ok(FrameRef {
        header,
        request,
        payload,
        key,
    })
}
