//! Offset arithmetic for the append-only log area of a region.
//!
//! Bytes `[0, LOG_BASE_OFFSET)` hold control records. Frames start on
//! `FRAME_ALIGN` boundaries and the log wraps back to the base when the next
//! frame does not fit in what is left.

use super::frame::frame_len;

pub const FRAME_ALIGN: u32 = 64;

/// First byte of the log area.
pub const LOG_BASE_OFFSET: u32 = 128;

#[inline(always)]
pub const fn align_up(offset: u32) -> u32 {
    (offset + (FRAME_ALIGN - 1)) & !(FRAME_ALIGN - 1)
}

/// Bytes a frame with `body_len` body bytes occupies.
#[inline(always)]
pub const fn frame_size(body_len: u32) -> u32 {
    frame_len(body_len as usize) as u32
}

/// Position the next frame of `body_len` bytes.
///
/// Rounds `offset` up to the alignment (the padding is taken out of `free`)
/// and wraps to `LOG_BASE_OFFSET` with a fresh `region_size - LOG_BASE_OFFSET`
/// when the frame would not fit. Returns the frame offset and the free space
/// counted from it.
pub fn next_aligned_offset(offset: u32, free: u32, body_len: u32, region_size: u32) -> (u32, u32) {
    let need = frame_size(body_len);
    let aligned = align_up(offset);
    let free = free.saturating_sub(aligned.saturating_sub(offset));
    if aligned >= region_size || need > free {
        (LOG_BASE_OFFSET, region_size - LOG_BASE_OFFSET)
    } else {
        (aligned, free)
    }
}

/// Largest body that fits an empty log area.
#[inline]
pub const fn max_body_len(region_size: u32) -> u32 {
    let area = region_size - LOG_BASE_OFFSET;
    let overhead = frame_size(0);
    if area > overhead {
        area - overhead
    } else {
        0
    }
}

/// Writer-side position in a region's log area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCursor {
    offset: u32,
    free: u32,
    region_size: u32,
}

impl LogCursor {
    pub fn new(region_size: u32) -> Self {
        Self::resume(region_size, LOG_BASE_OFFSET)
    }

    /// Continue from an offset a peer reported.
    pub fn resume(region_size: u32, offset: u32) -> Self {
        let offset = offset.clamp(LOG_BASE_OFFSET, region_size);
        Self {
            offset,
            free: region_size - offset,
            region_size,
        }
    }

    #[inline(always)]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[inline(always)]
    pub fn free(&self) -> u32 {
        self.free
    }

    /// Offset the next frame would land on, without consuming it.
    #[inline]
    pub fn peek(&self, body_len: u32) -> u32 {
        next_aligned_offset(self.offset, self.free, body_len, self.region_size).0
    }

    /// Place and consume a frame. Returns its offset.
    pub fn reserve(&mut self, body_len: u32) -> u32 {
        let (offset, free) =
            next_aligned_offset(self.offset, self.free, body_len, self.region_size);
        let size = frame_size(body_len);
        self.offset = offset + size;
        self.free = free - size;
        offset
    }
}
