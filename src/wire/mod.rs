//! On-the-wire formats: frames, the per-region control record, and the log
//! area allocator. All structures are packed and native-endian.

pub mod frame;
pub mod logstat;
pub mod offset;

pub use frame::{
    compute_canary, corrupted_canary, decode_frame, encode_frame, frame_len, FrameError,
    FrameRef, HeaderSlot, RequestType, SlotCanary,
};
pub use logstat::{LogStat, LOGSTAT_OFFSET, READY_MARKER, RESUME_SCRATCH_OFFSET};
pub use offset::{
    align_up, frame_size, max_body_len, next_aligned_offset, LogCursor, FRAME_ALIGN,
    LOG_BASE_OFFSET,
};
