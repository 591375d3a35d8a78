//! Error taxonomy shared by the bitstream layers and the cut engine.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CutError>;

#[derive(Debug, Error)]
pub enum CutError {
    /// The 11-bit frame sync word was not found.
    #[error("frame sync not found")]
    SyncNotFound,

    /// A header field decoded to an undefined table entry.
    #[error("invalid frame header field: {0}")]
    InvalidField(&'static str),

    /// A frame disagrees with the version/layer/sample rate established by the first frame.
    #[error("inconsistent frame header at offset {offset}")]
    InconsistentStream { offset: u64 },

    /// A frame's declared length runs past the bytes available to the scan.
    #[error("frame at offset {offset} ({frame_len} bytes) extends beyond stream end ({stream_len})")]
    FrameExceedsStream {
        offset: u64,
        frame_len: usize,
        stream_len: u64,
    },

    /// End of stream was hit in the middle of a frame.
    #[error("truncated frame at offset {offset}: expected {expected} bytes, got {got}")]
    TruncatedPayload {
        offset: u64,
        expected: usize,
        got: usize,
    },

    #[error("no mp3 data found")]
    NoFramesFound,

    /// Not enough bit-reservoir bytes could be assembled ahead of the first kept frame.
    #[error("bit reservoir unsatisfiable: needed {needed} bytes, available {available}")]
    ReservoirUnsatisfiable { needed: usize, available: usize },

    #[error("crop range {start}..{end} selects no frames")]
    EmptyRange { start: i64, end: i64 },

    #[error("no bitrate yields a large enough frame")]
    NoFittingBitrate,

    #[error("frame index field overflow: {0}")]
    IndexOverflow(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}
