//! Raw TBB transient frames: wire codec, header CRC and clock correction.
//!
//! A frame is a fixed 88-byte header, `samples_per_frame` signed 16-bit
//! samples and a 4-byte payload checksum. The boards emit little-endian
//! frames; big-endian sources are normalised field by field while decoding.
//!
//! ```text
//! ┌─────┬─────┬─────┬──────┬─────────┬─────────┬──────────┬─────┬───────┬──────────┬───────┬─────┐
//! │ stn │ rsp │ rcu │ freq │ seq (4) │ sec (4) │ smpl (4) │ n(2)│ bands │ bsel(64) │ spare │ crc │
//! └─────┴─────┴─────┴──────┴─────────┴─────────┴──────────┴─────┴───────┴──────────┴───────┴─────┘
//!   0     1     2     3      4         8         12         16    18      20         84      86
//! ```

pub mod crc;
pub mod header;
pub mod timestamp;

use thiserror::Error;

pub use header::{
    ChannelId, DATAGRAM_BUFFER_SIZE, DEFAULT_SAMPLES_PER_FRAME, FRAME_SIZE, HEADER_SIZE, Header,
    decode, encode, read_payload,
};
pub use timestamp::{ClockState, Correction, CorrectionPolicy, correct};

/// Byte order of the frames a source emits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

/// Reasons a single frame is rejected by the codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Buffer shorter than the header or the payload it declares.
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    /// Header CRC check left a non-zero remainder.
    #[error("header CRC mismatch (remainder 0x{remainder:04x})")]
    BadCrc { remainder: u16 },
    /// Spectral (sub-band) frames cannot be ingested as time series.
    #[error("unsupported frame mode: {bands} spectral bands")]
    UnsupportedMode { bands: u16 },
}
