//! Storage writer: places a frame's samples at their offset in the channel array.

use crate::frame::Header;
use crate::storage::{Storage, StorageError};

use super::registry::ChannelContext;

/// What [`append`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Append {
    /// Samples written at `offset`; `extended` if the array grew.
    Written { offset: u64, extended: bool },
    /// The frame predates the channel origin and was discarded.
    BeforeOrigin { offset: i64 },
}

/// Sample offset of `header` relative to the channel origin.
#[must_use]
pub fn write_offset(ctx: &ChannelContext, header: &Header) -> i64 {
    let samples = i64::from(header.sample_offset) - i64::from(ctx.origin_sample);
    let seconds = i64::from(header.epoch_second) - i64::from(ctx.origin_second);
    samples + seconds * header.sample_rate_hz()
}

/// Writes `payload` into the channel's array, extending it when the frame
/// reaches past the current end.
///
/// Replaying a frame rewrites the same region and leaves the length alone.
///
/// # Errors
///
/// Propagates backend failures; `ctx.length` is only advanced once the
/// array has actually grown.
pub fn append<S: Storage>(
    storage: &mut S,
    ctx: &mut ChannelContext,
    header: &Header,
    payload: &[i16],
) -> Result<Append, StorageError> {
    let offset = write_offset(ctx, header);
    let Ok(offset) = u64::try_from(offset) else {
        return Ok(Append::BeforeOrigin { offset });
    };

    let end = offset + payload.len() as u64;
    let extended = end > ctx.length;
    if extended {
        storage.extend_array(ctx.array, end)?;
        ctx.length = end;
    }
    storage.write_at(ctx.array, offset, payload)?;

    Ok(Append::Written { offset, extended })
}
