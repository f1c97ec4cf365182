//! Frame header decode/encode.

use std::fmt;

use super::crc::{crc16, le_words};
use super::{ByteOrder, FrameError};

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 88;

/// Samples carried by a transient frame in normal operation.
pub const DEFAULT_SAMPLES_PER_FRAME: usize = 1024;

/// Trailing payload checksum (carried, not validated).
pub const PAYLOAD_CRC_SIZE: usize = 4;

/// Nominal size of one frame on the wire.
pub const FRAME_SIZE: usize = HEADER_SIZE + DEFAULT_SAMPLES_PER_FRAME * 2 + PAYLOAD_CRC_SIZE;

/// Receive buffer size: one byte more than a frame so oversize datagrams show up.
pub const DATAGRAM_BUFFER_SIZE: usize = FRAME_SIZE + 1;

const SEQUENCE_OFFSET: usize = 4;
const BAND_SELECT_LEN: usize = 64;

/// Identifies one dipole stream: `receiver + 1000·board + 1 000 000·station`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u32);

impl ChannelId {
    #[must_use]
    pub const fn new(station: u8, board: u8, receiver: u8) -> Self {
        Self(receiver as u32 + 1_000 * board as u32 + 1_000_000 * station as u32)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<ChannelId> for u32 {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:09}", self.0)
    }
}

/// Decoded frame header, fields in host representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub station: u8,
    /// RSP board.
    pub board: u8,
    /// RCU (receiver unit) on the board.
    pub receiver: u8,
    /// A/D sample frequency in MHz (160 or 200).
    pub sample_freq_mhz: u8,
    /// Position in the board's memory; excluded from the CRC.
    pub sequence: u32,
    /// Unix second of the first sample.
    pub epoch_second: i32,
    /// Sample number within `epoch_second`.
    pub sample_offset: u32,
    pub samples_per_frame: u16,
    /// 0 for transient (time-series) data.
    pub freq_bands: u16,
    pub band_select: [u8; BAND_SELECT_LEN],
    pub spare: i16,
    pub crc: u16,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            station: 0,
            board: 0,
            receiver: 0,
            sample_freq_mhz: 200,
            sequence: 0,
            epoch_second: 0,
            sample_offset: 0,
            samples_per_frame: DEFAULT_SAMPLES_PER_FRAME as u16,
            freq_bands: 0,
            band_select: [0; BAND_SELECT_LEN],
            spare: 0,
            crc: 0,
        }
    }
}

impl Header {
    #[must_use]
    pub const fn channel_id(&self) -> ChannelId {
        ChannelId::new(self.station, self.board, self.receiver)
    }

    #[must_use]
    pub fn sample_rate_hz(&self) -> i64 {
        i64::from(self.sample_freq_mhz) * 1_000_000
    }

    #[must_use]
    pub const fn is_time_series(&self) -> bool {
        self.freq_bands == 0
    }

    /// Bytes the declared payload occupies after the header.
    #[must_use]
    pub const fn payload_len(&self) -> usize {
        self.samples_per_frame as usize * 2
    }

    /// Parses the header fields without any validation beyond length.
    ///
    /// # Errors
    ///
    /// [`FrameError::Truncated`] if `bytes` is shorter than [`HEADER_SIZE`].
    pub fn parse(bytes: &[u8], order: ByteOrder) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                need: HEADER_SIZE,
                have: bytes.len(),
            });
        }

        let mut r = FieldReader::new(&bytes[..HEADER_SIZE], order);
        let station = r.take_u8();
        let board = r.take_u8();
        let receiver = r.take_u8();
        let sample_freq_mhz = r.take_u8();
        let sequence = r.take_u32();
        let epoch_second = r.take_u32() as i32;
        let sample_offset = r.take_u32();
        let samples_per_frame = r.take_u16();
        let freq_bands = r.take_u16();
        let mut band_select = [0u8; BAND_SELECT_LEN];
        band_select.copy_from_slice(r.take_bytes(BAND_SELECT_LEN));
        let spare = r.take_u16() as i16;
        let crc = r.take_u16();

        Ok(Self {
            station,
            board,
            receiver,
            sample_freq_mhz,
            sequence,
            epoch_second,
            sample_offset,
            samples_per_frame,
            freq_bands,
            band_select,
            spare,
            crc,
        })
    }

    /// Appends the 88 header bytes to `out`.
    pub fn write_to(&self, order: ByteOrder, out: &mut Vec<u8>) {
        let mut w = FieldWriter { out, order };
        w.put_u8(self.station);
        w.put_u8(self.board);
        w.put_u8(self.receiver);
        w.put_u8(self.sample_freq_mhz);
        w.put_u32(self.sequence);
        w.put_u32(self.epoch_second as u32);
        w.put_u32(self.sample_offset);
        w.put_u16(self.samples_per_frame);
        w.put_u16(self.freq_bands);
        w.out.extend_from_slice(&self.band_select);
        w.put_u16(self.spare as u16);
        w.put_u16(self.crc);
    }

    /// CRC remainder of this header in canonical (little-endian) layout with
    /// the sequence number zeroed. Zero means the header is intact.
    #[must_use]
    pub fn crc_remainder(&self) -> u16 {
        let mut canonical = Vec::with_capacity(HEADER_SIZE);
        self.write_to(ByteOrder::Little, &mut canonical);
        canonical[SEQUENCE_OFFSET..SEQUENCE_OFFSET + 4].fill(0);
        crc16(le_words(&canonical))
    }

    /// Returns a copy whose `crc` field makes [`Header::crc_remainder`] zero.
    #[must_use]
    pub fn with_valid_crc(mut self) -> Self {
        self.crc = 0;
        self.crc = self.crc_remainder();
        self
    }
}

/// Decodes and validates a frame header.
///
/// Returns the header and the offset of the first payload sample. With
/// `check_crc` the header CRC must leave a zero remainder; only time-series
/// frames are accepted.
///
/// # Errors
///
/// - [`FrameError::Truncated`] for a short buffer or short payload
/// - [`FrameError::BadCrc`] on CRC mismatch
/// - [`FrameError::UnsupportedMode`] for spectral frames
pub fn decode(raw: &[u8], order: ByteOrder, check_crc: bool) -> Result<(Header, usize), FrameError> {
    let header = Header::parse(raw, order)?;

    if check_crc {
        let remainder = header.crc_remainder();
        if remainder != 0 {
            return Err(FrameError::BadCrc { remainder });
        }
    }

    if !header.is_time_series() {
        return Err(FrameError::UnsupportedMode {
            bands: header.freq_bands,
        });
    }

    let need = HEADER_SIZE + header.payload_len();
    if raw.len() < need {
        return Err(FrameError::Truncated {
            need,
            have: raw.len(),
        });
    }

    Ok((header, HEADER_SIZE))
}

/// Reads the payload samples of a decoded frame into `out` (cleared first).
///
/// # Errors
///
/// [`FrameError::Truncated`] if `raw` does not hold the declared samples.
pub fn read_payload(
    raw: &[u8],
    header: &Header,
    order: ByteOrder,
    out: &mut Vec<i16>,
) -> Result<(), FrameError> {
    let need = HEADER_SIZE + header.payload_len();
    let Some(bytes) = raw.get(HEADER_SIZE..need) else {
        return Err(FrameError::Truncated {
            need,
            have: raw.len(),
        });
    };

    out.clear();
    out.extend(bytes.chunks_exact(2).map(|pair| {
        let pair = [pair[0], pair[1]];
        match order {
            ByteOrder::Little => i16::from_le_bytes(pair),
            ByteOrder::Big => i16::from_be_bytes(pair),
        }
    }));
    Ok(())
}

/// Encodes a complete frame: header as given, payload, zeroed payload checksum.
///
/// The buffer is cleared and reused.
pub fn encode(header: &Header, payload: &[i16], order: ByteOrder, out: &mut Vec<u8>) {
    debug_assert_eq!(usize::from(header.samples_per_frame), payload.len());
    out.clear();
    out.reserve(HEADER_SIZE + payload.len() * 2 + PAYLOAD_CRC_SIZE);
    header.write_to(order, out);
    for &sample in payload {
        match order {
            ByteOrder::Little => out.extend_from_slice(&sample.to_le_bytes()),
            ByteOrder::Big => out.extend_from_slice(&sample.to_be_bytes()),
        }
    }
    out.extend_from_slice(&[0u8; PAYLOAD_CRC_SIZE]);
}

/// Cursor over an exactly header-sized slice. Length is checked up front,
/// so individual reads cannot run short.
struct FieldReader<'a> {
    buf: &'a [u8],
    cursor: usize,
    order: ByteOrder,
}

impl<'a> FieldReader<'a> {
    const fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Self {
            buf,
            cursor: 0,
            order,
        }
    }

    fn take_bytes(&mut self, n: usize) -> &'a [u8] {
        let bytes = &self.buf[self.cursor..self.cursor + n];
        self.cursor += n;
        bytes
    }

    fn take_u8(&mut self) -> u8 {
        self.take_bytes(1)[0]
    }

    fn take_u16(&mut self) -> u16 {
        let mut arr = [0u8; 2];
        arr.copy_from_slice(self.take_bytes(2));
        match self.order {
            ByteOrder::Little => u16::from_le_bytes(arr),
            ByteOrder::Big => u16::from_be_bytes(arr),
        }
    }

    fn take_u32(&mut self) -> u32 {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(self.take_bytes(4));
        match self.order {
            ByteOrder::Little => u32::from_le_bytes(arr),
            ByteOrder::Big => u32::from_be_bytes(arr),
        }
    }
}

struct FieldWriter<'a> {
    out: &'a mut Vec<u8>,
    order: ByteOrder,
}

impl FieldWriter<'_> {
    fn put_u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        match self.order {
            ByteOrder::Little => self.out.extend_from_slice(&v.to_le_bytes()),
            ByteOrder::Big => self.out.extend_from_slice(&v.to_be_bytes()),
        }
    }

    fn put_u32(&mut self, v: u32) {
        match self.order {
            ByteOrder::Little => self.out.extend_from_slice(&v.to_le_bytes()),
            ByteOrder::Big => self.out.extend_from_slice(&v.to_be_bytes()),
        }
    }
}
