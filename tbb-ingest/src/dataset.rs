//! One output ("dataset") and the per-frame pipeline that fills it.
//!
//! [`Dataset::process`] runs a raw frame through decode, timestamp
//! correction, channel resolution and the storage writer. Every outcome is
//! counted; per-frame failures are returned for logging but never poison the
//! dataset.

pub mod metadata;
pub mod registry;
pub mod writer;

use std::collections::HashMap;
use std::fmt;
use std::ops::AddAssign;

use thiserror::Error;

use crate::frame::{
    self, ByteOrder, ChannelId, ClockState, Correction, CorrectionPolicy, FrameError,
};
use crate::storage::{Storage, StorageError};
use crate::trace::{debug, info, warn};

pub use metadata::OutputMetadata;
pub use registry::{ChannelContext, Registry, RegistryError, StationContext};
pub use writer::Append;

/// How raw frames are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOptions {
    pub byte_order: ByteOrder,
    pub check_crc: bool,
    pub correction: CorrectionPolicy,
    pub max_stations: usize,
    pub max_channels: usize,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::Little,
            check_crc: true,
            correction: CorrectionPolicy::Current,
            max_stations: registry::DEFAULT_MAX_STATIONS,
            max_channels: registry::DEFAULT_MAX_CHANNELS,
        }
    }
}

/// Why a frame did not make it into the output.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("write failed: {0}")]
    Storage(#[from] StorageError),
}

/// Successful outcome of [`Dataset::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Written { channel: ChannelId, offset: u64 },
    /// Valid frame that predates its channel's origin.
    BeforeOrigin { channel: ChannelId },
}

/// Per-output frame accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatasetCounters {
    pub processed: u64,
    pub bad_crc: u64,
    pub rejected: u64,
    pub before_origin: u64,
    pub written: u64,
}

impl AddAssign for DatasetCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.processed += rhs.processed;
        self.bad_crc += rhs.bad_crc;
        self.rejected += rhs.rejected;
        self.before_origin += rhs.before_origin;
        self.written += rhs.written;
    }
}

impl fmt::Display for DatasetCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed {}, broken header {}, rejected {}, before origin {}, written {}",
            self.processed, self.bad_crc, self.rejected, self.before_origin, self.written
        )
    }
}

/// An open output plus the state needed to keep appending to it.
pub struct Dataset<S: Storage> {
    name: String,
    storage: S,
    registry: Registry,
    options: ProcessOptions,
    clocks: HashMap<ChannelId, ClockState>,
    payload: Vec<i16>,
    counters: DatasetCounters,
    warned_rate: bool,
}

impl<S: Storage> Dataset<S> {
    /// Wraps a freshly created output and writes its root attributes.
    ///
    /// # Errors
    ///
    /// Propagates attribute write failures.
    pub fn create(
        mut storage: S,
        name: &str,
        meta: &OutputMetadata,
        options: ProcessOptions,
    ) -> Result<Self, StorageError> {
        metadata::write_root(&mut storage, name, meta)?;
        info!(output = name, "created output");

        Ok(Self {
            name: name.to_owned(),
            storage,
            registry: Registry::new(options.max_stations, options.max_channels),
            options,
            clocks: HashMap::new(),
            payload: Vec::with_capacity(frame::DEFAULT_SAMPLES_PER_FRAME),
            counters: DatasetCounters::default(),
            warned_rate: false,
        })
    }

    /// Runs one raw frame through the pipeline.
    ///
    /// # Errors
    ///
    /// Returns the reason the frame was discarded. The dataset stays usable.
    pub fn process(&mut self, raw: &[u8]) -> Result<Processed, ProcessError> {
        self.counters.processed += 1;
        let result = self.process_frame(raw);
        match &result {
            Ok(Processed::Written { .. }) => self.counters.written += 1,
            Ok(Processed::BeforeOrigin { .. }) => self.counters.before_origin += 1,
            Err(ProcessError::Frame(FrameError::BadCrc { .. })) => self.counters.bad_crc += 1,
            Err(ProcessError::Registry(e)) if e.is_full() => {
                warn!(output = %self.name, error = %e, "dropping frame");
                self.counters.rejected += 1;
            }
            Err(_e) => {
                debug!(output = %self.name, error = %_e, "rejected frame");
                self.counters.rejected += 1;
            }
        }
        result
    }

    fn process_frame(&mut self, raw: &[u8]) -> Result<Processed, ProcessError> {
        let (mut header, _) = frame::decode(raw, self.options.byte_order, self.options.check_crc)?;
        let channel = header.channel_id();

        let clock = self.clocks.entry(channel).or_default();
        let correction = frame::correct(&mut header, self.options.correction, clock);
        if let Correction::UnsupportedRate(_mhz) = correction {
            if !self.warned_rate {
                warn!(output = %self.name, mhz = _mhz, "unsupported sample rate, timestamps left uncorrected");
                self.warned_rate = true;
            }
        }

        frame::read_payload(raw, &header, self.options.byte_order, &mut self.payload)?;

        let ctx = self.registry.resolve(&mut self.storage, &header)?;
        match writer::append(&mut self.storage, ctx, &header, &self.payload)? {
            Append::Written { offset, .. } => Ok(Processed::Written { channel, offset }),
            Append::BeforeOrigin { .. } => Ok(Processed::BeforeOrigin { channel }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn counters(&self) -> DatasetCounters {
        self.counters
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    /// Closes every channel array and the output, logging its summary.
    ///
    /// # Errors
    ///
    /// Propagates backend close failures.
    pub fn close(mut self) -> Result<DatasetCounters, StorageError> {
        for ctx in self.registry.channels() {
            self.storage.close_array(ctx.array)?;
        }
        self.storage.close()?;
        info!(
            output = %self.name,
            stations = self.registry.station_count(),
            channels = self.registry.channel_count(),
            "closed output: {}",
            self.counters
        );
        Ok(self.counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Header, encode};
    use crate::storage::{MemoryFactory, MemoryStorage, StorageFactory};

    fn frame(header: Header, fill: i16) -> Vec<u8> {
        let payload = vec![fill; usize::from(header.samples_per_frame)];
        let mut raw = Vec::new();
        encode(&header.with_valid_crc(), &payload, ByteOrder::Little, &mut raw);
        raw
    }

    fn header(station: u8, second: i32, sample: u32) -> Header {
        Header {
            station,
            board: 1,
            receiver: 2,
            epoch_second: second,
            sample_offset: sample,
            ..Header::default()
        }
    }

    fn dataset(correction: CorrectionPolicy) -> Dataset<MemoryStorage> {
        let options = ProcessOptions {
            correction,
            ..ProcessOptions::default()
        };
        Dataset::create(MemoryStorage::new(), "test", &OutputMetadata::default(), options).unwrap()
    }

    #[test]
    fn counts_every_outcome() {
        let mut ds = dataset(CorrectionPolicy::Off);

        assert!(matches!(
            ds.process(&frame(header(1, 100, 1024), 5)),
            Ok(Processed::Written { offset: 0, .. })
        ));
        assert!(matches!(
            ds.process(&frame(header(1, 100, 0), 5)),
            Ok(Processed::BeforeOrigin { .. })
        ));

        let mut broken = frame(header(1, 100, 2048), 5);
        broken[0] ^= 0x10;
        assert!(matches!(
            ds.process(&broken),
            Err(ProcessError::Frame(FrameError::BadCrc { .. }))
        ));
        assert!(matches!(
            ds.process(&broken[..40]),
            Err(ProcessError::Frame(FrameError::Truncated { .. }))
        ));

        let counters = ds.counters();
        assert_eq!(
            counters,
            DatasetCounters {
                processed: 4,
                bad_crc: 1,
                rejected: 1,
                before_origin: 1,
                written: 1,
            }
        );
    }

    #[test]
    fn current_correction_applies_before_offsets() {
        let mut ds = dataset(CorrectionPolicy::Current);

        // Even second: both frames shift by 512, relative offset unchanged.
        ds.process(&frame(header(1, 100, 0), 1)).unwrap();
        let second = ds.process(&frame(header(1, 100, 1024), 2)).unwrap();
        assert!(matches!(second, Processed::Written { offset: 1024, .. }));

        let ctx = ds.registry().channels().next().unwrap();
        assert_eq!(ctx.origin_sample, 512);
    }

    #[test]
    fn legacy_state_is_per_channel() {
        let mut ds = dataset(CorrectionPolicy::Legacy);

        // Station 1 sees an odd second and arms its carry flag.
        ds.process(&frame(header(1, 101, 0), 1)).unwrap();
        // Station 2's first frame sits on the carry sentinel but must not
        // inherit station 1's flag.
        ds.process(&frame(header(2, 102, 199_998_464), 1)).unwrap();

        let ctx = ds.registry().channel(header(2, 0, 0).channel_id()).unwrap();
        assert_eq!((ctx.origin_second, ctx.origin_sample), (102, 199_998_464));
    }

    #[test]
    fn extreme_timestamps_are_counted_not_fatal() {
        let mut legacy = dataset(CorrectionPolicy::Legacy);
        let oldest = Header {
            sample_freq_mhz: 160,
            ..header(1, i32::MIN, 159_998_976)
        };
        assert!(matches!(
            legacy.process(&frame(oldest, 1)),
            Ok(Processed::Written { offset: 0, .. })
        ));
        let ctx = legacy.registry().channel(oldest.channel_id()).unwrap();
        assert_eq!(ctx.origin_second, i32::MAX);

        // Two seconds past the origin is further than the memory backend
        // will allocate.
        legacy.process(&frame(header(3, 100, 0), 1)).unwrap();
        assert!(matches!(
            legacy.process(&frame(header(3, 102, 0), 1)),
            Err(ProcessError::Storage(StorageError::TooLarge { .. }))
        ));
        assert_eq!(legacy.counters().rejected, 1);
        assert_eq!(legacy.counters().written, 2);

        let mut current = dataset(CorrectionPolicy::Current);
        current.process(&frame(header(2, 100, u32::MAX - 10), 1)).unwrap();
        let ctx = current.registry().channels().next().unwrap();
        assert_eq!(ctx.origin_sample, 501);
    }

    #[test]
    fn close_marks_output_closed() {
        let factory = MemoryFactory::new();
        let storage = factory.create("closing").unwrap();
        let mut ds = Dataset::create(
            storage,
            "closing",
            &OutputMetadata::default(),
            ProcessOptions::default(),
        )
        .unwrap();
        ds.process(&frame(header(4, 11, 0), 3)).unwrap();
        assert_eq!(ds.storage().snapshot().array_count(), 1);

        let counters = ds.close().unwrap();
        assert_eq!(counters.written, 1);

        let output = factory.output("closing").unwrap();
        assert!(output.closed);
        assert!(output.array("Station004", "004001002").unwrap().closed);
    }
}
