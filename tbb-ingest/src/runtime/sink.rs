//! Where drained frames go.
//!
//! The drain loop hands every raw frame to a [`FrameSink`]. [`SingleOutput`]
//! writes one output per session; [`StationOutputs`] keeps one output per
//! station and rolls it over after a gap in that station's data.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::dataset::{Dataset, OutputMetadata, ProcessOptions};
use crate::frame::Header;
use crate::stats::IngestionStats;
use crate::storage::{Storage, StorageFactory};
use crate::trace::{debug, info};

use super::IngestError;
use super::naming::{timestamped_name, unique_name};

/// Consumer side of a socket session.
pub trait FrameSink {
    /// Handles one raw frame. Per-frame failures are counted, not returned;
    /// an error here ends the session.
    ///
    /// # Errors
    ///
    /// Failure to create or close an output.
    fn accept(&mut self, raw: &[u8]) -> Result<(), IngestError>;

    /// Called once per idle stretch longer than the read timeout.
    ///
    /// # Errors
    ///
    /// Failure to close an output.
    fn idle(&mut self) -> Result<(), IngestError> {
        Ok(())
    }

    /// Closes everything still open and returns the totals.
    ///
    /// # Errors
    ///
    /// Failure to close an output.
    fn finish(&mut self) -> Result<IngestionStats, IngestError>;
}

/// Writes the whole session into one output, named after its first frame.
pub struct SingleOutput<F: StorageFactory> {
    factory: F,
    prefix: String,
    metadata: OutputMetadata,
    options: ProcessOptions,
    dataset: Option<Dataset<F::Output>>,
    stats: IngestionStats,
}

impl<F: StorageFactory> SingleOutput<F> {
    pub fn new(factory: F, prefix: impl Into<String>, metadata: OutputMetadata, options: ProcessOptions) -> Self {
        Self {
            factory,
            prefix: prefix.into(),
            metadata,
            options,
            dataset: None,
            stats: IngestionStats::default(),
        }
    }

    /// Name of the open output, if one has been created.
    #[must_use]
    pub fn output_name(&self) -> Option<&str> {
        self.dataset.as_ref().map(Dataset::name)
    }

    fn open(&self, header: &Header) -> Result<Dataset<F::Output>, IngestError> {
        let base = timestamped_name(&self.prefix, header, None);
        let name = unique_name(&base, |n| self.factory.exists(n));
        let storage = self.factory.create(&name)?;
        Ok(Dataset::create(storage, &name, &self.metadata, self.options)?)
    }
}

impl<F: StorageFactory> FrameSink for SingleOutput<F> {
    fn accept(&mut self, raw: &[u8]) -> Result<(), IngestError> {
        if self.dataset.is_none() {
            let Ok(header) = Header::parse(raw, self.options.byte_order) else {
                self.stats.unrouted += 1;
                return Ok(());
            };
            self.dataset = Some(self.open(&header)?);
        }
        if let Some(dataset) = &mut self.dataset {
            // Outcome already counted by the dataset.
            let _ = dataset.process(raw);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<IngestionStats, IngestError> {
        if let Some(dataset) = self.dataset.take() {
            let counters = dataset.close()?;
            self.stats.absorb(counters);
        }
        Ok(std::mem::take(&mut self.stats))
    }
}

struct StationOutput<S: Storage> {
    dataset: Dataset<S>,
    /// Raw epoch second of the last frame this output accepted.
    last_second: i32,
}

/// One output per station, demultiplexed from shared ports.
///
/// A station's output is closed and replaced when a frame arrives more than
/// `ceil(read_timeout)` seconds after the last frame it accepted. Idle
/// stretches close every open output.
pub struct StationOutputs<F: StorageFactory> {
    factory: F,
    prefix: String,
    metadata: OutputMetadata,
    options: ProcessOptions,
    gap_seconds: i64,
    outputs: BTreeMap<u8, StationOutput<F::Output>>,
    stats: IngestionStats,
}

impl<F: StorageFactory> StationOutputs<F> {
    pub fn new(
        factory: F,
        prefix: impl Into<String>,
        metadata: OutputMetadata,
        options: ProcessOptions,
        read_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            prefix: prefix.into(),
            metadata,
            options,
            gap_seconds: read_timeout.as_secs_f64().ceil() as i64,
            outputs: BTreeMap::new(),
            stats: IngestionStats::default(),
        }
    }

    /// Number of station outputs currently open.
    #[must_use]
    pub fn open_outputs(&self) -> usize {
        self.outputs.len()
    }

    fn open(&self, header: &Header) -> Result<Dataset<F::Output>, IngestError> {
        let base = timestamped_name(&self.prefix, header, Some(header.station));
        let name = unique_name(&base, |n| self.factory.exists(n));
        let storage = self.factory.create(&name)?;
        Ok(Dataset::create(storage, &name, &self.metadata, self.options)?)
    }

    fn close(&mut self, station: u8) -> Result<(), IngestError> {
        if let Some(output) = self.outputs.remove(&station) {
            let counters = output.dataset.close()?;
            self.stats.absorb(counters);
        }
        Ok(())
    }

    fn close_all(&mut self) -> Result<(), IngestError> {
        while let Some((_, output)) = self.outputs.pop_first() {
            let counters = output.dataset.close()?;
            self.stats.absorb(counters);
        }
        Ok(())
    }
}

impl<F: StorageFactory> FrameSink for StationOutputs<F> {
    fn accept(&mut self, raw: &[u8]) -> Result<(), IngestError> {
        let Ok(header) = Header::parse(raw, self.options.byte_order) else {
            self.stats.unrouted += 1;
            return Ok(());
        };
        let station = header.station;

        if let Some(output) = self.outputs.get(&station)
            && i64::from(header.epoch_second) > i64::from(output.last_second) + self.gap_seconds
        {
            info!(
                station,
                last = output.last_second,
                now = header.epoch_second,
                "gap in station data, starting a new output"
            );
            self.close(station)?;
        }

        if !self.outputs.contains_key(&station) {
            let dataset = self.open(&header)?;
            self.outputs.insert(
                station,
                StationOutput {
                    dataset,
                    last_second: header.epoch_second,
                },
            );
        }

        let Some(output) = self.outputs.get_mut(&station) else {
            return Ok(());
        };
        if output.dataset.process(raw).is_ok() {
            output.last_second = header.epoch_second;
        }
        Ok(())
    }

    fn idle(&mut self) -> Result<(), IngestError> {
        if !self.outputs.is_empty() {
            debug!(open = self.outputs.len(), "idle, closing station outputs");
            self.close_all()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<IngestionStats, IngestError> {
        self.close_all()?;
        Ok(std::mem::take(&mut self.stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ByteOrder, encode};
    use crate::storage::MemoryFactory;

    fn frame(station: u8, second: i32, sample: u32) -> Vec<u8> {
        frame_for(station, 1, second, sample)
    }

    fn frame_for(station: u8, receiver: u8, second: i32, sample: u32) -> Vec<u8> {
        let header = Header {
            station,
            board: 0,
            receiver,
            epoch_second: second,
            sample_offset: sample,
            ..Header::default()
        }
        .with_valid_crc();
        let payload = vec![i16::from(station); usize::from(header.samples_per_frame)];
        let mut raw = Vec::new();
        encode(&header, &payload, ByteOrder::Little, &mut raw);
        raw
    }

    #[test]
    fn single_output_is_named_after_first_frame() {
        let factory = MemoryFactory::new();
        let mut sink = SingleOutput::new(
            factory.clone(),
            "obs",
            OutputMetadata::default(),
            ProcessOptions::default(),
        );

        sink.accept(&[0u8; 10]).unwrap();
        assert_eq!(sink.output_name(), None);

        sink.accept(&frame(1, 1_262_304_000, 0)).unwrap();
        sink.accept(&frame(2, 1_262_304_000, 0)).unwrap();
        assert_eq!(sink.output_name(), Some("obs-20100101T000000.000Z"));

        let stats = sink.finish().unwrap();
        assert_eq!(stats.outputs, 1);
        assert_eq!(stats.unrouted, 1);
        assert_eq!(stats.frames.written, 2);
        assert_eq!(factory.names(), vec!["obs-20100101T000000.000Z".to_owned()]);
    }

    #[test]
    fn single_output_avoids_taken_names() {
        let factory = MemoryFactory::new();
        factory.create("obs-19700101T000010.000Z").unwrap();

        let mut sink = SingleOutput::new(
            factory.clone(),
            "obs",
            OutputMetadata::default(),
            ProcessOptions::default(),
        );
        sink.accept(&frame(1, 10, 0)).unwrap();
        assert_eq!(sink.output_name(), Some("obs-19700101T000010.000Z-0"));
    }

    #[test]
    fn stations_get_separate_outputs() {
        let factory = MemoryFactory::new();
        let mut sink = StationOutputs::new(
            factory.clone(),
            "m",
            OutputMetadata::default(),
            ProcessOptions::default(),
            Duration::from_millis(500),
        );

        sink.accept(&frame(3, 20, 0)).unwrap();
        sink.accept(&frame(5, 20, 0)).unwrap();
        sink.accept(&frame(3, 20, 1024)).unwrap();
        assert_eq!(sink.open_outputs(), 2);

        let stats = sink.finish().unwrap();
        assert_eq!(stats.outputs, 2);
        assert_eq!(stats.frames.written, 3);

        let out3 = factory.output("m-19700101T000020.000Z-003").unwrap();
        assert!(out3.groups.contains_key("Station003"));
        assert!(!out3.groups.contains_key("Station005"));
        assert_eq!(out3.array("Station003", "003000001").unwrap().data.len(), 2048);
    }

    #[test]
    fn gap_rolls_station_over() {
        let factory = MemoryFactory::new();
        let mut sink = StationOutputs::new(
            factory.clone(),
            "m",
            OutputMetadata::default(),
            ProcessOptions::default(),
            Duration::from_millis(500),
        );

        // A fresh receiver per frame keeps every write at offset 0.
        sink.accept(&frame_for(3, 1, 20, 0)).unwrap();
        // Within ceil(0.5) = 1 second: same output.
        sink.accept(&frame_for(3, 2, 21, 0)).unwrap();
        assert_eq!(factory.names().len(), 1);
        // Two seconds after the last accepted frame: new output.
        sink.accept(&frame_for(3, 3, 23, 0)).unwrap();
        assert_eq!(factory.names().len(), 2);
        assert!(factory.output("m-19700101T000020.000Z-003").unwrap().closed);

        let stats = sink.finish().unwrap();
        assert_eq!(stats.outputs, 2);
    }

    #[test]
    fn idle_closes_station_outputs() {
        let factory = MemoryFactory::new();
        let mut sink = StationOutputs::new(
            factory.clone(),
            "m",
            OutputMetadata::default(),
            ProcessOptions::default(),
            Duration::from_secs(1),
        );
        sink.accept(&frame(7, 40, 0)).unwrap();
        sink.idle().unwrap();
        assert_eq!(sink.open_outputs(), 0);
        assert!(factory.output("m-19700101T000040.000Z-007").unwrap().closed);

        sink.accept(&frame(7, 40, 1024)).unwrap();
        assert_eq!(factory.names().len(), 2);
        assert_eq!(sink.finish().unwrap().outputs, 2);
    }
}
