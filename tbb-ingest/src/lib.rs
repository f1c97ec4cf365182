//! Ingestion of raw LOFAR Transient Buffer Board frames.
//!
//! Frames arrive as UDP datagrams (or back-to-back in a file), are checked,
//! clock-corrected and appended to one extensible `i16` array per dipole
//! channel, grouped by station.

pub mod config;
pub mod dataset;
pub mod frame;
pub mod net;
pub mod runtime;
pub mod stats;
pub mod storage;
pub mod sync;
pub mod trace;

pub use config::{ConfigError, IngestConfig, SourceConfig};
pub use dataset::{Dataset, DatasetCounters, OutputMetadata, ProcessOptions};
pub use frame::{ByteOrder, ChannelId, CorrectionPolicy, FrameError, Header};
pub use runtime::{FrameSink, IngestError, Session, SingleOutput, StationOutputs, ingest_file};
pub use stats::IngestionStats;
pub use storage::{Storage, StorageError, StorageFactory};
