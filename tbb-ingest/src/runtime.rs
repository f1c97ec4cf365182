//! Ingestion runtime: capture threads, the drain loop and output routing.
//!
//! A socket session runs N capture threads feeding one [`sync::ring`] and a
//! single drain loop on the caller's thread:
//!
//! ```text
//!   UDP :31664 ──► tbb-capture-31664 ──┐
//!   UDP :31665 ──► tbb-capture-31665 ──┼──► FrameRing ──► drain loop ──► FrameSink ──► Dataset(s)
//!   ...                                ┘   (drop newest)   (caller)
//! ```
//!
//! Capture threads only copy datagrams into the ring. Everything that touches
//! storage happens in the drain loop through a [`FrameSink`]. File ingestion
//! ([`ingest_file`]) skips the ring and feeds a dataset directly.
//!
//! [`sync::ring`]: crate::sync::ring

mod capture;
mod file;
mod naming;
mod session;
mod sink;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::net::Endpoint;
use crate::storage::StorageError;

pub use capture::{CaptureReport, CaptureState, StopReason};
pub use file::ingest_file;
pub use naming::{timestamped_name, unique_name};
pub use session::Session;
pub use sink::{FrameSink, SingleOutput, StationOutputs};

/// Session-level failures. Per-frame problems never surface here.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("capture thread for {endpoint} exited before reporting")]
    CaptureExited { endpoint: Endpoint },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{} holds {len} bytes, less than one frame", path.display())]
    InputTooSmall { path: PathBuf, len: u64 },

    #[error(transparent)]
    Config(#[from] ConfigError),
}
