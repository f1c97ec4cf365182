//! Session configuration.

use std::time::Duration;

use thiserror::Error;

use crate::dataset::{OutputMetadata, ProcessOptions};
use crate::frame::FRAME_SIZE;
use crate::net::Endpoint;
use crate::trace::warn;

/// Default ring capacity in frames (about 100 MB of datagram slots).
pub const DEFAULT_BUFFER_FRAMES: usize = 50_000;

/// Smallest ring capacity accepted; anything below falls back to the default.
pub const MIN_BUFFER_FRAMES: usize = 100;

/// Default UDP port TBB boards send to.
pub const DEFAULT_PORT: u16 = 31664;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("no input: give an input file or at least one port")]
    NoInput,

    #[error("no capture sources configured")]
    NoSources,

    #[error("invalid {name} timeout: {value} s")]
    InvalidTimeout { name: &'static str, value: f64 },

    #[error("output name must not be empty")]
    EmptyOutput,
}

/// One capture socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceConfig {
    pub endpoint: Endpoint,
    /// Kernel receive buffer to request, if any.
    pub recv_buffer: Option<usize>,
}

impl SourceConfig {
    #[must_use]
    pub const fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            recv_buffer: None,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::new(Endpoint::any(DEFAULT_PORT))
    }
}

/// Settings for one socket ingestion session.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub sources: Vec<SourceConfig>,
    /// How long a capture thread waits for its first datagram. `None` waits
    /// until shutdown.
    pub start_timeout: Option<Duration>,
    /// Gap after which a streaming capture thread stops and the drain loop
    /// considers the session idle.
    pub read_timeout: Duration,
    /// Poll slice while waiting for first data.
    pub wait_granularity: Duration,
    /// Drain loop sleep when the ring is empty.
    pub idle_sleep: Duration,
    /// Ring capacity in frames.
    pub buffer_frames: usize,
    /// Datagram size the sources are expected to send.
    pub frame_size: usize,
    /// Disable idle termination in the drain loop.
    pub wait_for_all: bool,
    /// Keep capture threads alive across read timeouts.
    pub stay_connected: bool,
    pub process: ProcessOptions,
    pub metadata: OutputMetadata,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sources: vec![SourceConfig::default()],
            start_timeout: None,
            read_timeout: Duration::from_millis(500),
            wait_granularity: Duration::from_secs(5),
            idle_sleep: Duration::from_millis(100),
            buffer_frames: DEFAULT_BUFFER_FRAMES,
            frame_size: FRAME_SIZE,
            wait_for_all: false,
            stay_connected: false,
            process: ProcessOptions::default(),
            metadata: OutputMetadata::default(),
        }
    }
}

impl IngestConfig {
    /// Checks the configuration and normalises a too-small ring capacity.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NoSources`] or [`ConfigError::InvalidTimeout`].
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout {
                name: "read",
                value: 0.0,
            });
        }
        if self.buffer_frames < MIN_BUFFER_FRAMES {
            warn!(
                requested = self.buffer_frames,
                default = DEFAULT_BUFFER_FRAMES,
                "buffer size too small, using default"
            );
            self.buffer_frames = DEFAULT_BUFFER_FRAMES;
        }
        Ok(self)
    }
}

/// Converts a start timeout in seconds; zero or negative means wait forever.
///
/// # Errors
///
/// Non-finite input.
pub fn start_timeout_from_secs(secs: f64) -> Result<Option<Duration>, ConfigError> {
    if !secs.is_finite() {
        return Err(ConfigError::InvalidTimeout {
            name: "start",
            value: secs,
        });
    }
    if secs <= 0.0 {
        return Ok(None);
    }
    Ok(Some(Duration::from_secs_f64(secs)))
}

/// Converts a read timeout in seconds, which must be positive.
///
/// # Errors
///
/// Zero, negative or non-finite input.
pub fn read_timeout_from_secs(secs: f64) -> Result<Duration, ConfigError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::InvalidTimeout {
            name: "read",
            value: secs,
        });
    }
    Ok(Duration::from_secs_f64(secs))
}
