//! Capture threads.
//!
//! One thread per source. Each thread binds its socket, reports readiness to
//! the session, then moves through
//! `Binding → WaitingForFirstData → Streaming → Stopped`, copying every
//! datagram into the shared ring. Nothing here decodes frames.

use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::config::{IngestConfig, SourceConfig};
use crate::frame::DATAGRAM_BUFFER_SIZE;
use crate::net::{Endpoint, UdpSocket};
use crate::sync::ring::{Producer, Push};
use crate::trace::{debug, info, trace, warn};

const SOCKET: Token = Token(0);
const WAKE: Token = Token(1);

/// Lifecycle of a capture thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Binding,
    WaitingForFirstData,
    Streaming,
    Stopped,
}

/// Why a capture thread reached [`CaptureState::Stopped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The session's stop flag was set.
    Shutdown,
    /// No datagram within the read timeout while streaming.
    ReadTimeout,
    BindFailed,
    /// The poller itself failed.
    PollFailed,
}

/// What a capture thread did, returned when it is joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureReport {
    pub endpoint: Endpoint,
    pub received: u64,
    /// Datagrams this thread could not store because the ring was full.
    pub dropped: u64,
    /// Whether the thread ever reached [`CaptureState::Streaming`].
    pub streamed: bool,
    pub reason: StopReason,
}

/// Per-thread timing and sizing, copied out of [`IngestConfig`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct CaptureSettings {
    pub start_timeout: Option<Duration>,
    pub read_timeout: Duration,
    pub wait_granularity: Duration,
    pub stay_connected: bool,
    pub frame_size: usize,
}

impl CaptureSettings {
    pub(crate) fn from_config(config: &IngestConfig) -> Self {
        Self {
            start_timeout: config.start_timeout,
            read_timeout: config.read_timeout,
            wait_granularity: config.wait_granularity,
            stay_connected: config.stay_connected,
            frame_size: config.frame_size,
        }
    }

    /// Receive buffer size; one byte over the frame size so oversized
    /// datagrams are noticed.
    pub(crate) fn slot_size(&self) -> usize {
        DATAGRAM_BUFFER_SIZE.max(self.frame_size + 1)
    }
}

/// Readiness message: source index plus the bound endpoint and a waker.
pub(crate) type Ready = (usize, io::Result<(Endpoint, Arc<Waker>)>);

/// Counts live capture threads; decrements when dropped.
pub(crate) struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    pub(crate) fn register(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(active))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Spawns the capture thread for `source`.
///
/// The thread sends exactly one [`Ready`] message, whether or not binding
/// succeeds.
pub(crate) fn spawn(
    index: usize,
    source: SourceConfig,
    settings: CaptureSettings,
    producer: Producer,
    stop: Arc<AtomicBool>,
    active: ActiveGuard,
    ready: Sender<Ready>,
) -> io::Result<JoinHandle<CaptureReport>> {
    thread::Builder::new()
        .name(format!("tbb-capture-{}", source.endpoint.port()))
        .spawn(move || {
            let _active = active;
            debug!(endpoint = %source.endpoint, state = ?CaptureState::Binding, "capture thread started");

            let capture = match Capture::bind(source, settings, producer, stop) {
                Ok(capture) => capture,
                Err(e) => {
                    warn!(endpoint = %source.endpoint, error = %e, "failed to bind capture socket");
                    let _ = ready.send((index, Err(e)));
                    return CaptureReport {
                        endpoint: source.endpoint,
                        received: 0,
                        dropped: 0,
                        streamed: false,
                        reason: StopReason::BindFailed,
                    };
                }
            };

            let _ = ready.send((index, Ok((capture.endpoint, Arc::clone(&capture.waker)))));
            drop(ready);
            capture.run()
        })
}

enum Wake {
    Readable,
    TimedOut,
    /// Interrupted, or woken for shutdown.
    Spurious,
}

struct Capture {
    endpoint: Endpoint,
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    settings: CaptureSettings,
    producer: Producer,
    stop: Arc<AtomicBool>,
    buf: Vec<u8>,
    state: CaptureState,
    received: u64,
    dropped: u64,
}

impl Capture {
    fn bind(
        source: SourceConfig,
        settings: CaptureSettings,
        producer: Producer,
        stop: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let mut socket = UdpSocket::bind(source.endpoint)?;
        if let Some(size) = source.recv_buffer {
            match socket.set_recv_buffer_size(size) {
                Ok(()) => {
                    debug!(
                        endpoint = %source.endpoint,
                        requested = size,
                        granted = socket.recv_buffer_size().unwrap_or(0),
                        "receive buffer set"
                    );
                }
                Err(_e) => {
                    warn!(endpoint = %source.endpoint, error = %_e, "could not set receive buffer");
                }
            }
        }
        let endpoint = socket.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);

        Ok(Self {
            endpoint,
            socket,
            poll,
            events: Events::with_capacity(8),
            waker,
            settings,
            producer,
            stop,
            buf: vec![0u8; settings.slot_size()],
            state: CaptureState::Binding,
            received: 0,
            dropped: 0,
        })
    }

    fn run(mut self) -> CaptureReport {
        let reason = self.wait_then_stream().unwrap_or_else(|_e| {
            warn!(endpoint = %self.endpoint, error = %_e, "poll failed");
            StopReason::PollFailed
        });
        let streamed = self.state == CaptureState::Streaming;
        self.transition(CaptureState::Stopped);
        info!(
            endpoint = %self.endpoint,
            received = self.received,
            dropped = self.dropped,
            reason = ?reason,
            "capture stopped"
        );

        CaptureReport {
            endpoint: self.endpoint,
            received: self.received,
            dropped: self.dropped,
            streamed,
            reason,
        }
    }

    fn wait_then_stream(&mut self) -> io::Result<StopReason> {
        self.transition(CaptureState::WaitingForFirstData);
        if let Some(reason) = self.wait_for_first_data()? {
            return Ok(reason);
        }
        self.transition(CaptureState::Streaming);
        self.stream()
    }

    /// Returns `Some` if the thread should stop without streaming.
    ///
    /// An expired start timeout is not a stop: the thread goes on streaming
    /// and the read timeout takes over.
    fn wait_for_first_data(&mut self) -> io::Result<Option<StopReason>> {
        let started = Instant::now();
        loop {
            if self.stopping() {
                return Ok(Some(StopReason::Shutdown));
            }

            let mut slice = self.settings.wait_granularity;
            if let Some(limit) = self.settings.start_timeout {
                let waited = started.elapsed();
                if waited >= limit {
                    info!(endpoint = %self.endpoint, "no data within start timeout");
                    return Ok(None);
                }
                slice = slice.min(limit - waited);
            }

            if matches!(self.wait(slice)?, Wake::Readable) {
                info!(endpoint = %self.endpoint, "first data arrived");
                return Ok(None);
            }
        }
    }

    fn stream(&mut self) -> io::Result<StopReason> {
        loop {
            let burst = self.drain_socket();
            if burst > 0 {
                self.producer.record_backlog(burst);
            }
            if self.stopping() {
                return Ok(StopReason::Shutdown);
            }

            match self.wait(self.settings.read_timeout)? {
                Wake::Readable | Wake::Spurious => {}
                Wake::TimedOut if self.settings.stay_connected => {
                    trace!(endpoint = %self.endpoint, "read timeout, staying connected");
                }
                Wake::TimedOut => return Ok(StopReason::ReadTimeout),
            }
        }
    }

    /// Receives until the socket would block; returns the burst length.
    fn drain_socket(&mut self) -> usize {
        let mut burst = 0;
        while !self.stopping() {
            match self.socket.try_recv_from(&mut self.buf) {
                Ok(Some((len, _from))) => {
                    burst += 1;
                    self.received += 1;
                    if len != self.settings.frame_size {
                        debug!(
                            endpoint = %self.endpoint,
                            from = %_from,
                            len,
                            expected = self.settings.frame_size,
                            "unexpected datagram size"
                        );
                    }
                    if self.producer.push(&self.buf[..len]) == Push::Dropped {
                        self.dropped += 1;
                        trace!(endpoint = %self.endpoint, "ring full, datagram dropped");
                    }
                }
                Ok(None) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_e) => {
                    warn!(endpoint = %self.endpoint, error = %_e, "receive failed");
                    break;
                }
            }
        }
        burst
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<Wake> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(Wake::Spurious),
            Err(e) => return Err(e),
        }
        if self.events.is_empty() {
            return Ok(Wake::TimedOut);
        }
        if self.events.iter().any(|event| event.token() == SOCKET) {
            Ok(Wake::Readable)
        } else {
            Ok(Wake::Spurious)
        }
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn transition(&mut self, next: CaptureState) {
        debug!(endpoint = %self.endpoint, from = ?self.state, to = ?next, "capture state");
        self.state = next;
    }
}
