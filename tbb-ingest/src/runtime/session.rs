//! Socket ingestion session: capture thread startup and the drain loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use minstant::Instant;
use mio::Waker;

use crate::config::IngestConfig;
use crate::net::Endpoint;
use crate::stats::IngestionStats;
use crate::sync::ring::{self, Consumer};
use crate::trace::{debug, info, warn};

use super::IngestError;
use super::capture::{self, ActiveGuard, CaptureReport, CaptureSettings, Ready};
use super::sink::FrameSink;

/// A running set of capture threads plus the ring they feed.
///
/// [`Session::start`] returns only once every socket is bound, so a bind
/// failure never reaches the drain loop. [`Session::run`] drains the ring on
/// the calling thread until the session ends.
///
/// # Example
///
/// ```no_run
/// use std::sync::atomic::AtomicBool;
///
/// use tbb_ingest::config::IngestConfig;
/// use tbb_ingest::runtime::{Session, SingleOutput};
/// use tbb_ingest::storage::DirFactory;
///
/// let config = IngestConfig::default();
/// let mut sink = SingleOutput::new(
///     DirFactory::new("."),
///     "tbb",
///     config.metadata.clone(),
///     config.process,
/// );
/// let cancel = AtomicBool::new(false);
///
/// let session = Session::start(config)?;
/// let stats = session.run(&mut sink, &cancel)?;
/// println!("{stats}");
/// # Ok::<(), tbb_ingest::runtime::IngestError>(())
/// ```
pub struct Session {
    config: IngestConfig,
    consumer: Consumer,
    stop: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<CaptureReport>>,
    wakers: Vec<Arc<Waker>>,
    endpoints: Vec<Endpoint>,
}

impl Session {
    /// Validates `config`, allocates the ring and starts one capture thread
    /// per source.
    ///
    /// # Errors
    ///
    /// [`IngestError::Config`] for an invalid configuration, or
    /// [`IngestError::Bind`] / [`IngestError::Spawn`] if any source fails to
    /// start. All threads already started are stopped and joined first.
    pub fn start(config: IngestConfig) -> Result<Self, IngestError> {
        let config = config.validate()?;
        let settings = CaptureSettings::from_config(&config);
        let (producer, consumer) = ring::channel(config.buffer_frames, settings.slot_size());

        let mut session = Self {
            endpoints: config.sources.iter().map(|s| s.endpoint).collect(),
            consumer,
            stop: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
            handles: Vec::with_capacity(config.sources.len()),
            wakers: Vec::with_capacity(config.sources.len()),
            config,
        };

        let (ready_tx, ready_rx) = mpsc::channel::<Ready>();
        let mut failure = None;
        for (index, source) in session.config.sources.iter().enumerate() {
            let spawned = capture::spawn(
                index,
                *source,
                settings,
                producer.clone(),
                Arc::clone(&session.stop),
                ActiveGuard::register(&session.active),
                ready_tx.clone(),
            );
            match spawned {
                Ok(handle) => session.handles.push(handle),
                Err(e) => {
                    failure = Some(IngestError::Spawn(e));
                    break;
                }
            }
        }
        drop(ready_tx);
        drop(producer);

        let reported = session.collect_ready(&ready_rx);
        let failure = failure.or(reported);
        if let Some(error) = failure {
            session.shutdown();
            return Err(error);
        }

        info!(
            sources = session.endpoints.len(),
            capacity = session.consumer.capacity(),
            "capture threads ready"
        );
        Ok(session)
    }

    /// Waits for one readiness message per spawned thread and keeps the
    /// wakers. Returns the first startup failure.
    fn collect_ready(&mut self, ready: &mpsc::Receiver<Ready>) -> Option<IngestError> {
        let mut pending = vec![false; self.endpoints.len()];
        pending[..self.handles.len()].fill(true);
        let mut failure = None;

        while pending.contains(&true) {
            let Ok((index, bound)) = ready.recv() else {
                // Every sender is gone but some thread never reported.
                let index = pending.iter().position(|p| *p).unwrap_or(0);
                return failure.or(Some(IngestError::CaptureExited {
                    endpoint: self.endpoints[index],
                }));
            };
            pending[index] = false;
            match bound {
                Ok((endpoint, waker)) => {
                    self.endpoints[index] = endpoint;
                    self.wakers.push(waker);
                }
                Err(source) if failure.is_none() => {
                    failure = Some(IngestError::Bind {
                        endpoint: self.endpoints[index],
                        source,
                    });
                }
                Err(_) => {}
            }
        }
        failure
    }

    /// Bound address of each source, in configuration order.
    #[must_use]
    pub fn local_endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Flag that stops the session when set.
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Drains the ring into `sink` until every capture thread has stopped and
    /// the ring is empty.
    ///
    /// Setting `cancel` (or the [`stop_handle`](Self::stop_handle)) stops the
    /// capture threads; frames already in the ring are still drained. Unless
    /// the session waits for all sources or stays connected, an idle stretch
    /// longer than the read timeout after the first frame also ends it.
    ///
    /// The summary is logged however the session ends.
    ///
    /// # Errors
    ///
    /// Fatal sink errors (an output that cannot be created or closed). The
    /// capture threads are stopped and joined before returning.
    pub fn run<K: FrameSink + ?Sized>(mut self, sink: &mut K, cancel: &AtomicBool) -> Result<IngestionStats, IngestError> {
        let drained = self.drain(sink, cancel);
        self.shutdown();

        let finished = sink.finish();
        let mut stats = match &finished {
            Ok(stats) => *stats,
            Err(_) => IngestionStats::default(),
        };
        stats.ring = self.consumer.stats();
        info!("session ended\n{stats}");

        drained?;
        finished?;
        Ok(stats)
    }

    fn drain<K: FrameSink + ?Sized>(&mut self, sink: &mut K, cancel: &AtomicBool) -> Result<(), IngestError> {
        let read_timeout = self.config.read_timeout;
        let ends_when_idle = !self.config.wait_for_all && !self.config.stay_connected;
        let mut idle_since: Option<Instant> = None;
        let mut idle_reported = false;
        let mut drained_any = false;

        loop {
            if cancel.load(Ordering::Acquire) && !self.stopping() {
                info!("shutdown requested");
                self.signal_stop();
            }

            if let Some(result) = self.consumer.pop_with(|raw| sink.accept(raw)) {
                result?;
                drained_any = true;
                idle_since = None;
                idle_reported = false;
                continue;
            }

            if self.active.load(Ordering::Acquire) == 0 {
                // A producer may have published just before exiting.
                if self.consumer.is_empty() {
                    return Ok(());
                }
                continue;
            }

            let since = *idle_since.get_or_insert_with(Instant::now);
            thread::sleep(self.config.idle_sleep);
            if since.elapsed() <= read_timeout {
                continue;
            }

            if !idle_reported {
                idle_reported = true;
                sink.idle()?;
            }
            if ends_when_idle && drained_any && !self.stopping() {
                info!(
                    idle_ms = since.elapsed().as_millis() as u64,
                    "no data within read timeout, ending session"
                );
                self.signal_stop();
            }
        }
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
        for waker in &self.wakers {
            if let Err(_e) = waker.wake() {
                warn!(error = %_e, "failed to wake capture thread");
            }
        }
    }

    /// Stops and joins every capture thread.
    fn shutdown(&mut self) {
        self.signal_stop();
        for handle in self.handles.drain(..) {
            match handle.join() {
                Ok(_report) => {
                    debug!(
                        endpoint = %_report.endpoint,
                        received = _report.received,
                        dropped = _report.dropped,
                        reason = ?_report.reason,
                        "capture thread joined"
                    );
                }
                Err(_) => {
                    warn!("capture thread panicked");
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
