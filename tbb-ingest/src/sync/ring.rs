//! Bounded multi-producer / single-consumer frame ring.
//!
//! Capture threads copy datagrams into fixed-size byte slots; the drain
//! thread reads them in place. Producers serialise on one mutex: under it
//! they pick the next slot, detect overflow, copy, and publish the new write
//! index. The consumer never takes the lock. It loads the write index to see
//! whether anything is pending, processes the slot after its read index,
//! then advances the read index.
//!
//! When the ring is full the incoming frame is dropped and counted. Buffered
//! frames are never overwritten.
//!
//! # Example
//!
//! ```
//! use tbb_ingest::sync::ring::{self, Push};
//!
//! let (producer, consumer) = ring::channel(2, 16);
//! assert_eq!(producer.push(b"one"), Push::Stored);
//! assert_eq!(producer.push(b"two"), Push::Stored);
//! assert_eq!(producer.push(b"three"), Push::Dropped);
//!
//! assert_eq!(consumer.pop_with(|frame| frame.to_vec()), Some(b"one".to_vec()));
//! assert_eq!(consumer.stats().dropped, 1);
//! ```

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Result of [`Producer::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Stored,
    /// Ring full; the frame was discarded.
    Dropped,
}

/// Snapshot of ring counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub stored: u64,
    pub dropped: u64,
    /// Largest number of datagrams a producer reported pending in one burst.
    pub max_backlog: usize,
    /// Largest number of unread frames the consumer saw.
    pub max_occupancy: usize,
}

struct SlotBuf {
    len: usize,
    bytes: Box<[u8]>,
}

/// Counters owned by the producer lock.
#[derive(Default)]
struct ProducerSide {
    stored: u64,
    dropped: u64,
    max_backlog: usize,
}

struct FrameRing {
    slots: Box<[UnsafeCell<SlotBuf>]>,
    /// Index of the last published slot. Written under `producers`.
    write: AtomicUsize,
    /// Index of the last consumed slot. Written only by the consumer.
    read: AtomicUsize,
    producers: Mutex<ProducerSide>,
    max_occupancy: AtomicUsize,
}

// SAFETY: slot contents are only touched by (a) the producer holding the
// `producers` lock, for the one slot after `write`, which is never in the
// consumer's published range, and (b) the single consumer, for slots in
// `(read, write]`, which no producer writes until `read` moves past them.
unsafe impl Sync for FrameRing {}

impl FrameRing {
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn lock(&self) -> MutexGuard<'_, ProducerSide> {
        self.producers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn occupancy(&self) -> usize {
        let n = self.slot_count();
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        (write + n - read) % n
    }

    fn stats(&self) -> RingStats {
        let side = self.lock();
        RingStats {
            stored: side.stored,
            dropped: side.dropped,
            max_backlog: side.max_backlog,
            max_occupancy: self.max_occupancy.load(Ordering::Relaxed),
        }
    }
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end. Cloned once per capture thread.
#[derive(Clone)]
pub struct Producer {
    ring: Arc<FrameRing>,
}

/// Read end. Exactly one exists per ring.
pub struct Consumer {
    ring: Arc<FrameRing>,
    _unsync: PhantomUnsync,
}

/// Creates a ring holding up to `capacity` frames of at most `slot_size` bytes.
///
/// One extra slot is allocated internally to tell "full" from "empty".
///
/// # Panics
///
/// If `capacity` or `slot_size` is zero.
#[must_use]
pub fn channel(capacity: usize, slot_size: usize) -> (Producer, Consumer) {
    assert!(capacity > 0, "ring capacity must be greater than 0");
    assert!(slot_size > 0, "slot size must be greater than 0");

    let slots = (0..=capacity)
        .map(|_| {
            UnsafeCell::new(SlotBuf {
                len: 0,
                bytes: vec![0u8; slot_size].into_boxed_slice(),
            })
        })
        .collect();

    let ring = Arc::new(FrameRing {
        slots,
        write: AtomicUsize::new(0),
        read: AtomicUsize::new(0),
        producers: Mutex::new(ProducerSide::default()),
        max_occupancy: AtomicUsize::new(0),
    });

    let producer = Producer {
        ring: Arc::clone(&ring),
    };
    let consumer = Consumer {
        ring,
        _unsync: PhantomData,
    };
    (producer, consumer)
}

impl Producer {
    /// Copies `frame` into the next free slot, or drops it if the ring is full.
    ///
    /// Frames longer than the slot size are truncated.
    pub fn push(&self, frame: &[u8]) -> Push {
        let ring = &*self.ring;
        let mut side = ring.lock();

        let write = ring.write.load(Ordering::Relaxed);
        let next = (write + 1) % ring.slot_count();
        if next == ring.read.load(Ordering::Acquire) {
            side.dropped += 1;
            return Push::Dropped;
        }

        // SAFETY: we hold the producer lock and `next` is outside the
        // consumer's range `(read, write]`; see the `Sync` impl.
        let slot = unsafe { &mut *ring.slots[next].get() };
        let len = frame.len().min(slot.bytes.len());
        slot.bytes[..len].copy_from_slice(&frame[..len]);
        slot.len = len;

        ring.write.store(next, Ordering::Release);
        side.stored += 1;
        Push::Stored
    }

    /// Records how many datagrams were waiting in one receive burst.
    pub fn record_backlog(&self, pending: usize) {
        let mut side = self.ring.lock();
        side.max_backlog = side.max_backlog.max(pending);
    }

    #[must_use]
    pub fn stats(&self) -> RingStats {
        self.ring.stats()
    }
}

impl Consumer {
    /// Passes the oldest unread frame to `f`, then releases its slot.
    ///
    /// Returns `None` without calling `f` if the ring is empty.
    pub fn pop_with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let ring = &*self.ring;
        let n = ring.slot_count();
        let write = ring.write.load(Ordering::Acquire);
        let read = ring.read.load(Ordering::Relaxed);
        if write == read {
            return None;
        }

        ring.max_occupancy
            .fetch_max((write + n - read) % n, Ordering::Relaxed);

        let index = (read + 1) % n;
        // SAFETY: `index` is in `(read, write]`, published with Release on
        // `write`, and no producer writes it until `read` advances.
        let slot = unsafe { &*ring.slots[index].get() };
        let result = f(&slot.bytes[..slot.len]);

        ring.read.store(index, Ordering::Release);
        Some(result)
    }

    /// Number of unread frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.occupancy()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.write.load(Ordering::Acquire) == self.ring.read.load(Ordering::Relaxed)
    }

    /// Usable capacity in frames.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.slot_count() - 1
    }

    #[must_use]
    pub fn stats(&self) -> RingStats {
        self.ring.stats()
    }
}
