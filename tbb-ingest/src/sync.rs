//! Synchronization primitives shared between capture threads and the drain loop.

pub mod ring;
