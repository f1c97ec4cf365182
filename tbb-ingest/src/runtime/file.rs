//! Batch ingestion from a file of back-to-back frames.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::dataset::{Dataset, OutputMetadata, ProcessOptions};
use crate::stats::IngestionStats;
use crate::storage::StorageFactory;
use crate::trace::{info, warn};

use super::IngestError;

/// Reads `path` as consecutive `frame_size` blocks and writes them all into
/// one output called `name`.
///
/// A trailing partial block is ignored. Setting `cancel` stops after the
/// current frame; the output is still closed.
///
/// # Errors
///
/// [`IngestError::InputTooSmall`] if the file holds less than one frame, and
/// I/O or storage failures opening the input or creating the output.
pub fn ingest_file<F: StorageFactory>(
    path: &Path,
    factory: &F,
    name: &str,
    metadata: &OutputMetadata,
    options: ProcessOptions,
    frame_size: usize,
    cancel: &AtomicBool,
) -> Result<IngestionStats, IngestError> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < frame_size as u64 {
        return Err(IngestError::InputTooSmall {
            path: path.to_path_buf(),
            len,
        });
    }
    let blocks = len / frame_size as u64;
    if len % frame_size as u64 != 0 {
        warn!(
            path = %path.display(),
            trailing = len % frame_size as u64,
            "input size is not a multiple of the frame size"
        );
    }
    info!(path = %path.display(), frames = blocks, output = name, "reading input file");

    let storage = factory.create(name)?;
    let mut dataset = Dataset::create(storage, name, metadata, options)?;

    let mut reader = BufReader::new(file);
    let mut block = vec![0u8; frame_size];
    for _ in 0..blocks {
        if cancel.load(Ordering::Acquire) {
            info!("shutdown requested, closing output early");
            break;
        }
        match reader.read_exact(&mut block) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                warn!(path = %path.display(), "input ended early");
                break;
            }
            Err(_e) => {
                // Keep what was written so far.
                warn!(path = %path.display(), error = %_e, "read failed");
                break;
            }
        }
        let _ = dataset.process(&block);
    }

    let mut stats = IngestionStats::default();
    stats.absorb(dataset.close()?);
    info!("file ingestion ended\n{stats}");
    Ok(stats)
}
