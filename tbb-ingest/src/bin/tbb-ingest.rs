//! TBB raw frame ingester.
//!
//! Reads transient buffer board frames from one or more UDP ports, or from a
//! file of back-to-back frames, and writes them into per-dipole time series.
//!
//! # Usage
//!
//! ```sh
//! tbb-ingest -O tbb-run -P 31664 -P 31665 -R 1.0
//! tbb-ingest -O dump-001 -I frames.raw -F legacy
//! tbb-ingest -O station -P 31664 -M
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: finish the frames already buffered, close every
//!   output and exit. A second signal exits immediately.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;

use tbb_ingest::config::{self, ConfigError, IngestConfig, SourceConfig};
use tbb_ingest::dataset::{OutputMetadata, ProcessOptions};
use tbb_ingest::frame::{ByteOrder, CorrectionPolicy, FRAME_SIZE};
use tbb_ingest::net::Endpoint;
use tbb_ingest::runtime::{IngestError, Session, SingleOutput, StationOutputs, ingest_file};
use tbb_ingest::storage::DirFactory;
use tbb_ingest::trace::init_tracing;

#[derive(Debug, Parser)]
#[command(name = "tbb-ingest")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ingest raw TBB frames from UDP or file into per-dipole time series")]
struct Cli {
    /// Output name (file mode) or name prefix (socket mode)
    #[arg(short = 'O', long, value_name = "NAME")]
    outfile: String,

    /// Read frames from this file instead of the network
    #[arg(short = 'I', long, value_name = "FILE", conflicts_with = "port")]
    infile: Option<PathBuf>,

    /// UDP port to listen on; repeat for several ports
    #[arg(short = 'P', long, value_name = "PORT", action = clap::ArgAction::Append)]
    port: Vec<u16>,

    /// Address to bind the ports to
    #[arg(long, value_name = "ADDR", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    ip: IpAddr,

    /// Seconds to wait for the first frame; 0 or less waits forever
    #[arg(short = 'S', long, value_name = "SECS", default_value_t = 0.0)]
    timeout_start: f64,

    /// Seconds without data that end a stream
    #[arg(short = 'R', long, value_name = "SECS", default_value_t = 0.5)]
    timeout_read: f64,

    /// Timestamp correction: 0/off, 1/legacy, 2/current
    #[arg(short = 'F', long, value_name = "MODE", default_value = "2")]
    fix_times: CorrectionPolicy,

    /// Check the header CRC (0 or 1)
    #[arg(short = 'C', long, value_name = "0|1", default_value_t = 1,
          value_parser = clap::value_parser!(u8).range(0..=1))]
    check_crc: u8,

    /// Ring buffer capacity in frames
    #[arg(short = 'B', long, value_name = "FRAMES", default_value_t = config::DEFAULT_BUFFER_FRAMES)]
    buffer_size: usize,

    /// Start a new session (and output) whenever one ends
    #[arg(short = 'K', long)]
    keep_running: bool,

    /// Never end a session just because the ring ran dry
    #[arg(short = 'W', long)]
    wait_for_all: bool,

    /// One output per station; implies --keep-running
    #[arg(short = 'M', long)]
    multiple_stations: bool,

    /// Sources send big-endian frames
    #[arg(long)]
    big_endian: bool,

    /// Kernel receive buffer per socket, in bytes
    #[arg(long, value_name = "BYTES")]
    recv_buffer: Option<usize>,

    #[arg(long, help_heading = "Metadata")]
    observer: Option<String>,

    #[arg(long, help_heading = "Metadata")]
    project: Option<String>,

    #[arg(long, help_heading = "Metadata")]
    observation_id: Option<String>,

    #[arg(long, help_heading = "Metadata")]
    filter_selection: Option<String>,

    #[arg(long, help_heading = "Metadata")]
    antenna_set: Option<String>,

    /// Directory outputs are created in
    #[arg(long, value_name = "DIR", default_value = ".")]
    output_dir: PathBuf,
}

impl Cli {
    fn process_options(&self) -> ProcessOptions {
        ProcessOptions {
            byte_order: if self.big_endian {
                ByteOrder::Big
            } else {
                ByteOrder::Little
            },
            check_crc: self.check_crc != 0,
            correction: self.fix_times,
            ..ProcessOptions::default()
        }
    }

    fn metadata(&self) -> OutputMetadata {
        let mut meta = OutputMetadata::default();
        let fields = [
            (&self.observer, &mut meta.observer),
            (&self.project, &mut meta.project_title),
            (&self.observation_id, &mut meta.observation_id),
            (&self.filter_selection, &mut meta.filter_selection),
            (&self.antenna_set, &mut meta.antenna_set),
        ];
        for (value, field) in fields {
            if let Some(value) = value {
                field.clone_from(value);
            }
        }
        meta
    }

    fn ingest_config(&self) -> Result<IngestConfig, ConfigError> {
        if self.outfile.is_empty() {
            return Err(ConfigError::EmptyOutput);
        }
        let sources = self
            .port
            .iter()
            .map(|&port| SourceConfig {
                endpoint: Endpoint::new(self.ip, port),
                recv_buffer: self.recv_buffer,
            })
            .collect();

        IngestConfig {
            sources,
            start_timeout: config::start_timeout_from_secs(self.timeout_start)?,
            read_timeout: config::read_timeout_from_secs(self.timeout_read)?,
            buffer_frames: self.buffer_size,
            wait_for_all: self.wait_for_all,
            stay_connected: self.multiple_stations,
            process: self.process_options(),
            metadata: self.metadata(),
            ..IngestConfig::default()
        }
        .validate()
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tbb-ingest: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), IngestError> {
    let cancel = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        // A second signal while shutting down exits straight away.
        flag::register_conditional_shutdown(signal, 1, Arc::clone(&cancel))?;
        flag::register(signal, Arc::clone(&cancel))?;
    }

    let factory = DirFactory::new(&cli.output_dir);

    if let Some(infile) = &cli.infile {
        if cli.keep_running {
            eprintln!("tbb-ingest: --keep-running has no effect when reading a file");
        }
        if cli.outfile.is_empty() {
            return Err(ConfigError::EmptyOutput.into());
        }
        let stats = ingest_file(
            infile,
            &factory,
            &cli.outfile,
            &cli.metadata(),
            cli.process_options(),
            FRAME_SIZE,
            &cancel,
        )?;
        println!("{stats}");
        return Ok(());
    }

    if cli.port.is_empty() {
        return Err(ConfigError::NoInput.into());
    }
    let config = cli.ingest_config()?;
    let keep_running = cli.keep_running || cli.multiple_stations;

    loop {
        let session = Session::start(config.clone())?;
        let stats = if cli.multiple_stations {
            let mut sink = StationOutputs::new(
                factory.clone(),
                cli.outfile.as_str(),
                config.metadata.clone(),
                config.process,
                config.read_timeout,
            );
            session.run(&mut sink, &cancel)?
        } else {
            let mut sink = SingleOutput::new(
                factory.clone(),
                cli.outfile.as_str(),
                config.metadata.clone(),
                config.process,
            );
            session.run(&mut sink, &cancel)?
        };
        println!("{stats}");

        if !keep_running || cancel.load(Ordering::Acquire) {
            return Ok(());
        }
    }
}
