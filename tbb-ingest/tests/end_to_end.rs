//! End-to-end ingestion scenarios: file ingress into the directory backend,
//! UDP sessions into memory outputs, and ring overflow under contention.

use std::io::Write;
use std::net::UdpSocket as StdUdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use tbb_ingest::config::{IngestConfig, SourceConfig};
use tbb_ingest::dataset::{OutputMetadata, ProcessOptions};
use tbb_ingest::frame::{ByteOrder, CorrectionPolicy, FRAME_SIZE, Header, encode};
use tbb_ingest::net::Endpoint;
use tbb_ingest::runtime::{Session, SingleOutput, StationOutputs, ingest_file};
use tbb_ingest::storage::dir::{read_sidecar, read_samples};
use tbb_ingest::storage::{AttrValue, DirFactory, MemoryFactory};
use tbb_ingest::sync::ring::{self, Push};

fn frame(station: u8, second: i32, sample: u32, fill: i16) -> Vec<u8> {
    let header = Header {
        station,
        board: 2,
        receiver: 3,
        epoch_second: second,
        sample_offset: sample,
        ..Header::default()
    }
    .with_valid_crc();
    let payload = vec![fill; usize::from(header.samples_per_frame)];
    let mut raw = Vec::with_capacity(FRAME_SIZE);
    encode(&header, &payload, ByteOrder::Little, &mut raw);
    raw
}

fn session_config(ports: usize) -> IngestConfig {
    IngestConfig {
        sources: (0..ports)
            .map(|_| SourceConfig::new(Endpoint::localhost(0)))
            .collect(),
        start_timeout: Some(Duration::from_secs(2)),
        read_timeout: Duration::from_millis(300),
        wait_granularity: Duration::from_millis(50),
        idle_sleep: Duration::from_millis(10),
        buffer_frames: 1000,
        ..IngestConfig::default()
    }
}

#[test]
fn file_of_ten_frames_fills_one_channel() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("frames.raw");
    {
        let mut file = std::fs::File::create(&input).unwrap();
        for i in 0..10u32 {
            file.write_all(&frame(1, 100, i * 1024, i as i16)).unwrap();
        }
    }

    let options = ProcessOptions {
        correction: CorrectionPolicy::Legacy,
        ..ProcessOptions::default()
    };
    let stats = ingest_file(
        &input,
        &DirFactory::new(dir.path()),
        "scenario",
        &OutputMetadata::default(),
        options,
        FRAME_SIZE,
        &AtomicBool::new(false),
    )
    .unwrap();
    assert_eq!(stats.outputs, 1);
    assert_eq!(stats.frames.written, 10);
    assert_eq!(stats.frames.bad_crc, 0);

    let output = dir.path().join("scenario.tbb");
    let samples = read_samples(&output.join("Station001").join("001002003.i16")).unwrap();
    assert_eq!(samples.len(), 10 * 1024);
    for (i, block) in samples.chunks_exact(1024).enumerate() {
        assert!(block.iter().all(|&s| s == i as i16), "frame {i} misplaced");
    }

    let root = read_sidecar(&output.join("attributes.json")).unwrap();
    assert!(matches!(root.get("TELESCOPE"), Some(AttrValue::Text(t)) if t == "LOFAR"));
    assert!(matches!(root.get("FILENAME"), Some(AttrValue::Text(t)) if t == "scenario"));

    let channel = read_sidecar(&output.join("Station001").join("001002003.json")).unwrap();
    assert!(matches!(channel.get("TIME"), Some(AttrValue::Int(100))));
    assert!(matches!(channel.get("SAMPLE_NUMBER"), Some(AttrValue::UInt(0))));
}

#[test]
fn udp_session_ends_when_data_stops() {
    let session = Session::start(session_config(1)).unwrap();
    let target = session.local_endpoints()[0].as_socket_addr();

    let factory = MemoryFactory::new();
    let mut sink = SingleOutput::new(
        factory.clone(),
        "udp",
        OutputMetadata::default(),
        ProcessOptions::default(),
    );

    let sender = thread::spawn(move || {
        let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        for i in 0..5u32 {
            socket.send_to(&frame(4, 1_262_304_000, i * 1024, 9), target).unwrap();
        }
        let mut broken = frame(4, 1_262_304_000, 5 * 1024, 9);
        broken[3] ^= 0x01;
        socket.send_to(&broken, target).unwrap();
    });

    let started = Instant::now();
    let stats = session.run(&mut sink, &AtomicBool::new(false)).unwrap();
    sender.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(stats.outputs, 1);
    assert_eq!(stats.frames.processed, 6);
    assert_eq!(stats.frames.written, 5);
    assert_eq!(stats.frames.bad_crc, 1);
    assert_eq!(stats.ring.dropped, 0);

    let names = factory.names();
    assert_eq!(names, vec!["udp-20100101T000000.000Z".to_owned()]);
    let output = factory.output(&names[0]).unwrap();
    assert!(output.closed);
    assert_eq!(output.array("Station004", "004002003").unwrap().data.len(), 5 * 1024);
}

#[test]
fn two_ports_two_stations_stay_separate() {
    let config = IngestConfig {
        stay_connected: true,
        ..session_config(2)
    };
    let read_timeout = config.read_timeout;
    let session = Session::start(config).unwrap();
    let targets: Vec<_> = session
        .local_endpoints()
        .iter()
        .map(Endpoint::as_socket_addr)
        .collect();

    let factory = MemoryFactory::new();
    let mut sink = StationOutputs::new(
        factory.clone(),
        "multi",
        OutputMetadata::default(),
        ProcessOptions::default(),
        read_timeout,
    );
    let cancel = Arc::new(AtomicBool::new(false));

    let driver = {
        let factory = factory.clone();
        let cancel = Arc::clone(&cancel);
        thread::spawn(move || {
            let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
            for (station, target) in [(11u8, targets[0]), (22u8, targets[1])] {
                for i in 0..3u32 {
                    let raw = frame(station, 50, i * 1024, i16::from(station));
                    socket.send_to(&raw, target).unwrap();
                }
            }

            // Stop once both station outputs hold all their frames.
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                let complete = factory
                    .names()
                    .iter()
                    .filter_map(|name| factory.output(name))
                    .filter(|out| {
                        out.groups
                            .values()
                            .flat_map(|g| g.arrays.values())
                            .any(|a| a.data.len() == 3 * 1024)
                    })
                    .count();
                if complete == 2 || Instant::now() > deadline {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
            cancel.store(true, Ordering::Release);
        })
    };

    let stats = session.run(&mut sink, &cancel).unwrap();
    driver.join().unwrap();

    assert_eq!(stats.outputs, 2);
    assert_eq!(stats.frames.written, 6);

    let names = factory.names();
    assert_eq!(
        names,
        vec![
            "multi-19700101T000050.000Z-011".to_owned(),
            "multi-19700101T000050.000Z-022".to_owned(),
        ]
    );
    for (name, station) in names.iter().zip([11u8, 22]) {
        let output = factory.output(name).unwrap();
        assert!(output.closed);
        let groups: Vec<_> = output.groups.keys().cloned().collect();
        assert_eq!(groups, vec![format!("Station{station:03}")]);
        let array = output
            .array(&groups[0], &format!("{station:03}002003"))
            .unwrap();
        assert_eq!(array.data.len(), 3 * 1024);
        assert!(array.data.iter().all(|&s| s == i16::from(station)));
    }
}

#[test]
fn simultaneous_producers_overflow_by_one() {
    let (producer, consumer) = ring::channel(4, FRAME_SIZE);
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4u8)
        .map(|id| {
            let producer = producer.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                producer.push(&[id; FRAME_SIZE])
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), Push::Stored);
    }

    assert_eq!(producer.push(&[9; FRAME_SIZE]), Push::Dropped);
    assert_eq!(consumer.stats().dropped, 1);
    assert_eq!(consumer.len(), 4);

    let mut seen: Vec<u8> = std::iter::from_fn(|| {
        consumer.pop_with(|frame| {
            assert_eq!(frame.len(), FRAME_SIZE);
            assert!(frame.iter().all(|&b| b == frame[0]), "frame corrupted");
            frame[0]
        })
    })
    .collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3]);
}
