//! Cross-handle and concurrency behaviour of frame/pose channels

use posefeed::semaphore::NamedMutex;
use posefeed::shm::SharedRegion;
use posefeed::{
    CameraNames, ChannelConfig, FramePoseChannel, PoseFeedError, RetryPolicy, Span, StopSignal,
};
use rustix::fs::ftruncate;
use rustix::shm::{shm_open, Mode, ShmOFlags};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn names(tag: &str, dir: &Path) -> CameraNames {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    CameraNames::new(
        &format!("/posefeed_it_{tag}_{pid}_{n}"),
        &format!("/posefeed_itsem_{tag}_{pid}_{n}"),
        dir,
    )
}

fn cleanup(names: &CameraNames) {
    let _ = SharedRegion::unlink(&names.shm_name);
    let _ = NamedMutex::unlink(&names.lock_name);
}

fn patient() -> RetryPolicy {
    RetryPolicy::bounded(Duration::from_millis(1), 2000)
}

#[test]
fn end_to_end_small_region() {
    let dir = tempfile::tempdir().unwrap();
    let names = names("e2e", dir.path());
    let config = ChannelConfig::new(2, 1, 16);

    let mut channel = FramePoseChannel::open(0, names.clone(), &config, &patient()).unwrap();
    let metadata = br#"{"t":1,"p":[]}"#;
    channel.publish_raw(&[1, 2, 3, 4, 5, 6], metadata).unwrap();

    // A consumer attaching by name sees the same 22 bytes
    let consumer = SharedRegion::create_or_attach(&names.shm_name, 22, &patient()).unwrap();
    let bytes = consumer.read(Span { offset: 0, len: 22 }).unwrap();
    let mut expected = vec![1, 2, 3, 4, 5, 6];
    expected.extend_from_slice(metadata);
    expected.resize(22, 0);
    assert_eq!(bytes, expected);

    drop(consumer);
    drop(channel);
    cleanup(&names);
}

#[test]
fn consumer_created_region_is_attached() {
    let dir = tempfile::tempdir().unwrap();
    let names = names("consumer_first", dir.path());
    let config = ChannelConfig::new(4, 2, 64);

    let consumer =
        SharedRegion::create_or_attach(&names.shm_name, config.total_size(), &patient()).unwrap();
    assert!(consumer.is_creator());

    let mut channel = FramePoseChannel::open(1, names.clone(), &config, &patient()).unwrap();
    channel.publish_raw(&[0xAB; 24], b"{\"timestamp\":1}").unwrap();

    assert_eq!(consumer.read(Span { offset: 0, len: 24 }).unwrap(), vec![0xAB; 24]);
    assert_eq!(
        consumer.read(Span { offset: 24, len: 15 }).unwrap(),
        b"{\"timestamp\":1}"
    );

    // Closing the producer leaves the object for the consumer
    channel.close();
    assert_eq!(consumer.read(Span { offset: 0, len: 1 }).unwrap(), vec![0xAB]);

    drop(consumer);
    cleanup(&names);
}

#[test]
fn racing_creators_share_one_object() {
    let dir = tempfile::tempdir().unwrap();
    let names = names("race", dir.path());
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let name = names.shm_name.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                SharedRegion::create_or_attach(&name, 4096, &patient())
                    .map(|region| region.is_creator())
            })
        })
        .collect();

    let creators = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .filter(|created| *created)
        .count();
    assert_eq!(creators, 1);
    cleanup(&names);
}

#[test]
fn unsized_object_is_waited_for() {
    let dir = tempfile::tempdir().unwrap();
    let names = names("unsized", dir.path());
    let config = ChannelConfig::new(2, 2, 32);

    // Peer created the object but has not sized it yet
    let fd = shm_open(
        names.shm_name.as_str(),
        ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
        Mode::RUSR | Mode::WUSR,
    )
    .unwrap();

    let err = FramePoseChannel::open(
        0,
        names.clone(),
        &config,
        &RetryPolicy::bounded(Duration::from_millis(1), 3),
    )
    .err()
    .unwrap();
    assert!(matches!(err, PoseFeedError::ChannelUnavailable { attempts: 3, .. }));

    let total = config.total_size() as u64;
    let sizer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        ftruncate(&fd, total).unwrap();
    });

    let channel = FramePoseChannel::open(0, names.clone(), &config, &patient()).unwrap();
    sizer.join().unwrap();
    assert_eq!(channel.layout().total_size, config.total_size());

    drop(channel);
    cleanup(&names);
}

#[test]
fn stop_abandons_unbounded_open() {
    let dir = tempfile::tempdir().unwrap();
    let names = names("stopped", dir.path());
    let config = ChannelConfig::new(2, 2, 32);

    let fd = shm_open(
        names.shm_name.as_str(),
        ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
        Mode::RUSR | Mode::WUSR,
    )
    .unwrap();

    let stop = StopSignal::new();
    let opener = {
        let names = names.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            FramePoseChannel::open_until(0, names, &config, &RetryPolicy::default(), &stop)
                .err()
                .unwrap()
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!opener.is_finished());

    let stopped_at = Instant::now();
    stop.stop();
    let err = opener.join().unwrap();
    assert!(stopped_at.elapsed() < Duration::from_millis(500));
    assert!(matches!(err, PoseFeedError::ChannelUnavailable { .. }));
    assert!(!names.ready_path.exists());

    drop(fd);
    cleanup(&names);
}

#[test]
fn mis_sized_region_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let names = names("missized", dir.path());

    let old = FramePoseChannel::open(0, names.clone(), &ChannelConfig::new(4, 4, 64), &patient())
        .unwrap();
    let err = FramePoseChannel::open(0, names.clone(), &ChannelConfig::new(8, 8, 64), &patient())
        .err()
        .unwrap();
    assert!(matches!(err, PoseFeedError::RegionSizeMismatch { .. }));

    drop(old);
    cleanup(&names);
}

#[test]
fn concurrent_publishers_never_tear_locked_reads() {
    let dir = tempfile::tempdir().unwrap();
    let names = names("torn", dir.path());
    let config = ChannelConfig::new(32, 32, 64);
    let frame_size = config.frame_size();

    // Seed so the reader always finds a complete pair
    let mut seed = FramePoseChannel::open(0, names.clone(), &config, &patient()).unwrap();
    seed.publish_raw(&vec![0; frame_size], b"{\"k\":0}").unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let writers: Vec<_> = (1..=4u8)
        .map(|k| {
            let names = names.clone();
            thread::spawn(move || {
                let mut channel =
                    FramePoseChannel::open(0, names, &config, &patient()).unwrap();
                let frame = vec![k; frame_size];
                let metadata = format!("{{\"k\":{k}}}");
                for _ in 0..200 {
                    channel.publish_raw(&frame, metadata.as_bytes()).unwrap();
                }
            })
        })
        .collect();

    let reader = {
        let done = done.clone();
        thread::spawn(move || {
            let mut reads = 0;
            while !done.load(Ordering::Acquire) || reads == 0 {
                let snapshot = seed.read_locked().unwrap();
                let k = snapshot.frame[0];
                assert!(snapshot.frame.iter().all(|b| *b == k), "frame torn");
                assert_eq!(snapshot.metadata, format!("{{\"k\":{k}}}").into_bytes());
                reads += 1;
            }
            seed
        })
    };

    for w in writers {
        w.join().unwrap();
    }
    done.store(true, Ordering::Release);
    let seed = reader.join().unwrap();

    drop(seed);
    cleanup(&names);
}
