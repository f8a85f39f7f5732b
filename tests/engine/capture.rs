use super::{open_ring, small_geometry, wait_until};
use pktring::engine::{BlockOutcome, CaptureLoop, StopFlag};
use pktring::ring::{page_size, BlockStatus, Direction, Timestamp};
use pktring::telemetry::QueueStats;
use pktring::testkit::{sim_payload, SimKernel};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_single_block_delivered_in_order() {
    let geometry = small_geometry();
    if page_size() <= 8 * 2048 {
        assert_eq!(geometry.frames_per_block(), 8);
    }
    let mut sim = SimKernel::new();
    let ring = open_ring(&mut sim, geometry, Direction::Capture);
    let stats = QueueStats::new();
    let mut capture = CaptureLoop::new(Duration::from_millis(10));

    assert!(sim.deliver_block(&[64, 128, 1500]).unwrap());
    assert_eq!(sim.block_status(0).unwrap(), BlockStatus::UserOwned);

    let mut calls: Vec<(Timestamp, u32, Vec<u8>)> = Vec::new();
    let mut sink = |ts: Timestamp, len: u32, data: &[u8]| calls.push((ts, len, data.to_vec()));
    let outcome = capture.poll_block(&ring, &mut sink, &stats).unwrap();

    assert_eq!(outcome, BlockOutcome::Consumed { packets: 3 });
    let lens: Vec<u32> = calls.iter().map(|(_, len, _)| *len).collect();
    assert_eq!(lens, vec![64, 128, 1500]);
    assert_eq!(calls[1].2, sim_payload(1, 128));
    assert!(calls[0].0 <= calls[2].0);

    assert_eq!(sim.block_status(0).unwrap(), BlockStatus::KernelOwned);
    assert_eq!(capture.cursor(), 1);
    assert_eq!(stats.rx_packets.get(), 3);
    assert_eq!(stats.rx_bytes.get(), 64 + 128 + 1500);
    assert_eq!(stats.rx_blocks.get(), 1);
}

#[test]
fn test_kernel_owned_block_is_left_alone() {
    let mut sim = SimKernel::new();
    let ring = open_ring(&mut sim, small_geometry(), Direction::Capture);
    let stats = QueueStats::new();
    let mut capture = CaptureLoop::new(Duration::from_millis(10));

    let mut calls = 0;
    let mut sink = |_: Timestamp, _: u32, _: &[u8]| calls += 1;
    assert_eq!(
        capture.poll_block(&ring, &mut sink, &stats).unwrap(),
        BlockOutcome::Pending
    );
    assert_eq!(calls, 0);
    assert_eq!(capture.cursor(), 0);
    assert_eq!(stats.rx_blocks.get(), 0);
}

#[test]
fn test_cursor_wraps_around_ring() {
    let mut sim = SimKernel::new();
    let ring = open_ring(&mut sim, small_geometry(), Direction::Capture);
    let stats = QueueStats::new();
    let mut capture = CaptureLoop::new(Duration::from_millis(10));
    let mut sink = |_: Timestamp, _: u32, _: &[u8]| {};

    for round in 0..6 {
        assert!(sim.deliver_block(&[60]).unwrap(), "round {}", round);
        capture.poll_block(&ring, &mut sink, &stats).unwrap();
    }
    assert_eq!(capture.cursor(), 6 % 4);
    assert_eq!(stats.rx_packets.get(), 6);
}

#[test]
fn test_corrupt_block_released_and_skipped() {
    let mut sim = SimKernel::new();
    let ring = open_ring(&mut sim, small_geometry(), Direction::Capture);
    let stats = QueueStats::new();
    let mut capture = CaptureLoop::new(Duration::from_millis(10));

    sim.deliver_block(&[64, 64]).unwrap();
    // Claims more records than the chain holds.
    sim.corrupt_block(0, 5).unwrap();
    sim.deliver_block(&[100]).unwrap();

    let mut lens = Vec::new();
    let mut sink = |_: Timestamp, len: u32, _: &[u8]| lens.push(len);
    assert_eq!(
        capture.poll_block(&ring, &mut sink, &stats).unwrap(),
        BlockOutcome::Corrupt { packets: 2 }
    );
    assert_eq!(sim.block_status(0).unwrap(), BlockStatus::KernelOwned);
    assert_eq!(stats.corrupt_blocks.get(), 1);

    assert_eq!(
        capture.poll_block(&ring, &mut sink, &stats).unwrap(),
        BlockOutcome::Consumed { packets: 1 }
    );
    assert_eq!(lens, vec![64, 64, 100]);
}

#[test]
fn test_run_until_stopped() {
    let mut sim = SimKernel::new().with_traffic(vec![vec![64; 3], vec![128; 3], vec![256; 3]]);
    let ring = open_ring(&mut sim, small_geometry(), Direction::Capture);
    let stats = Arc::new(QueueStats::new());
    let stop = StopFlag::new();

    let worker = {
        let stats = stats.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let mut sink = |_: Timestamp, _: u32, _: &[u8]| {};
            CaptureLoop::new(Duration::from_millis(5)).run(&ring, &mut sim, &mut sink, &stats, &stop)
        })
    };

    assert!(wait_until(Duration::from_secs(5), || stats.rx_packets.get() == 9));
    stop.stop();
    worker.join().unwrap().unwrap();

    assert_eq!(stats.rx_bytes.get(), 3 * (64 + 128 + 256));
    assert_eq!(stats.rx_blocks.get(), 3);
}

#[test]
fn test_fatal_wait_error_ends_loop() {
    let mut sim = SimKernel::new().failing_waits(libc::EBADF);
    let ring = open_ring(&mut sim, small_geometry(), Direction::Capture);
    let stats = QueueStats::new();
    let mut sink = |_: Timestamp, _: u32, _: &[u8]| {};

    let err = CaptureLoop::new(Duration::from_millis(5))
        .run(&ring, &mut sim, &mut sink, &stats, &StopFlag::new())
        .unwrap_err();
    assert!(matches!(err, pktring::Error::Io(_)));
}

#[test]
fn test_interrupted_wait_is_retried() {
    let mut sim = SimKernel::new().failing_waits(libc::EINTR);
    let ring = open_ring(&mut sim, small_geometry(), Direction::Capture);
    let stats = Arc::new(QueueStats::new());
    let stop = StopFlag::new();
    let counters = sim.counters();

    let worker = {
        let stats = stats.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let mut sink = |_: Timestamp, _: u32, _: &[u8]| {};
            CaptureLoop::new(Duration::from_millis(1)).run(&ring, &mut sim, &mut sink, &stats, &stop)
        })
    };

    assert!(wait_until(Duration::from_secs(5), || {
        counters.waits.load(std::sync::atomic::Ordering::Relaxed) > 3
    }));
    stop.stop();
    assert!(worker.join().unwrap().is_ok());
}
