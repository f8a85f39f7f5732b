use super::{open_ring, small_geometry};
use pktring::engine::{StaticPayload, StopFlag, TransmitLoop, TransmitSettings, TCP_SYN_FRAME};
use pktring::ring::{Direction, FrameStatus, RingGeometry};
use pktring::telemetry::QueueStats;
use pktring::testkit::SimKernel;
use pktring::Error;
use std::time::{Duration, Instant};

fn settings(batch_size: u64, packet_limit: u64) -> TransmitSettings {
    TransmitSettings {
        batch_size,
        poll_timeout: Duration::from_millis(5),
        packet_limit: Some(packet_limit),
        flush_retries: 3,
        flush_retry_delay: Duration::from_millis(10),
    }
}

#[test]
fn test_batch_flushes_and_final_drain() {
    let mut sim = SimKernel::new().complete_on_flush(true);
    let ring = open_ring(&mut sim, small_geometry(), Direction::Transmit);
    let stats = QueueStats::new();
    let mut transmit = TransmitLoop::new(settings(2, 5));

    let report = transmit
        .run(&ring, &mut sim, &mut StaticPayload::tcp_syn(), &stats, &StopFlag::new())
        .unwrap();

    // After frame 2, after frame 4, and the drain covering frame 5.
    assert_eq!(sim.counters().flushes(), 3);
    assert_eq!(report.flushes, 1);
    assert_eq!(report.lost, 0);
    assert_eq!(transmit.sent(), 5);
    assert_eq!(stats.tx_packets.get(), 5);
    assert_eq!(stats.tx_bytes.get(), 5 * TCP_SYN_FRAME.len() as u64);
    assert_eq!(stats.flushes.get(), 3);
    assert_eq!(sim.counters().completed_frames(), 5);
    assert_eq!(
        sim.frame_payload(4, ring.tx_data_offset()).unwrap(),
        TCP_SYN_FRAME.to_vec()
    );
}

#[test]
fn test_unsent_frames_reported_lost() {
    // The kernel never completes anything.
    let mut sim = SimKernel::new();
    let ring = open_ring(&mut sim, small_geometry(), Direction::Transmit);
    let stats = QueueStats::new();
    let mut transmit = TransmitLoop::new(settings(100, 3));

    let started = Instant::now();
    let report = transmit
        .run(&ring, &mut sim, &mut StaticPayload::tcp_syn(), &stats, &StopFlag::new())
        .unwrap();

    assert_eq!(report.lost, 3);
    assert_eq!(report.retries, 3);
    // One flush for the tail of the batch, then a re-kick per later retry.
    assert_eq!(report.flushes, 3);
    assert_eq!(sim.counters().flushes(), 3);
    assert_eq!(stats.lost.get(), 3);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(ring.outstanding_frames().unwrap(), 3);
}

#[test]
fn test_full_ring_flushes_before_waiting() {
    // One block of two frames, batch far larger than the ring.
    let geometry = RingGeometry::new(2048, 4096.max(pktring::ring::page_size() as u32), 1).unwrap();
    let frames = geometry.frame_count() as u64;
    let mut sim = SimKernel::new().complete_on_flush(true);
    let ring = open_ring(&mut sim, geometry, Direction::Transmit);
    let stats = QueueStats::new();
    let mut transmit = TransmitLoop::new(settings(1_000, frames * 3));

    let report = transmit
        .run(&ring, &mut sim, &mut StaticPayload::tcp_syn(), &stats, &StopFlag::new())
        .unwrap();

    assert_eq!(transmit.sent(), frames * 3);
    assert_eq!(report.lost, 0);
    // Every time the ring filled up the queued frames were flushed.
    assert!(sim.counters().flushes() >= 3);
}

#[test]
fn test_rejected_frame_dropped_and_reused() {
    let mut sim = SimKernel::new();
    let ring = open_ring(&mut sim, small_geometry(), Direction::Transmit);
    let stats = QueueStats::new();
    let mut transmit = TransmitLoop::new(settings(100, 100));
    let frames = ring.geometry().frame_count() as u64;

    // Fill the whole ring, then let the kernel reject everything.
    for _ in 0..frames {
        assert!(transmit.try_send(&ring, &mut sim, &[0xab; 60], &stats).unwrap());
    }
    assert!(!transmit.try_send(&ring, &mut sim, &[0xab; 60], &stats).unwrap());
    assert_eq!(sim.reject_frames().unwrap(), frames as usize);
    assert!(matches!(sim.frame_status(0).unwrap(), FrameStatus::Error(_)));

    assert!(transmit.try_send(&ring, &mut sim, &[0xcd; 60], &stats).unwrap());
    assert_eq!(stats.tx_dropped.get(), 1);
    assert_eq!(sim.frame_status(0).unwrap(), FrameStatus::SendRequested);
    assert_eq!(
        sim.frame_payload(0, ring.tx_data_offset()).unwrap(),
        vec![0xcd; 60]
    );
}

#[test]
fn test_oversized_payload_rejected_up_front() {
    let mut sim = SimKernel::new().complete_on_flush(true);
    let ring = open_ring(&mut sim, small_geometry(), Direction::Transmit);
    let stats = QueueStats::new();
    let capacity = 2048 - ring.tx_data_offset();

    let err = TransmitLoop::new(settings(2, 5))
        .run(
            &ring,
            &mut sim,
            &mut StaticPayload::new(vec![0; capacity + 1]),
            &stats,
            &StopFlag::new(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::PayloadTooLarge { len, .. } if len == capacity + 1));
    assert_eq!(stats.tx_packets.get(), 0);
    assert_eq!(sim.frame_status(0).unwrap(), FrameStatus::Available);

    let report = TransmitLoop::new(settings(2, 1))
        .run(
            &ring,
            &mut sim,
            &mut StaticPayload::new(vec![0; capacity]),
            &stats,
            &StopFlag::new(),
        )
        .unwrap();
    assert_eq!(report.lost, 0);
    assert_eq!(stats.tx_packets.get(), 1);
}

#[test]
fn test_stop_flag_ends_unlimited_send() {
    let mut sim = SimKernel::new().complete_on_flush(true);
    let ring = open_ring(&mut sim, small_geometry(), Direction::Transmit);
    let stats = QueueStats::new();
    let stop = StopFlag::new();
    stop.stop();

    let mut settings = settings(2, 0);
    settings.packet_limit = None;
    let report = TransmitLoop::new(settings)
        .run(&ring, &mut sim, &mut StaticPayload::tcp_syn(), &stats, &stop)
        .unwrap();

    assert_eq!(stats.tx_packets.get(), 0);
    assert_eq!(report.flushes, 0);
    assert_eq!(report.retries, 0);
}
