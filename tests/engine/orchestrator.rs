use super::{small_geometry, wait_until};
use pktring::config::SetupPolicy;
use pktring::engine::{
    plan_queues, EngineSettings, Orchestrator, QueuePlan, StaticPayload, TransmitSettings,
    Workload,
};
use pktring::ring::Timestamp;
use pktring::telemetry::MetricsRegistry;
use pktring::testkit::{SimFactory, SimKernel};
use pktring::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(20);

fn orchestrator(policy: SetupPolicy) -> Orchestrator {
    let settings = EngineSettings {
        poll_timeout: POLL,
        transmit: TransmitSettings {
            batch_size: 4,
            poll_timeout: POLL,
            packet_limit: Some(10),
            flush_retries: 3,
            flush_retry_delay: Duration::from_millis(5),
        },
        setup_policy: policy,
    };
    Orchestrator::new(settings, Arc::new(MetricsRegistry::new()))
}

fn discard(_plan: &QueuePlan) -> Workload {
    Workload::Capture(Box::new(|_: Timestamp, _: u32, _: &[u8]| {}))
}

#[test]
fn test_stopping_one_queue_leaves_the_other_running() {
    let plans = plan_queues(Some(2), 2, 64, 1);
    let mut factory = SimFactory::new(small_geometry(), |plan: &QueuePlan| {
        if plan.queue == 1 {
            SimKernel::new().with_endless_traffic(vec![64, 64])
        } else {
            SimKernel::new()
        }
    });
    let mut group = orchestrator(SetupPolicy::Abort)
        .start(&plans, &mut factory, discard)
        .unwrap();
    assert_eq!(group.queues(), vec![0, 1]);

    let busy = group.stats(1).unwrap();
    assert!(wait_until(Duration::from_secs(5), || busy.rx_packets.get() > 0));

    let stopped_at = Instant::now();
    assert!(group.stop(0));
    assert!(wait_until(Duration::from_secs(5), || group.is_finished(0)));
    // One wait interval plus scheduling slack.
    assert!(stopped_at.elapsed() < POLL * 20);
    assert!(!group.is_finished(1));

    let before = busy.rx_packets.get();
    assert!(wait_until(Duration::from_secs(5), || busy.rx_packets.get() > before));

    group.stop_all();
    let reports = group.join();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.error.is_none()));
    assert!(reports[1].rx_packets >= before);
}

#[test]
fn test_stop_and_join_are_idempotent() {
    let plans = plan_queues(Some(2), 2, 64, 1);
    let mut factory = SimFactory::new(small_geometry(), |_: &QueuePlan| SimKernel::new());
    let mut group = orchestrator(SetupPolicy::Abort)
        .start(&plans, &mut factory, discard)
        .unwrap();

    assert!(group.stop(1));
    assert!(!group.stop(1));
    assert!(!group.stop(7));
    group.stop_all();
    group.stop_all();

    let first = group.join();
    let second = group.join();
    assert_eq!(first, second);
    assert!(group.is_finished(0) && group.is_finished(1));
}

#[test]
fn test_runtime_error_contained_to_its_queue() {
    let plans = plan_queues(Some(2), 2, 64, 1);
    let mut factory = SimFactory::new(small_geometry(), |plan: &QueuePlan| {
        if plan.queue == 0 {
            SimKernel::new().failing_waits(libc::EIO)
        } else {
            SimKernel::new().with_endless_traffic(vec![100])
        }
    });
    let mut group = orchestrator(SetupPolicy::Abort)
        .start(&plans, &mut factory, discard)
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || group.is_finished(0)));
    let busy = group.stats(1).unwrap();
    assert!(wait_until(Duration::from_secs(5), || busy.rx_packets.get() > 0));
    assert!(!group.is_finished(1));

    group.stop_all();
    let reports = group.join();
    assert!(reports[0].error.is_some());
    assert!(reports[1].error.is_none());
    assert_eq!(group.stats(0).unwrap().errors.get(), 1);
}

#[test]
fn test_setup_failure_aborts_start() {
    let plans = plan_queues(Some(3), 3, 64, 1);
    let mut factory = SimFactory::new(small_geometry(), |plan: &QueuePlan| {
        if plan.queue == 1 {
            SimKernel::new().failing_version(libc::EINVAL)
        } else {
            SimKernel::new()
        }
    });
    let orchestrator = orchestrator(SetupPolicy::Abort);

    let err = orchestrator
        .start(&plans, &mut factory, discard)
        .err()
        .expect("start must fail");
    assert!(matches!(err, Error::Setup { queue: 1, .. }));
    assert_eq!(orchestrator.metrics().setup_failures.get(), 1);
    // Queue 2 was never attempted.
    assert!(factory.counters(2).is_none());
}

#[test]
fn test_setup_failure_skipped_when_continuing() {
    let plans = plan_queues(Some(3), 3, 64, 1);
    let mut factory = SimFactory::new(small_geometry(), |plan: &QueuePlan| {
        if plan.queue == 1 {
            SimKernel::new().failing_rings(libc::EPERM)
        } else {
            SimKernel::new()
        }
    });
    let orchestrator = orchestrator(SetupPolicy::Continue);

    let mut group = orchestrator.start(&plans, &mut factory, discard).unwrap();
    assert_eq!(group.queues(), vec![0, 2]);
    assert_eq!(orchestrator.metrics().setup_failures.get(), 1);

    group.stop_all();
    assert_eq!(group.join().len(), 2);
}

#[test]
fn test_every_queue_failing_fails_start() {
    let plans = plan_queues(Some(2), 2, 64, 1);
    let mut factory = SimFactory::new(small_geometry(), |_: &QueuePlan| {
        SimKernel::new().failing_version(libc::EINVAL)
    });

    let result = orchestrator(SetupPolicy::Continue).start(&plans, &mut factory, discard);
    assert!(matches!(result, Err(Error::Setup { queue: 1, .. })));
}

#[test]
fn test_transmit_queues_finish_on_their_own() {
    let plans = plan_queues(Some(2), 2, 64, 1);
    let mut factory = SimFactory::new(small_geometry(), |_: &QueuePlan| {
        SimKernel::new().complete_on_flush(true)
    });
    let mut group = orchestrator(SetupPolicy::Abort)
        .start(&plans, &mut factory, |_: &QueuePlan| {
            Workload::Transmit(Box::new(StaticPayload::tcp_syn()))
        })
        .unwrap();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        tokio::time::timeout(Duration::from_secs(5), group.wait_all_exited())
            .await
            .expect("workers exit after their packet limit");
    });

    let reports = group.join();
    for report in &reports {
        assert_eq!(report.tx_packets, 10);
        assert_eq!(report.lost, 0);
        // Batches of 4, 4 and the drained 2.
        assert_eq!(report.flushes, 3);
    }
    assert_eq!(factory.counters(0).unwrap().completed_frames(), 10);
}
