//! Queue orchestrator
//!
//! Provides:
//! - Queue planning (count, CPU placement, shared fanout group)
//! - Per-queue setup under an abort/continue policy
//! - One named worker thread per queue, pinned to its CPU
//! - Cooperative stop and an idempotent join
//!
//! Every queue context, ring included, is moved into its worker and dropped
//! there, so ring memory is only released after the loop using it returns.

use super::affinity;
use super::capture::CaptureLoop;
use super::payload::PayloadSource;
use super::sink::PacketSink;
use super::stop::StopFlag;
use super::transmit::{TransmitLoop, TransmitSettings};
use crate::capture::RingIo;
use crate::config::SetupPolicy;
use crate::ring::{Direction, Ring};
use crate::telemetry::{MetricsRegistry, QueueStats};
use crate::{Error, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn};

// ============================================================================
// Planning
// ============================================================================

/// Where one queue runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePlan {
    pub queue: usize,
    pub cpu: usize,
    pub fanout_group: u16,
}

/// Fanout group id shared by every socket of this process.
pub fn fanout_group_id() -> u16 {
    (std::process::id() & 0xffff) as u16
}

/// One plan per queue: `requested` queues, or one per CPU, capped at
/// `max_queues`; queue `i` runs on CPU `i % cpu_count`.
pub fn plan_queues(
    requested: Option<usize>,
    cpu_count: usize,
    max_queues: usize,
    fanout_group: u16,
) -> Vec<QueuePlan> {
    let cpu_count = cpu_count.max(1);
    let count = requested.unwrap_or(cpu_count).min(max_queues);
    (0..count)
        .map(|queue| QueuePlan {
            queue,
            cpu: queue % cpu_count,
            fanout_group,
        })
        .collect()
}

/// Opens the kernel handle and ring of one queue.
pub trait QueueFactory {
    type Io: RingIo + Send + 'static;

    fn open(&mut self, plan: &QueuePlan, direction: Direction) -> Result<(Self::Io, Ring)>;
}

/// What a queue does with its ring.
pub enum Workload {
    Capture(Box<dyn PacketSink + Send>),
    Transmit(Box<dyn PayloadSource + Send>),
}

impl Workload {
    pub fn direction(&self) -> Direction {
        match self {
            Workload::Capture(_) => Direction::Capture,
            Workload::Transmit(_) => Direction::Transmit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_timeout: Duration,
    pub transmit: TransmitSettings,
    pub setup_policy: SetupPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            transmit: TransmitSettings::default(),
            setup_policy: SetupPolicy::Abort,
        }
    }
}

// ============================================================================
// Queue context and reports
// ============================================================================

/// Everything one worker owns.
///
/// Fields drop in declaration order: the ring is unmapped before the
/// socket behind it closes.
pub struct QueueContext<I> {
    pub ring: Ring,
    pub io: I,
    pub plan: QueuePlan,
    pub direction: Direction,
    pub stats: Arc<QueueStats>,
    pub stop: StopFlag,
}

impl<I: RingIo> QueueContext<I> {
    /// Runs `workload` on this queue until stopped.
    pub fn run(mut self, workload: Workload, settings: &EngineSettings) -> Result<()> {
        match workload {
            Workload::Capture(mut sink) => CaptureLoop::new(settings.poll_timeout).run(
                &self.ring,
                &mut self.io,
                sink.as_mut(),
                &self.stats,
                &self.stop,
            ),
            Workload::Transmit(mut source) => {
                let mut transmit = TransmitLoop::new(settings.transmit.clone());
                transmit
                    .run(
                        &self.ring,
                        &mut self.io,
                        source.as_mut(),
                        &self.stats,
                        &self.stop,
                    )
                    .map(|_| ())
            }
        }
    }
}

/// Final state of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueReport {
    pub queue: usize,
    pub cpu: usize,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub corrupt_blocks: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_dropped: u64,
    pub flushes: u64,
    pub lost: u64,
    /// Why the worker ended, if it was not a requested stop.
    pub error: Option<String>,
}

impl QueueReport {
    fn new(plan: &QueuePlan, stats: &QueueStats, error: Option<String>) -> Self {
        Self {
            queue: plan.queue,
            cpu: plan.cpu,
            rx_packets: stats.rx_packets.get(),
            rx_bytes: stats.rx_bytes.get(),
            corrupt_blocks: stats.corrupt_blocks.get(),
            tx_packets: stats.tx_packets.get(),
            tx_bytes: stats.tx_bytes.get(),
            tx_dropped: stats.tx_dropped.get(),
            flushes: stats.flushes.get(),
            lost: stats.lost.get(),
            error,
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    settings: Arc<EngineSettings>,
    metrics: Arc<MetricsRegistry>,
}

impl Orchestrator {
    pub fn new(settings: EngineSettings, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            settings: Arc::new(settings),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Sets up every planned queue, then starts one worker per queue.
    ///
    /// Under [`SetupPolicy::Abort`] the first setup failure releases every
    /// ring opened so far and is returned; no worker is started. Under
    /// [`SetupPolicy::Continue`] failed queues are logged and skipped, and
    /// only a run with no queue left fails.
    pub fn start<F, W>(&self, plans: &[QueuePlan], factory: &mut F, mut workload: W) -> Result<EngineGroup>
    where
        F: QueueFactory,
        W: FnMut(&QueuePlan) -> Workload,
    {
        let mut ready = Vec::with_capacity(plans.len());
        let mut last_error = None;

        for plan in plans {
            let work = workload(plan);
            let direction = work.direction();
            match factory.open(plan, direction) {
                Ok((io, ring)) => {
                    let context = QueueContext {
                        ring,
                        io,
                        plan: *plan,
                        direction,
                        stats: self.metrics.register_queue(plan.queue),
                        stop: StopFlag::new(),
                    };
                    ready.push((context, work));
                }
                Err(e) => {
                    let e = Error::setup(plan.queue, e);
                    self.metrics.setup_failures.inc();
                    match self.settings.setup_policy {
                        SetupPolicy::Abort => {
                            error!("{}; aborting start", e);
                            return Err(e);
                        }
                        SetupPolicy::Continue => {
                            error!("{}; continuing without it", e);
                            last_error = Some(e);
                        }
                    }
                }
            }
        }

        if ready.is_empty() {
            return Err(last_error
                .unwrap_or_else(|| Error::Config("no queues to start".to_string())));
        }

        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let mut group = EngineGroup {
            workers: Vec::with_capacity(ready.len()),
            exits: exit_rx,
            exited: 0,
        };

        for (context, work) in ready {
            let plan = context.plan;
            let stop = context.stop.clone();
            let stats = context.stats.clone();
            match spawn_worker(context, work, self.settings.clone(), exit_tx.clone()) {
                Ok(handle) => group.workers.push(Worker {
                    plan,
                    stop,
                    stats,
                    handle: Some(handle),
                    report: None,
                }),
                Err(e) => {
                    // Workers already running are stopped and joined when
                    // the group drops.
                    let e = Error::setup(plan.queue, Error::Io(e));
                    error!("{}", e);
                    self.metrics.setup_failures.inc();
                    if self.settings.setup_policy == SetupPolicy::Abort || group.workers.is_empty() {
                        return Err(e);
                    }
                }
            }
        }

        info!("Started {} queue workers", group.workers.len());
        Ok(group)
    }
}

fn spawn_worker<I>(
    context: QueueContext<I>,
    workload: Workload,
    settings: Arc<EngineSettings>,
    exit_tx: mpsc::UnboundedSender<usize>,
) -> std::io::Result<JoinHandle<Result<()>>>
where
    I: RingIo + Send + 'static,
{
    let plan = context.plan;
    thread::Builder::new()
        .name(format!("pktring-q{}", plan.queue))
        .spawn(move || {
            let span = info_span!("queue", id = plan.queue, cpu = plan.cpu);
            let _enter = span.enter();

            if let Err(e) = affinity::pin_current_thread(plan.cpu) {
                warn!("Could not pin to CPU {}: {}", plan.cpu, e);
            }

            let stats = context.stats.clone();
            let result = context.run(workload, &settings);
            if let Err(e) = &result {
                stats.errors.inc();
                error!("Queue {} stopped: {}", plan.queue, e);
            }
            let _ = exit_tx.send(plan.queue);
            result
        })
}

// ============================================================================
// Engine group
// ============================================================================

struct Worker {
    plan: QueuePlan,
    stop: StopFlag,
    stats: Arc<QueueStats>,
    handle: Option<JoinHandle<Result<()>>>,
    report: Option<QueueReport>,
}

impl Worker {
    fn join(&mut self) -> QueueReport {
        if let Some(handle) = self.handle.take() {
            let error = match handle.join() {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => {
                    self.stats.errors.inc();
                    error!("Queue {} worker panicked", self.plan.queue);
                    Some("worker panicked".to_string())
                }
            };
            self.report = Some(QueueReport::new(&self.plan, &self.stats, error));
        }
        self.report
            .clone()
            .unwrap_or_else(|| QueueReport::new(&self.plan, &self.stats, None))
    }
}

/// The running workers of one engine.
pub struct EngineGroup {
    workers: Vec<Worker>,
    exits: mpsc::UnboundedReceiver<usize>,
    exited: usize,
}

impl EngineGroup {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Queue ids that were started.
    pub fn queues(&self) -> Vec<usize> {
        self.workers.iter().map(|w| w.plan.queue).collect()
    }

    fn worker(&self, queue: usize) -> Option<&Worker> {
        self.workers.iter().find(|w| w.plan.queue == queue)
    }

    /// Requests a stop of one queue; false if unknown or already stopping.
    pub fn stop(&self, queue: usize) -> bool {
        self.worker(queue).is_some_and(|w| w.stop.stop())
    }

    /// Requests a stop of every queue. Safe to call any number of times.
    pub fn stop_all(&self) {
        for worker in &self.workers {
            worker.stop.stop();
        }
    }

    pub fn stats(&self, queue: usize) -> Option<Arc<QueueStats>> {
        self.worker(queue).map(|w| w.stats.clone())
    }

    /// Whether the worker of `queue` has returned.
    pub fn is_finished(&self, queue: usize) -> bool {
        self.worker(queue).is_some_and(|w| match &w.handle {
            Some(handle) => handle.is_finished(),
            None => true,
        })
    }

    /// Resolves once every worker has exited on its own or after a stop.
    pub async fn wait_all_exited(&mut self) {
        while self.exited < self.workers.len() {
            match self.exits.recv().await {
                Some(_) => self.exited += 1,
                None => break,
            }
        }
    }

    /// Waits for every worker and returns one report per queue.
    ///
    /// Does not stop anything by itself; call [`EngineGroup::stop_all`]
    /// first unless the workers end on their own. Later calls return the
    /// same reports.
    pub fn join(&mut self) -> Vec<QueueReport> {
        self.workers.iter_mut().map(Worker::join).collect()
    }
}

impl Drop for EngineGroup {
    fn drop(&mut self) {
        self.stop_all();
        self.join();
    }
}
