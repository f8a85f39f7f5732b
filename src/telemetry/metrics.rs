//! Metrics collection for ring statistics.
//!
//! Provides thread-safe counters for tracking capture and transmit metrics
//! per queue, plus engine-wide totals.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-queue statistics.
///
/// Written only by the queue's worker; read by anyone.
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Packets handed to the sink.
    pub rx_packets: Counter,
    /// Wire bytes of those packets.
    pub rx_bytes: Counter,
    /// Capture blocks returned to the kernel.
    pub rx_blocks: Counter,
    /// Blocks whose record chain did not fit the block.
    pub corrupt_blocks: Counter,
    /// Frames queued for transmission.
    pub tx_packets: Counter,
    /// Payload bytes of those frames.
    pub tx_bytes: Counter,
    /// Frames the kernel rejected.
    pub tx_dropped: Counter,
    /// Flush requests issued.
    pub flushes: Counter,
    /// Frames still queued when the drain gave up.
    pub lost: Counter,
    /// Fatal errors that ended the worker.
    pub errors: Counter,
}

impl QueueStats {
    /// Creates new queue statistics initialized to zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a received packet.
    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.inc();
        self.rx_bytes.add(bytes as u64);
    }

    /// Records a queued frame.
    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.inc();
        self.tx_bytes.add(bytes as u64);
    }

    /// Counter name/value pairs, in a fixed order.
    pub fn snapshot(&self) -> [(&'static str, u64); 10] {
        [
            ("rx_packets", self.rx_packets.get()),
            ("rx_bytes", self.rx_bytes.get()),
            ("rx_blocks", self.rx_blocks.get()),
            ("corrupt_blocks", self.corrupt_blocks.get()),
            ("tx_packets", self.tx_packets.get()),
            ("tx_bytes", self.tx_bytes.get()),
            ("tx_dropped", self.tx_dropped.get()),
            ("flushes", self.flushes.get()),
            ("lost", self.lost.get()),
            ("errors", self.errors.get()),
        ]
    }
}

/// Global metrics registry for the engine.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Per-queue statistics.
    queues: RwLock<BTreeMap<usize, Arc<QueueStats>>>,

    /// Queues that could not be set up.
    pub setup_failures: Counter,
}

impl MetricsRegistry {
    /// Creates a new metrics registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a queue for statistics tracking.
    ///
    /// Registering a queue twice returns the existing statistics.
    pub fn register_queue(&self, queue: usize) -> Arc<QueueStats> {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        queues.entry(queue).or_default().clone()
    }

    pub fn queue(&self, queue: usize) -> Option<Arc<QueueStats>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&queue)
            .cloned()
    }

    /// Sums every counter over all queues.
    pub fn totals(&self) -> Vec<(String, u64)> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        let mut totals = QueueStats::new().snapshot().map(|(name, _)| (name, 0u64));
        for stats in queues.values() {
            for (total, (_, value)) in totals.iter_mut().zip(stats.snapshot()) {
                total.1 += value;
            }
        }
        totals
            .into_iter()
            .map(|(name, value)| (format!("total_{}", name), value))
            .collect()
    }

    /// Exports all metrics as key-value pairs.
    ///
    /// This format is designed to be easily convertible to Prometheus format
    /// in the future.
    pub fn export(&self) -> Vec<(String, u64)> {
        let mut result = vec![("setup_failures".into(), self.setup_failures.get())];
        result.extend(self.totals());

        // Per-queue metrics
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        for (queue, stats) in queues.iter() {
            result.extend(
                stats
                    .snapshot()
                    .into_iter()
                    .map(|(name, value)| (format!("queue{}_{}", queue, name), value)),
            );
        }

        result
    }
}
