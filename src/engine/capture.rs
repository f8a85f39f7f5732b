//! Capture loop
//!
//! Walks the rx ring block by block in physical order. A block is read only
//! after its status says user space owns it, every record is handed to the
//! sink, and the block goes back to the kernel before the cursor moves on.

use super::stop::StopFlag;
use crate::capture::{Interest, RingIo};
use crate::engine::sink::PacketSink;
use crate::error::is_transient_io;
use crate::ring::{BlockStatus, Ring};
use crate::telemetry::QueueStats;
use crate::{Error, Result};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// What one look at the block under the cursor found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The kernel still owns the block.
    Pending,
    /// Records delivered and the block released.
    Consumed { packets: u32 },
    /// Record chain inconsistent; delivered what was valid, then released.
    Corrupt { packets: u32 },
}

/// Per-queue capture state.
#[derive(Debug)]
pub struct CaptureLoop {
    cursor: usize,
    poll_timeout: Duration,
}

impl CaptureLoop {
    pub fn new(poll_timeout: Duration) -> Self {
        Self {
            cursor: 0,
            poll_timeout,
        }
    }

    /// Index of the next block to inspect.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Handles the block under the cursor if user space owns it.
    pub fn poll_block<S>(&mut self, ring: &Ring, sink: &mut S, stats: &QueueStats) -> Result<BlockOutcome>
    where
        S: PacketSink + ?Sized,
    {
        let block = ring.block(self.cursor)?;
        if block.status()? != BlockStatus::UserOwned {
            return Ok(BlockOutcome::Pending);
        }

        let mut packets = 0;
        let mut corrupt = None;
        match block.records() {
            Ok(records) => {
                for record in records {
                    match record {
                        Ok(record) => {
                            sink.on_packet(record.timestamp, record.len, record.data);
                            stats.record_rx(record.len as usize);
                            packets += 1;
                        }
                        Err(e) => {
                            corrupt = Some(e);
                            break;
                        }
                    }
                }
            }
            Err(e) => corrupt = Some(e),
        }

        block.release()?;
        stats.rx_blocks.inc();
        trace!("Block {} released after {} packets", self.cursor, packets);

        let index = self.cursor;
        self.cursor = (self.cursor + 1) % ring.rx_blocks().map_or(1, |b| b.len().max(1));

        match corrupt {
            Some(e) => {
                stats.corrupt_blocks.inc();
                warn!("Block {}: {}; released and skipped", index, e);
                Ok(BlockOutcome::Corrupt { packets })
            }
            None => Ok(BlockOutcome::Consumed { packets }),
        }
    }

    /// Runs until `stop` is set or a fatal error occurs.
    pub fn run<I, S>(
        &mut self,
        ring: &Ring,
        io: &mut I,
        sink: &mut S,
        stats: &QueueStats,
        stop: &StopFlag,
    ) -> Result<()>
    where
        I: RingIo + ?Sized,
        S: PacketSink + ?Sized,
    {
        let blocks = ring
            .rx_blocks()
            .map(|b| b.len())
            .ok_or_else(|| Error::Config("capture needs an rx ring".to_string()))?;
        info!("Capture started on {} blocks", blocks);

        while !stop.is_stopped() {
            if self.poll_block(ring, sink, stats)? != BlockOutcome::Pending {
                continue;
            }
            match io.wait(Interest::Readable, self.poll_timeout) {
                Ok(_) => {}
                Err(e) if is_transient_io(&e) => {
                    debug!("Capture wait interrupted: {}", e);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }

        info!(
            "Capture stopped: {} packets, {} blocks",
            stats.rx_packets.get(),
            stats.rx_blocks.get()
        );
        Ok(())
    }
}
