//! Transmit loop
//!
//! Fills tx frames round robin, flips each to send-requested and kicks the
//! kernel once per batch. On the way out it drains what is still queued and
//! reports anything the kernel never sent.

use super::payload::PayloadSource;
use super::stop::StopFlag;
use crate::capture::{Interest, RingIo};
use crate::error::is_transient_io;
use crate::ring::{FrameStatus, Ring};
use crate::telemetry::QueueStats;
use crate::{Error, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TransmitSettings {
    /// Frames composed between two flushes.
    pub batch_size: u64,
    pub poll_timeout: Duration,
    /// Stop after this many frames.
    pub packet_limit: Option<u64>,
    pub flush_retries: u32,
    pub flush_retry_delay: Duration,
}

impl Default for TransmitSettings {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            poll_timeout: Duration::from_secs(1),
            packet_limit: None,
            flush_retries: 3,
            flush_retry_delay: Duration::from_millis(100),
        }
    }
}

/// How the shutdown drain went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Flush requests issued while draining.
    pub flushes: u32,
    /// Waits for outstanding frames.
    pub retries: u32,
    /// Frames the kernel had not sent when the drain gave up.
    pub lost: usize,
}

/// Per-queue transmit state.
#[derive(Debug)]
pub struct TransmitLoop {
    settings: TransmitSettings,
    next: u64,
    unflushed: u64,
}

impl TransmitLoop {
    pub fn new(settings: TransmitSettings) -> Self {
        Self {
            settings,
            next: 0,
            unflushed: 0,
        }
    }

    /// Frames composed so far.
    pub fn sent(&self) -> u64 {
        self.next
    }

    /// Frames composed since the last successful flush.
    pub fn unflushed(&self) -> u64 {
        self.unflushed
    }

    fn limit_reached(&self) -> bool {
        self.settings
            .packet_limit
            .is_some_and(|limit| self.next >= limit)
    }

    /// Composes `payload` into the next slot if the kernel has handed it back.
    ///
    /// Returns false, touching nothing, when the slot is still in flight.
    pub fn try_send<I>(&mut self, ring: &Ring, io: &mut I, payload: &[u8], stats: &QueueStats) -> Result<bool>
    where
        I: RingIo + ?Sized,
    {
        let slot = ring.frame(self.next)?;
        match slot.status()? {
            FrameStatus::Available => {}
            FrameStatus::Error(raw) => {
                debug!("Frame {} rejected by kernel (status {:#x})", slot.index(), raw);
                stats.tx_dropped.inc();
                slot.reclaim()?;
            }
            FrameStatus::SendRequested | FrameStatus::Sending => return Ok(false),
        }

        slot.compose(payload)?;
        stats.record_tx(payload.len());
        self.next += 1;
        self.unflushed += 1;

        if self.next % self.settings.batch_size.max(1) == 0 {
            self.flush(io, stats)?;
        }
        Ok(true)
    }

    /// Asks the kernel to send what is queued.
    ///
    /// Transient failures leave the frames counted as unflushed for the next
    /// attempt.
    pub fn flush<I>(&mut self, io: &mut I, stats: &QueueStats) -> Result<()>
    where
        I: RingIo + ?Sized,
    {
        match io.flush() {
            Ok(()) => {
                stats.flushes.inc();
                self.unflushed = 0;
                Ok(())
            }
            Err(e) if is_transient_io(&e) => {
                debug!("Flush deferred: {}", e);
                Ok(())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Sends until `stop` is set or the packet limit is reached, then drains.
    pub fn run<I, P>(
        &mut self,
        ring: &Ring,
        io: &mut I,
        source: &mut P,
        stats: &QueueStats,
        stop: &StopFlag,
    ) -> Result<DrainReport>
    where
        I: RingIo + ?Sized,
        P: PayloadSource + ?Sized,
    {
        let capacity = ring.frame(0)?.capacity();
        if source.max_len() > capacity {
            return Err(Error::PayloadTooLarge {
                len: source.max_len(),
                capacity,
            });
        }
        info!(
            "Transmit started: {} frames of {} bytes, batch {}",
            ring.geometry().frame_count(),
            ring.geometry().frame_size(),
            self.settings.batch_size
        );

        'send: while !self.limit_reached() {
            let payload = source.next_payload();
            loop {
                if stop.is_stopped() {
                    break 'send;
                }
                if self.try_send(ring, io, payload, stats)? {
                    break;
                }
                // The ring is full of queued frames the kernel may not have
                // been told about yet.
                if self.unflushed > 0 {
                    self.flush(io, stats)?;
                }
                match io.wait(Interest::Writable, self.settings.poll_timeout) {
                    Ok(_) => {}
                    Err(e) if is_transient_io(&e) => {}
                    Err(e) => return Err(Error::Io(e)),
                }
            }
        }

        let report = self.drain(ring, io, stats)?;
        info!(
            "Transmit stopped: {} frames, {} flushes, {} lost",
            self.next,
            stats.flushes.get(),
            report.lost
        );
        Ok(report)
    }

    /// Flushes the tail of the last batch and waits for queued frames.
    ///
    /// I/O failures end the drain early; whatever is still queued then is
    /// reported as lost rather than returned as an error.
    pub fn drain<I>(&mut self, ring: &Ring, io: &mut I, stats: &QueueStats) -> Result<DrainReport>
    where
        I: RingIo + ?Sized,
    {
        let mut report = DrainReport::default();

        if self.unflushed > 0 {
            match io.flush() {
                Ok(()) => {
                    stats.flushes.inc();
                    report.flushes += 1;
                    self.unflushed = 0;
                }
                Err(e) => warn!("Final flush failed: {}", e),
            }
        }

        let mut outstanding = ring.outstanding_frames()?;
        while outstanding > 0 && report.retries < self.settings.flush_retries {
            if report.retries > 0 {
                match io.flush() {
                    Ok(()) => {
                        stats.flushes.inc();
                        report.flushes += 1;
                    }
                    Err(e) if is_transient_io(&e) => {}
                    Err(e) => {
                        warn!("Flush retry failed: {}", e);
                        break;
                    }
                }
            }
            report.retries += 1;
            // The socket polls writable as soon as one slot is free, so
            // readiness says nothing about the rest of the ring.
            std::thread::sleep(self.settings.flush_retry_delay);
            outstanding = ring.outstanding_frames()?;
        }

        report.lost = outstanding;
        if outstanding > 0 {
            stats.lost.add(outstanding as u64);
            warn!(
                "{} frames still queued after {} flush retries, reported lost",
                outstanding, report.retries
            );
        }
        Ok(report)
    }
}
