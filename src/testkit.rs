//! Simulated kernel for exercising rings without a network interface
//!
//! [`SimKernel`] stands in for the packet socket: it accepts ring requests,
//! backs them with an anonymous shared mapping and keeps its own view of
//! that memory. Through it the simulation plays the kernel's half of the
//! ownership protocol: filling capture blocks and completing transmit
//! frames, each only when the status word says the kernel owns the slot.

use crate::capture::sys::{self, block_desc, tpacket3_hdr, tpacket_req3};
use crate::capture::{Interest, RingIo};
use crate::engine::{QueueFactory, QueuePlan};
use crate::ring::{
    BlockStatus, Direction, FrameStatus, Ring, RingAllocator, RingFacility, RingGeometry, RingKind,
    RingRegion,
};
use crate::Result;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Offset of the MAC header inside a capture record for untagged Ethernet.
pub const SIM_MAC_OFFSET: usize = sys::tpacket_align(sys::TPACKET3_HDRLEN + 16) - 14;

/// Pause after each endless-traffic block so a capture loop is not starved
/// of CPU by its own producer.
const ENDLESS_PACING: Duration = Duration::from_micros(100);

/// Deterministic payload of the `n`-th simulated packet.
pub fn sim_payload(n: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (n as usize + i) as u8).collect()
}

/// What the simulated kernel has done so far; shared with the test.
#[derive(Debug, Default)]
pub struct SimCounters {
    pub flushes: AtomicU64,
    pub waits: AtomicU64,
    pub delivered_blocks: AtomicU64,
    pub delivered_packets: AtomicU64,
    pub completed_frames: AtomicU64,
}

impl SimCounters {
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn delivered_packets(&self) -> u64 {
        self.delivered_packets.load(Ordering::Relaxed)
    }

    pub fn completed_frames(&self) -> u64 {
        self.completed_frames.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
struct SimRing {
    base: usize,
    block_size: usize,
    block_count: usize,
    frame_size: usize,
}

#[derive(Debug)]
pub struct SimKernel {
    view: Option<RingRegion>,
    requested: BTreeMap<RingKindKey, tpacket_req3>,
    rx: Option<SimRing>,
    tx: Option<SimRing>,
    version_error: Option<i32>,
    ring_error: Option<i32>,
    wait_error: Option<i32>,
    traffic: VecDeque<Vec<u32>>,
    endless: Option<Vec<u32>>,
    complete_on_flush: bool,
    fill_cursor: usize,
    seq: u64,
    packets: u64,
    counters: Arc<SimCounters>,
}

/// `RingKind` in map-key form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum RingKindKey {
    Rx,
    Tx,
}

impl From<RingKind> for RingKindKey {
    fn from(kind: RingKind) -> Self {
        match kind {
            RingKind::Rx => RingKindKey::Rx,
            RingKind::Tx => RingKindKey::Tx,
        }
    }
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimKernel {
    pub fn new() -> Self {
        Self {
            view: None,
            requested: BTreeMap::new(),
            rx: None,
            tx: None,
            version_error: None,
            ring_error: None,
            wait_error: None,
            traffic: VecDeque::new(),
            endless: None,
            complete_on_flush: false,
            fill_cursor: 0,
            seq: 0,
            packets: 0,
            counters: Arc::new(SimCounters::default()),
        }
    }

    /// Blocks to deliver on readable waits, one record length list per block.
    pub fn with_traffic(mut self, blocks: Vec<Vec<u32>>) -> Self {
        self.traffic = blocks.into();
        self
    }

    /// Delivers a block of these record lengths on every readable wait.
    pub fn with_endless_traffic(mut self, lengths: Vec<u32>) -> Self {
        self.endless = Some(lengths);
        self
    }

    /// Sends every send-requested frame whenever user space flushes.
    pub fn complete_on_flush(mut self, complete: bool) -> Self {
        self.complete_on_flush = complete;
        self
    }

    /// Refuses TPACKET_V3 with `errno`.
    pub fn failing_version(mut self, errno: i32) -> Self {
        self.version_error = Some(errno);
        self
    }

    /// Refuses ring requests with `errno`.
    pub fn failing_rings(mut self, errno: i32) -> Self {
        self.ring_error = Some(errno);
        self
    }

    /// Fails every wait with `errno`.
    pub fn failing_waits(mut self, errno: i32) -> Self {
        self.wait_error = Some(errno);
        self
    }

    pub fn counters(&self) -> Arc<SimCounters> {
        self.counters.clone()
    }

    fn view(&self) -> Result<&RingRegion> {
        self.view
            .as_ref()
            .ok_or_else(|| crate::Error::Config("simulated ring not mapped".to_string()))
    }

    fn rx(&self) -> Result<SimRing> {
        self.rx
            .ok_or_else(|| crate::Error::Config("simulated rx ring not requested".to_string()))
    }

    fn tx(&self) -> Result<SimRing> {
        self.tx
            .ok_or_else(|| crate::Error::Config("simulated tx ring not requested".to_string()))
    }

    fn frame_offset(ring: &SimRing, slot: usize) -> usize {
        let per_block = ring.block_size / ring.frame_size;
        let block = (slot / per_block) % ring.block_count;
        ring.base + block * ring.block_size + (slot % per_block) * ring.frame_size
    }

    pub fn block_status(&self, block: usize) -> Result<BlockStatus> {
        let rx = self.rx()?;
        self.view()?
            .load_status(rx.base + block * rx.block_size + block_desc::BLOCK_STATUS)
            .map(BlockStatus::from_raw)
    }

    pub fn frame_status(&self, slot: usize) -> Result<FrameStatus> {
        let tx = self.tx()?;
        self.view()?
            .load_status(Self::frame_offset(&tx, slot) + tpacket3_hdr::STATUS)
            .map(FrameStatus::from_raw)
    }

    /// Fills the next capture block with records of `lengths`, as far as
    /// they fit, and hands it to user space.
    ///
    /// Returns false without touching memory while user space still owns
    /// the block.
    pub fn deliver_block(&mut self, lengths: &[u32]) -> Result<bool> {
        let rx = self.rx()?;
        let view = self.view()?.kernel_view();
        let base = rx.base + self.fill_cursor * rx.block_size;

        if self.block_status(self.fill_cursor)? == BlockStatus::UserOwned {
            return Ok(false);
        }

        let first = sys::tpacket_align(block_desc::LEN);
        let mut offset = first;
        let mut written = 0u32;
        let mut prev: Option<usize> = None;

        for &len in lengths {
            let stride = sys::tpacket_align(SIM_MAC_OFFSET + len as usize);
            if offset + stride > rx.block_size {
                break;
            }
            let hdr = base + offset;
            let n = self.packets;
            view.store_u32(hdr + tpacket3_hdr::NEXT_OFFSET, 0)?;
            view.store_u32(hdr + tpacket3_hdr::SEC, 1_700_000_000 + (n / 1_000_000) as u32)?;
            view.store_u32(hdr + tpacket3_hdr::NSEC, ((n % 1_000_000) * 1_000) as u32)?;
            view.store_u32(hdr + tpacket3_hdr::SNAPLEN, len)?;
            view.store_u32(hdr + tpacket3_hdr::LEN, len)?;
            view.store_u16(hdr + tpacket3_hdr::MAC, SIM_MAC_OFFSET as u16)?;
            view.store_u16(hdr + tpacket3_hdr::NET, (SIM_MAC_OFFSET + 14) as u16)?;
            view.write_bytes(hdr + SIM_MAC_OFFSET, &sim_payload(n, len as usize))?;
            if let Some(prev) = prev {
                view.store_u32(base + prev + tpacket3_hdr::NEXT_OFFSET, (offset - prev) as u32)?;
            }

            prev = Some(offset);
            offset += stride;
            written += 1;
            self.packets += 1;
        }

        self.seq += 1;
        view.store_u32(base + block_desc::VERSION, 1)?;
        view.store_u32(base + block_desc::NUM_PKTS, written)?;
        view.store_u32(base + block_desc::OFFSET_TO_FIRST_PKT, first as u32)?;
        view.store_u32(base + block_desc::BLK_LEN, offset as u32)?;
        view.store_u64(base + block_desc::SEQ_NUM, self.seq)?;
        view.store_status(base + block_desc::BLOCK_STATUS, sys::TP_STATUS_USER)?;

        self.fill_cursor = (self.fill_cursor + 1) % rx.block_count;
        self.counters.delivered_blocks.fetch_add(1, Ordering::Relaxed);
        self.counters
            .delivered_packets
            .fetch_add(written as u64, Ordering::Relaxed);
        Ok(true)
    }

    /// Overwrites `num_pkts` of block `block`, simulating a corrupt header.
    pub fn corrupt_block(&mut self, block: usize, num_pkts: u32) -> Result<()> {
        let rx = self.rx()?;
        self.view()?
            .store_u32(rx.base + block * rx.block_size + block_desc::NUM_PKTS, num_pkts)
    }

    /// Sends every send-requested frame and returns how many there were.
    pub fn complete_frames(&mut self) -> Result<usize> {
        self.finish_frames(sys::TP_STATUS_AVAILABLE)
    }

    /// Rejects every send-requested frame as malformed.
    pub fn reject_frames(&mut self) -> Result<usize> {
        self.finish_frames(sys::TP_STATUS_WRONG_FORMAT)
    }

    fn finish_frames(&mut self, status: u32) -> Result<usize> {
        let tx = self.tx()?;
        let view = self.view()?;
        let slots = (tx.block_size / tx.frame_size) * tx.block_count;
        let mut finished = 0;
        for slot in 0..slots {
            let at = Self::frame_offset(&tx, slot) + tpacket3_hdr::STATUS;
            if FrameStatus::from_raw(view.load_status(at)?) == FrameStatus::SendRequested {
                view.store_status(at, status)?;
                finished += 1;
            }
        }
        if status == sys::TP_STATUS_AVAILABLE {
            self.counters
                .completed_frames
                .fetch_add(finished as u64, Ordering::Relaxed);
        }
        Ok(finished)
    }

    /// Payload of transmit slot `slot` as user space composed it.
    pub fn frame_payload(&self, slot: usize, data_offset: usize) -> Result<Vec<u8>> {
        let tx = self.tx()?;
        let view = self.view()?;
        let at = Self::frame_offset(&tx, slot);
        let len = view.load_u32(at + tpacket3_hdr::LEN)? as usize;
        Ok(view.bytes(at + data_offset, len)?.to_vec())
    }
}

impl RingFacility for SimKernel {
    fn set_version(&mut self) -> io::Result<()> {
        match self.version_error {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }

    fn header_len(&mut self) -> io::Result<usize> {
        Ok(sys::TPACKET3_HDR_LEN)
    }

    fn request_ring(&mut self, kind: RingKind, req: &tpacket_req3) -> io::Result<()> {
        if let Some(errno) = self.ring_error {
            return Err(io::Error::from_raw_os_error(errno));
        }
        self.requested.insert(kind.into(), *req);
        Ok(())
    }

    fn accepted_len(&self, kind: RingKind) -> Option<usize> {
        self.requested
            .get(&kind.into())
            .map(|req| req.tp_block_size as usize * req.tp_block_nr as usize)
    }

    fn map(&mut self, len: usize) -> io::Result<RingRegion> {
        let region = RingRegion::anonymous(len)?;
        let mut base = 0;
        for (kind, req) in &self.requested {
            let ring = SimRing {
                base,
                block_size: req.tp_block_size as usize,
                block_count: req.tp_block_nr as usize,
                frame_size: req.tp_frame_size as usize,
            };
            match kind {
                RingKindKey::Rx => self.rx = Some(ring),
                RingKindKey::Tx => self.tx = Some(ring),
            }
            base += ring.block_size * ring.block_count;
        }
        self.view = Some(region.kernel_view());
        Ok(region)
    }
}

impl RingIo for SimKernel {
    fn wait(&mut self, interest: Interest, timeout: Duration) -> io::Result<bool> {
        self.counters.waits.fetch_add(1, Ordering::Relaxed);
        if let Some(errno) = self.wait_error {
            return Err(io::Error::from_raw_os_error(errno));
        }

        if interest == Interest::Readable {
            if let Some(lengths) = self.traffic.front().cloned() {
                if self.deliver_block(&lengths).map_err(io::Error::other)? {
                    self.traffic.pop_front();
                    return Ok(true);
                }
            } else if let Some(lengths) = self.endless.clone() {
                if self.deliver_block(&lengths).map_err(io::Error::other)? {
                    thread::sleep(ENDLESS_PACING);
                    return Ok(true);
                }
            }
        }

        thread::sleep(timeout);
        Ok(false)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        if self.complete_on_flush {
            self.complete_frames().map_err(io::Error::other)?;
        }
        Ok(())
    }
}

/// Opens one [`SimKernel`] per queue, built by a closure.
pub struct SimFactory<B> {
    geometry: RingGeometry,
    build: B,
    counters: BTreeMap<usize, Arc<SimCounters>>,
}

impl<B> SimFactory<B>
where
    B: FnMut(&QueuePlan) -> SimKernel,
{
    pub fn new(geometry: RingGeometry, build: B) -> Self {
        Self {
            geometry,
            build,
            counters: BTreeMap::new(),
        }
    }

    /// Counters of the simulated kernel behind `queue`, once opened.
    pub fn counters(&self, queue: usize) -> Option<Arc<SimCounters>> {
        self.counters.get(&queue).cloned()
    }
}

impl<B> QueueFactory for SimFactory<B>
where
    B: FnMut(&QueuePlan) -> SimKernel,
{
    type Io = SimKernel;

    fn open(&mut self, plan: &QueuePlan, direction: Direction) -> Result<(SimKernel, Ring)> {
        let mut sim = (self.build)(plan);
        let ring = RingAllocator::new(self.geometry, direction).allocate(&mut sim)?;
        self.counters.insert(plan.queue, sim.counters());
        Ok((sim, ring))
    }
}
