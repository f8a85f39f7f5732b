//! Ring negotiation and mapping
//!
//! Drives a [`RingFacility`] through version selection, ring requests and
//! the mapping, and turns the result into a [`Ring`]. Any failure leaves
//! nothing mapped.

use super::block::BlockIndex;
use super::geometry::{page_size, RingGeometry};
use super::region::RingRegion;
use super::Ring;
use crate::capture::sys::{self, tpacket_req3};
use crate::error::RingCreationError;
use std::io;
use tracing::{debug, warn};

/// Which rings a queue needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Capture,
    Transmit,
    Both,
}

impl Direction {
    pub fn has_rx(&self) -> bool {
        matches!(self, Direction::Capture | Direction::Both)
    }

    pub fn has_tx(&self) -> bool {
        matches!(self, Direction::Transmit | Direction::Both)
    }
}

/// One of the two rings a packet socket can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    Rx,
    Tx,
}

impl RingKind {
    pub fn name(&self) -> &'static str {
        match self {
            RingKind::Rx => "rx",
            RingKind::Tx => "tx",
        }
    }
}

/// Kernel side of ring setup.
///
/// Implemented by the packet socket and by simulated kernels in tests.
pub trait RingFacility {
    /// Selects TPACKET_V3.
    fn set_version(&mut self) -> io::Result<()>;

    /// Size of the V3 frame header as the kernel reports it.
    fn header_len(&mut self) -> io::Result<usize>;

    fn request_ring(&mut self, kind: RingKind, req: &tpacket_req3) -> io::Result<()>;

    /// Bytes the facility reserved for `kind`, once requested.
    fn accepted_len(&self, kind: RingKind) -> Option<usize>;

    fn map(&mut self, len: usize) -> io::Result<RingRegion>;

    /// Pins a mapped ring in RAM.
    fn lock(&mut self, region: &mut RingRegion) -> io::Result<()> {
        region.lock()
    }
}

/// Builds rings of one geometry.
#[derive(Debug, Clone)]
pub struct RingAllocator {
    geometry: RingGeometry,
    direction: Direction,
    lock_pages: bool,
}

impl RingAllocator {
    pub fn new(geometry: RingGeometry, direction: Direction) -> Self {
        Self {
            geometry,
            direction,
            lock_pages: false,
        }
    }

    pub fn lock_pages(mut self, lock: bool) -> Self {
        self.lock_pages = lock;
        self
    }

    pub fn geometry(&self) -> &RingGeometry {
        &self.geometry
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn allocate<F: RingFacility>(&self, facility: &mut F) -> Result<Ring, RingCreationError> {
        facility.set_version().map_err(|e| match e.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => RingCreationError::PermissionDenied(e),
            _ => RingCreationError::UnsupportedVersion(e),
        })?;

        let header_len = facility
            .header_len()
            .map_err(RingCreationError::UnsupportedVersion)?;
        let tx_data_offset = sys::tpacket_align(header_len);
        if tx_data_offset >= self.geometry.frame_size() {
            return Err(RingCreationError::InvalidGeometry(format!(
                "frame header of {} bytes leaves no room in {} byte frames",
                header_len,
                self.geometry.frame_size()
            )));
        }

        let req = self.geometry.to_request();
        let mut kinds = Vec::with_capacity(2);
        if self.direction.has_rx() {
            kinds.push(RingKind::Rx);
        }
        if self.direction.has_tx() {
            kinds.push(RingKind::Tx);
        }

        for &kind in &kinds {
            facility
                .request_ring(kind, &req)
                .map_err(|e| self.request_error(kind, e))?;
        }

        // The mapping carries the rx ring first and the tx ring right after
        // it; where one ends is what the facility reports, not what the
        // request implies.
        let mut lens = Vec::with_capacity(2);
        for &kind in &kinds {
            let len = facility.accepted_len(kind).ok_or_else(|| RingCreationError::Rejected {
                kind: kind.name(),
                source: io::Error::other("facility reported no ring size"),
            })?;
            if len < self.geometry.ring_len() || len % page_size() != 0 {
                return Err(RingCreationError::InvalidGeometry(format!(
                    "{} ring reported {} bytes, expected at least {} page-aligned bytes",
                    kind.name(),
                    len,
                    self.geometry.ring_len()
                )));
            }
            lens.push((kind, len));
        }
        let total: usize = lens.iter().map(|(_, len)| len).sum();

        let mut region = facility.map(total).map_err(RingCreationError::Map)?;
        if self.lock_pages {
            if let Err(e) = facility.lock(&mut region) {
                warn!("Could not lock {} bytes of ring memory: {}", total, e);
            }
        }

        let mut rx = None;
        let mut tx = None;
        let mut base = 0;
        for (kind, len) in lens {
            let index = BlockIndex::new(
                base,
                self.geometry.block_size(),
                self.geometry.block_count(),
            );
            match kind {
                RingKind::Rx => rx = Some(index),
                RingKind::Tx => tx = Some(index),
            }
            base += len;
        }

        debug!(
            "Mapped {} bytes: rx={:?} tx={:?} frame data at +{}",
            total,
            rx.as_ref().map(|i| i.start()..i.end()),
            tx.as_ref().map(|i| i.start()..i.end()),
            tx_data_offset
        );

        Ok(Ring {
            region,
            geometry: self.geometry,
            rx,
            tx,
            tx_data_offset,
        })
    }

    fn request_error(&self, kind: RingKind, e: io::Error) -> RingCreationError {
        match e.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => RingCreationError::PermissionDenied(e),
            Some(libc::EINVAL) => RingCreationError::InvalidGeometry(format!(
                "{} ring of {} x {} byte blocks ({} byte frames) rejected: {}",
                kind.name(),
                self.geometry.block_count(),
                self.geometry.block_size(),
                self.geometry.frame_size(),
                e
            )),
            _ => RingCreationError::Rejected {
                kind: kind.name(),
                source: e,
            },
        }
    }
}
