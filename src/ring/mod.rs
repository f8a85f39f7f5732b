//! Zero-copy rings shared with the kernel
//!
//! Provides:
//! - Geometry validation and ring requests
//! - The mapped region with bounds-checked accessors
//! - Capture block and transmit frame ownership handling

mod allocator;
mod block;
mod frame;
mod geometry;
mod region;

pub use allocator::{Direction, RingAllocator, RingFacility, RingKind};
pub use block::{BlockIndex, BlockStatus, BlockView, PacketRecord, Records, Timestamp};
pub use frame::{FrameSlot, FrameStatus};
pub use geometry::{page_size, RingGeometry};
pub use region::RingRegion;

use crate::{Error, Result};

/// A mapped ring set owned by exactly one queue.
#[derive(Debug)]
pub struct Ring {
    region: RingRegion,
    geometry: RingGeometry,
    rx: Option<BlockIndex>,
    tx: Option<BlockIndex>,
    tx_data_offset: usize,
}

impl Ring {
    pub fn region(&self) -> &RingRegion {
        &self.region
    }

    pub fn geometry(&self) -> &RingGeometry {
        &self.geometry
    }

    pub fn rx_blocks(&self) -> Option<&BlockIndex> {
        self.rx.as_ref()
    }

    pub fn tx_blocks(&self) -> Option<&BlockIndex> {
        self.tx.as_ref()
    }

    /// Offset of the payload inside a transmit frame.
    pub fn tx_data_offset(&self) -> usize {
        self.tx_data_offset
    }

    /// Capture block `block` of the rx ring.
    pub fn block(&self, block: usize) -> Result<BlockView<'_>> {
        let index = self
            .rx
            .as_ref()
            .ok_or_else(|| Error::Config("queue has no capture ring".to_string()))?;
        let base = index.offset(block).ok_or(Error::OutOfBounds {
            offset: block,
            len: 1,
            limit: index.len(),
        })?;
        BlockView::new(&self.region, base, index.block_size())
    }

    /// Transmit slot for the `index`-th frame ever sent, wrapping round the ring.
    pub fn frame(&self, index: u64) -> Result<FrameSlot<'_>> {
        let blocks = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Config("queue has no transmit ring".to_string()))?;
        let per_block = self.geometry.frames_per_block() as u64;
        let block = ((index / per_block) % blocks.len() as u64) as usize;
        let frame = (index % per_block) as usize;
        let base = blocks.offset(block).ok_or(Error::OutOfBounds {
            offset: block,
            len: 1,
            limit: blocks.len(),
        })? + frame * self.geometry.frame_size();

        FrameSlot::new(
            &self.region,
            block * per_block as usize + frame,
            base,
            self.geometry.frame_size(),
            self.tx_data_offset,
        )
    }

    /// Number of transmit slots whose frames the kernel has not finished.
    pub fn outstanding_frames(&self) -> Result<usize> {
        let mut outstanding = 0;
        for i in 0..self.geometry.frame_count() as u64 {
            if self.frame(i)?.status()?.is_outstanding() {
                outstanding += 1;
            }
        }
        Ok(outstanding)
    }
}
