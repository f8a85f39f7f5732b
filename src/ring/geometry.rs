//! Ring geometry negotiated with the kernel

use crate::capture::sys::{self, tpacket_req3};
use crate::error::RingCreationError;

/// Size the kernel allocates ring blocks in.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// Frame/block layout of one ring.
///
/// Immutable once built; every constructor path goes through [`RingGeometry::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    frame_size: u32,
    block_size: u32,
    block_count: u32,
}

impl RingGeometry {
    pub fn new(
        frame_size: u32,
        block_size: u32,
        block_count: u32,
    ) -> Result<Self, RingCreationError> {
        let invalid = |msg: String| Err(RingCreationError::InvalidGeometry(msg));

        if !frame_size.is_power_of_two() {
            return invalid(format!("frame size {} is not a power of two", frame_size));
        }
        if (frame_size as usize) < sys::TPACKET3_HDRLEN {
            return invalid(format!(
                "frame size {} is smaller than the {} byte frame header",
                frame_size,
                sys::TPACKET3_HDRLEN
            ));
        }
        if frame_size as usize % sys::TPACKET_ALIGNMENT != 0 {
            return invalid(format!(
                "frame size {} is not a multiple of {}",
                frame_size,
                sys::TPACKET_ALIGNMENT
            ));
        }
        if block_size == 0 || block_size as usize % page_size() != 0 {
            return invalid(format!(
                "block size {} is not a multiple of the page size {}",
                block_size,
                page_size()
            ));
        }
        if block_size % frame_size != 0 {
            return invalid(format!(
                "block size {} is not a multiple of frame size {}",
                block_size, frame_size
            ));
        }
        if block_count == 0 {
            return invalid("block count must be at least 1".to_string());
        }
        if (block_size as usize).checked_mul(block_count as usize).is_none()
            || (block_size as u64 / frame_size as u64) * block_count as u64 > u32::MAX as u64
        {
            return invalid(format!(
                "{} blocks of {} bytes overflow the ring size",
                block_count, block_size
            ));
        }

        Ok(Self {
            frame_size,
            block_size,
            block_count,
        })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size as usize
    }

    pub fn block_size(&self) -> usize {
        self.block_size as usize
    }

    pub fn block_count(&self) -> usize {
        self.block_count as usize
    }

    pub fn frames_per_block(&self) -> usize {
        (self.block_size / self.frame_size) as usize
    }

    /// Total frame slots across all blocks.
    pub fn frame_count(&self) -> usize {
        self.frames_per_block() * self.block_count()
    }

    /// Bytes one ring of this geometry occupies in the mapping.
    pub fn ring_len(&self) -> usize {
        self.block_size() * self.block_count()
    }

    /// Ring request with manual block release, no hash feature and no
    /// private area.
    pub fn to_request(&self) -> tpacket_req3 {
        tpacket_req3 {
            tp_block_size: self.block_size,
            tp_block_nr: self.block_count,
            tp_frame_size: self.frame_size,
            tp_frame_nr: self.frame_count() as u32,
            tp_retire_blk_tov: 0,
            tp_sizeof_priv: 0,
            tp_feature_req_word: 0,
        }
    }
}
