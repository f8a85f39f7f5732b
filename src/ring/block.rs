//! Capture blocks and the packet records inside them
//!
//! A capture block is handed back and forth through its `block_status` word:
//! - `TP_STATUS_KERNEL`: the kernel may fill it, user space must not touch it
//! - `TP_STATUS_USER`: the kernel has finished; user space reads every record
//!   and then stores `TP_STATUS_KERNEL` to give it back

use super::region::RingRegion;
use crate::capture::sys::{self, block_desc, tpacket3_hdr};
use crate::{Error, Result};
use std::fmt;

/// Capture timestamp as written by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub sec: u32,
    pub nsec: u32,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// Which party may currently write a capture block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    KernelOwned,
    UserOwned,
}

impl BlockStatus {
    /// Decodes a raw `block_status`; extra kernel flag bits (timeouts, losses)
    /// do not change ownership.
    pub fn from_raw(raw: u32) -> Self {
        if raw & sys::TP_STATUS_USER != 0 {
            BlockStatus::UserOwned
        } else {
            BlockStatus::KernelOwned
        }
    }
}

/// Offsets of every block of one ring inside the shared region.
///
/// Index order is physical order, which is also the order the kernel fills
/// capture blocks and the round-robin order of transmit frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndex {
    offsets: Vec<usize>,
    block_size: usize,
}

impl BlockIndex {
    pub fn new(base: usize, block_size: usize, block_count: usize) -> Self {
        Self {
            offsets: (0..block_count).map(|i| base + i * block_size).collect(),
            block_size,
        }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn offset(&self, block: usize) -> Option<usize> {
        self.offsets.get(block).copied()
    }

    /// First byte of this ring in the region.
    pub fn start(&self) -> usize {
        self.offsets.first().copied().unwrap_or(0)
    }

    /// One past the last byte of this ring in the region.
    pub fn end(&self) -> usize {
        self.offsets
            .last()
            .map(|last| last + self.block_size)
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.offsets.iter().copied()
    }
}

/// One decoded capture record.
///
/// `data` aliases ring memory and borrows the [`BlockView`] it came from,
/// so it cannot outlive the block's release.
#[derive(Debug, Clone, Copy)]
pub struct PacketRecord<'a> {
    pub timestamp: Timestamp,
    /// Length on the wire.
    pub len: u32,
    /// Bytes actually captured (`data.len()`).
    pub snaplen: u32,
    pub vlan_tci: u32,
    pub data: &'a [u8],
}

/// Typed accessor for one capture block.
pub struct BlockView<'a> {
    region: &'a RingRegion,
    base: usize,
    size: usize,
}

impl<'a> BlockView<'a> {
    pub fn new(region: &'a RingRegion, base: usize, size: usize) -> Result<Self> {
        // Bounds-check the whole block once so later field reads cannot stray.
        region.bytes(base, size)?;
        Ok(Self { region, base, size })
    }

    pub fn status(&self) -> Result<BlockStatus> {
        self.raw_status().map(BlockStatus::from_raw)
    }

    pub fn raw_status(&self) -> Result<u32> {
        self.region.load_status(self.base + block_desc::BLOCK_STATUS)
    }

    pub fn num_pkts(&self) -> Result<u32> {
        self.region.load_u32(self.base + block_desc::NUM_PKTS)
    }

    pub fn seq_num(&self) -> Result<u64> {
        self.region.load_u64(self.base + block_desc::SEQ_NUM)
    }

    /// Gives the block back to the kernel.
    ///
    /// Callers must have observed [`BlockStatus::UserOwned`]. The view is
    /// consumed, so no record borrowed from it survives the release:
    ///
    /// ```compile_fail
    /// use pktring::ring::{BlockView, RingRegion};
    ///
    /// fn stale(region: &RingRegion) -> pktring::Result<()> {
    ///     let block = BlockView::new(region, 0, 4096)?;
    ///     let first = block.records()?.next();
    ///     block.release()?;
    ///     drop(first);
    ///     Ok(())
    /// }
    /// ```
    pub fn release(self) -> Result<()> {
        self.region
            .store_status(self.base + block_desc::BLOCK_STATUS, sys::TP_STATUS_KERNEL)
    }

    /// Walks the record chain of a user-owned block.
    pub fn records(&self) -> Result<Records<'_>> {
        let remaining = self.num_pkts()?;
        let first = self.region.load_u32(self.base + block_desc::OFFSET_TO_FIRST_PKT)? as usize;

        if remaining > 0 && (first < block_desc::LEN || first >= self.size) {
            return Err(Error::CorruptBlock(format!(
                "first packet offset {} outside block of {} bytes",
                first, self.size
            )));
        }

        Ok(Records {
            region: self.region,
            base: self.base,
            size: self.size,
            cursor: first,
            remaining,
        })
    }
}

/// Iterator over the `num_pkts` records of a block.
///
/// Every header and payload span is checked against the block bounds before
/// it is read; the first inconsistency ends the walk with an error.
pub struct Records<'a> {
    region: &'a RingRegion,
    base: usize,
    size: usize,
    cursor: usize,
    remaining: u32,
}

impl<'a> Records<'a> {
    fn decode(&mut self) -> Result<PacketRecord<'a>> {
        let rel = self.cursor;
        if rel + sys::TPACKET3_HDR_LEN > self.size {
            return Err(Error::CorruptBlock(format!(
                "packet header at {} crosses block end {}",
                rel, self.size
            )));
        }
        let hdr = self.base + rel;
        let region = self.region;

        let next = region.load_u32(hdr + tpacket3_hdr::NEXT_OFFSET)? as usize;
        let sec = region.load_u32(hdr + tpacket3_hdr::SEC)?;
        let nsec = region.load_u32(hdr + tpacket3_hdr::NSEC)?;
        let snaplen = region.load_u32(hdr + tpacket3_hdr::SNAPLEN)?;
        let len = region.load_u32(hdr + tpacket3_hdr::LEN)?;
        let mac = region.load_u16(hdr + tpacket3_hdr::MAC)? as usize;
        let vlan_tci = region.load_u32(hdr + tpacket3_hdr::VLAN_TCI)?;

        let data_start = rel + mac;
        let data_end = data_start + snaplen as usize;
        if mac < sys::TPACKET3_HDR_LEN || data_end > self.size {
            return Err(Error::CorruptBlock(format!(
                "packet data {}..{} outside block of {} bytes",
                data_start, data_end, self.size
            )));
        }
        let data = region.bytes(self.base + data_start, snaplen as usize)?;

        self.remaining -= 1;
        // A zero link with packets left sends the next decode past the block
        // end, which reports the broken chain after this record is yielded.
        self.cursor = if next == 0 { self.size } else { rel + next };

        Ok(PacketRecord {
            timestamp: Timestamp { sec, nsec },
            len,
            snaplen,
            vlan_tci,
            data,
        })
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<PacketRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let item = self.decode();
        if item.is_err() {
            self.remaining = 0;
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::geometry::page_size;

    fn write_record(region: &RingRegion, hdr: usize, next: u32, payload: &[u8]) {
        region.store_u32(hdr + tpacket3_hdr::NEXT_OFFSET, next).unwrap();
        region.store_u32(hdr + tpacket3_hdr::SEC, 7).unwrap();
        region.store_u32(hdr + tpacket3_hdr::NSEC, 42).unwrap();
        region
            .store_u32(hdr + tpacket3_hdr::SNAPLEN, payload.len() as u32)
            .unwrap();
        region
            .store_u32(hdr + tpacket3_hdr::LEN, payload.len() as u32)
            .unwrap();
        region.store_u16(hdr + tpacket3_hdr::MAC, 64).unwrap();
        region.write_bytes(hdr + 64, payload).unwrap();
    }

    #[test]
    fn test_block_index_offsets() {
        let index = BlockIndex::new(8192, 4096, 3);
        assert_eq!(index.len(), 3);
        assert_eq!(index.offset(0), Some(8192));
        assert_eq!(index.offset(2), Some(16384));
        assert_eq!(index.offset(3), None);
        assert_eq!(index.start(), 8192);
        assert_eq!(index.end(), 20480);
    }

    #[test]
    fn test_status_flag_bits() {
        assert_eq!(BlockStatus::from_raw(0), BlockStatus::KernelOwned);
        assert_eq!(BlockStatus::from_raw(1), BlockStatus::UserOwned);
        // TP_STATUS_BLK_TMO | TP_STATUS_USER
        assert_eq!(BlockStatus::from_raw(0x21), BlockStatus::UserOwned);
        assert_eq!(BlockStatus::from_raw(0x20), BlockStatus::KernelOwned);
    }

    #[test]
    fn test_records_walk_and_release() {
        let size = page_size();
        let region = RingRegion::anonymous(size).unwrap();
        region.store_u32(block_desc::NUM_PKTS, 2).unwrap();
        region.store_u32(block_desc::OFFSET_TO_FIRST_PKT, 48).unwrap();
        write_record(&region, 48, 128, &[0xaa; 20]);
        write_record(&region, 176, 0, &[0xbb; 30]);
        region.store_status(block_desc::BLOCK_STATUS, sys::TP_STATUS_USER).unwrap();

        let block = BlockView::new(&region, 0, size).unwrap();
        assert_eq!(block.status().unwrap(), BlockStatus::UserOwned);

        let records: Vec<_> = block.records().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].len, 20);
        assert_eq!(records[0].data, &[0xaa; 20][..]);
        assert_eq!(records[1].data, &[0xbb; 30][..]);
        assert_eq!(records[1].timestamp, Timestamp { sec: 7, nsec: 42 });

        block.release().unwrap();
        let block = BlockView::new(&region, 0, size).unwrap();
        assert_eq!(block.status().unwrap(), BlockStatus::KernelOwned);
    }

    #[test]
    fn test_records_copied_before_release_stay_intact() {
        let size = page_size();
        let region = RingRegion::anonymous(size).unwrap();
        region.store_u32(block_desc::NUM_PKTS, 1).unwrap();
        region.store_u32(block_desc::OFFSET_TO_FIRST_PKT, 48).unwrap();
        write_record(&region, 48, 0, &[0, 1, 2, 3, 4, 5, 6, 7]);
        region.store_status(block_desc::BLOCK_STATUS, sys::TP_STATUS_USER).unwrap();

        let block = BlockView::new(&region, 0, size).unwrap();
        let copied: Vec<Vec<u8>> = block
            .records()
            .unwrap()
            .map(|r| r.map(|r| r.data.to_vec()))
            .collect::<Result<_>>()
            .unwrap();
        block.release().unwrap();

        // The kernel refills the block after it was handed back.
        write_record(&region, 48, 0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        region.store_status(block_desc::BLOCK_STATUS, sys::TP_STATUS_USER).unwrap();

        assert_eq!(copied, vec![vec![0, 1, 2, 3, 4, 5, 6, 7]]);
        let block = BlockView::new(&region, 0, size).unwrap();
        let fresh = block.records().unwrap().next().unwrap().unwrap();
        assert_eq!(fresh.data, &[1, 2, 3, 4, 5, 6, 7, 8][..]);
    }

    #[test]
    fn test_record_past_block_end_rejected() {
        let size = page_size();
        let region = RingRegion::anonymous(size).unwrap();
        region.store_u32(block_desc::NUM_PKTS, 1).unwrap();
        region.store_u32(block_desc::OFFSET_TO_FIRST_PKT, 48).unwrap();
        write_record(&region, 48, 0, &[1; 16]);
        // Claim far more captured bytes than the block holds.
        region
            .store_u32(48 + tpacket3_hdr::SNAPLEN, size as u32)
            .unwrap();

        let block = BlockView::new(&region, 0, size).unwrap();
        let mut records = block.records().unwrap();
        assert!(matches!(records.next(), Some(Err(Error::CorruptBlock(_)))));
        assert!(records.next().is_none());
    }

    #[test]
    fn test_truncated_chain_rejected() {
        let size = page_size();
        let region = RingRegion::anonymous(size).unwrap();
        region.store_u32(block_desc::NUM_PKTS, 2).unwrap();
        region.store_u32(block_desc::OFFSET_TO_FIRST_PKT, 48).unwrap();
        write_record(&region, 48, 0, &[1; 16]);

        let block = BlockView::new(&region, 0, size).unwrap();
        let results: Vec<_> = block.records().unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::CorruptBlock(_))));
    }

    #[test]
    fn test_bad_first_offset_rejected() {
        let size = page_size();
        let region = RingRegion::anonymous(size).unwrap();
        region.store_u32(block_desc::NUM_PKTS, 1).unwrap();
        region.store_u32(block_desc::OFFSET_TO_FIRST_PKT, 8).unwrap();

        let block = BlockView::new(&region, 0, size).unwrap();
        assert!(block.records().is_err());
    }

    #[test]
    fn test_block_outside_region_rejected() {
        let region = RingRegion::anonymous(page_size()).unwrap();
        assert!(BlockView::new(&region, page_size(), 16).is_err());
    }
}
