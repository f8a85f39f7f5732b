//! Transmit frame slots
//!
//! Each slot starts with a `tpacket3_hdr` whose `tp_status` decides who may
//! write the slot. User space fills a slot only after reading
//! `TP_STATUS_AVAILABLE` and hands it over with `TP_STATUS_SEND_REQUEST`; the
//! kernel hands it back as available once the frame is on the wire.

use super::region::RingRegion;
use crate::capture::sys::{self, tpacket3_hdr};
use crate::{Error, Result};

/// Ownership state of one transmit slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Available,
    SendRequested,
    Sending,
    /// Kernel rejected the frame; carries the raw status word.
    Error(u32),
}

impl FrameStatus {
    pub fn from_raw(raw: u32) -> Self {
        if raw == sys::TP_STATUS_AVAILABLE {
            FrameStatus::Available
        } else if raw & sys::TP_STATUS_WRONG_FORMAT != 0 {
            FrameStatus::Error(raw)
        } else if raw & sys::TP_STATUS_SENDING != 0 {
            FrameStatus::Sending
        } else if raw & sys::TP_STATUS_SEND_REQUEST != 0 {
            FrameStatus::SendRequested
        } else {
            FrameStatus::Error(raw)
        }
    }

    /// Frames the kernel still has to send (or is sending).
    pub fn is_outstanding(&self) -> bool {
        matches!(self, FrameStatus::SendRequested | FrameStatus::Sending)
    }
}

/// Typed accessor for one transmit slot.
pub struct FrameSlot<'a> {
    region: &'a RingRegion,
    index: usize,
    base: usize,
    frame_size: usize,
    data_offset: usize,
}

impl<'a> FrameSlot<'a> {
    pub fn new(
        region: &'a RingRegion,
        index: usize,
        base: usize,
        frame_size: usize,
        data_offset: usize,
    ) -> Result<Self> {
        region.bytes(base, frame_size)?;
        Ok(Self {
            region,
            index,
            base,
            frame_size,
            data_offset,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Largest payload this slot accepts.
    pub fn capacity(&self) -> usize {
        self.frame_size.saturating_sub(self.data_offset)
    }

    pub fn status(&self) -> Result<FrameStatus> {
        self.region
            .load_status(self.base + tpacket3_hdr::STATUS)
            .map(FrameStatus::from_raw)
    }

    /// Copies `payload` into the slot and queues it for the kernel.
    ///
    /// Nothing is written unless the slot is available and the payload fits.
    pub fn compose(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.capacity() {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                capacity: self.capacity(),
            });
        }
        if self.status()? != FrameStatus::Available {
            return Err(Error::SlotBusy { slot: self.index });
        }

        self.region.write_bytes(self.base + self.data_offset, payload)?;
        self.region
            .store_u32(self.base + tpacket3_hdr::LEN, payload.len() as u32)?;
        self.region
            .store_u32(self.base + tpacket3_hdr::SNAPLEN, payload.len() as u32)?;
        self.region
            .store_u32(self.base + tpacket3_hdr::NEXT_OFFSET, 0)?;
        self.region
            .store_status(self.base + tpacket3_hdr::STATUS, sys::TP_STATUS_SEND_REQUEST)
    }

    /// Returns a rejected slot to user space.
    pub fn reclaim(&self) -> Result<()> {
        match self.status()? {
            FrameStatus::Error(_) => self
                .region
                .store_status(self.base + tpacket3_hdr::STATUS, sys::TP_STATUS_AVAILABLE),
            _ => Err(Error::SlotBusy { slot: self.index }),
        }
    }

    pub fn payload_len(&self) -> Result<u32> {
        self.region.load_u32(self.base + tpacket3_hdr::LEN)
    }

    /// Copy of the composed payload; the slot may already belong to the
    /// kernel, so its bytes are never lent out.
    pub fn payload(&self) -> Result<Vec<u8>> {
        let len = self.payload_len()? as usize;
        if len > self.capacity() {
            return Err(Error::PayloadTooLarge {
                len,
                capacity: self.capacity(),
            });
        }
        Ok(self.region.bytes(self.base + self.data_offset, len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: usize = 2048;
    const DATA: usize = 48;

    #[test]
    fn test_status_decoding() {
        assert_eq!(FrameStatus::from_raw(0), FrameStatus::Available);
        assert_eq!(FrameStatus::from_raw(1), FrameStatus::SendRequested);
        assert_eq!(FrameStatus::from_raw(2), FrameStatus::Sending);
        assert_eq!(FrameStatus::from_raw(4), FrameStatus::Error(4));
        assert!(FrameStatus::from_raw(1).is_outstanding());
        assert!(!FrameStatus::from_raw(0).is_outstanding());
    }

    #[test]
    fn test_compose_marks_send_requested() {
        let region = RingRegion::anonymous(4096).unwrap();
        let slot = FrameSlot::new(&region, 0, 0, FRAME, DATA).unwrap();
        slot.compose(&[0x45; 60]).unwrap();

        assert_eq!(slot.status().unwrap(), FrameStatus::SendRequested);
        assert_eq!(slot.payload_len().unwrap(), 60);
        assert_eq!(slot.payload().unwrap(), vec![0x45; 60]);
    }

    #[test]
    fn test_compose_on_busy_slot_writes_nothing() {
        let region = RingRegion::anonymous(4096).unwrap();
        let slot = FrameSlot::new(&region, 3, 0, FRAME, DATA).unwrap();
        slot.compose(&[1; 10]).unwrap();

        let err = slot.compose(&[2; 10]).unwrap_err();
        assert!(matches!(err, Error::SlotBusy { slot: 3 }));
        assert_eq!(slot.payload().unwrap(), vec![1; 10]);
    }

    #[test]
    fn test_capacity_boundary() {
        let region = RingRegion::anonymous(4096).unwrap();
        let slot = FrameSlot::new(&region, 0, 0, FRAME, DATA).unwrap();
        assert_eq!(slot.capacity(), FRAME - DATA);

        let too_big = vec![0xee; FRAME - DATA + 1];
        assert!(matches!(
            slot.compose(&too_big),
            Err(Error::PayloadTooLarge { .. })
        ));
        // Rejected before any byte reached the slot.
        assert!(region.bytes(0, FRAME).unwrap().iter().all(|&b| b == 0));
        // The following frame is untouched too.
        assert!(region.bytes(FRAME, 16).unwrap().iter().all(|&b| b == 0));

        let exact = vec![0xee; FRAME - DATA];
        slot.compose(&exact).unwrap();
        assert_eq!(slot.payload().unwrap().len(), FRAME - DATA);
    }

    #[test]
    fn test_reclaim_only_error_slots() {
        let region = RingRegion::anonymous(4096).unwrap();
        let slot = FrameSlot::new(&region, 0, 0, FRAME, DATA).unwrap();
        assert!(slot.reclaim().is_err());

        region
            .store_status(tpacket3_hdr::STATUS, sys::TP_STATUS_WRONG_FORMAT)
            .unwrap();
        slot.reclaim().unwrap();
        assert_eq!(slot.status().unwrap(), FrameStatus::Available);
    }
}
