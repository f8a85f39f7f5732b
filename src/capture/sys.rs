//! Kernel ABI for `PACKET_MMAP` rings (TPACKET_V3)
//!
//! Mirrors the parts of `linux/if_packet.h` the engine touches. Offsets are
//! byte offsets from the start of the structure they belong to; everything
//! in the ring is native-endian.

#![allow(non_camel_case_types)]

// ============================================================================
// Socket options
// ============================================================================

pub const PACKET_ADD_MEMBERSHIP: libc::c_int = 1;
pub const PACKET_DROP_MEMBERSHIP: libc::c_int = 2;
pub const PACKET_RX_RING: libc::c_int = 5;
pub const PACKET_VERSION: libc::c_int = 10;
pub const PACKET_HDRLEN: libc::c_int = 11;
pub const PACKET_TX_RING: libc::c_int = 13;
pub const PACKET_FANOUT: libc::c_int = 18;

pub const PACKET_MR_PROMISC: libc::c_ushort = 1;

pub const TPACKET_V3: libc::c_int = 2;

pub const PACKET_FANOUT_HASH: u32 = 0;
pub const PACKET_FANOUT_LB: u32 = 1;
pub const PACKET_FANOUT_CPU: u32 = 2;

// ============================================================================
// Status words
// ============================================================================

/// Capture block/frame owned by the kernel.
pub const TP_STATUS_KERNEL: u32 = 0;
/// Capture block handed to user space.
pub const TP_STATUS_USER: u32 = 1 << 0;

/// Transmit frame free for user space to fill.
pub const TP_STATUS_AVAILABLE: u32 = 0;
/// Transmit frame queued for the kernel.
pub const TP_STATUS_SEND_REQUEST: u32 = 1 << 0;
/// Transmit frame currently being sent by the kernel.
pub const TP_STATUS_SENDING: u32 = 1 << 1;
/// Transmit frame the kernel refused to send.
pub const TP_STATUS_WRONG_FORMAT: u32 = 1 << 2;

// ============================================================================
// Layout
// ============================================================================

pub const TPACKET_ALIGNMENT: usize = 16;

/// Rounds `len` up to the ring's record alignment.
pub const fn tpacket_align(len: usize) -> usize {
    (len + TPACKET_ALIGNMENT - 1) & !(TPACKET_ALIGNMENT - 1)
}

/// `sizeof(struct tpacket3_hdr)`
pub const TPACKET3_HDR_LEN: usize = 48;
/// `sizeof(struct sockaddr_ll)`
pub const SOCKADDR_LL_LEN: usize = 20;
/// `TPACKET3_HDRLEN`: the minimum bytes a frame must hold.
pub const TPACKET3_HDRLEN: usize = tpacket_align(TPACKET3_HDR_LEN) + SOCKADDR_LL_LEN;

/// `struct tpacket_block_desc` (version, offset_to_priv, tpacket_hdr_v1)
pub mod block_desc {
    pub const VERSION: usize = 0;
    pub const OFFSET_TO_PRIV: usize = 4;
    pub const BLOCK_STATUS: usize = 8;
    pub const NUM_PKTS: usize = 12;
    pub const OFFSET_TO_FIRST_PKT: usize = 16;
    pub const BLK_LEN: usize = 20;
    pub const SEQ_NUM: usize = 24;
    pub const TS_FIRST_SEC: usize = 32;
    pub const TS_FIRST_NSEC: usize = 36;
    pub const TS_LAST_SEC: usize = 40;
    pub const TS_LAST_NSEC: usize = 44;
    pub const LEN: usize = 48;
}

/// `struct tpacket3_hdr`
pub mod tpacket3_hdr {
    pub const NEXT_OFFSET: usize = 0;
    pub const SEC: usize = 4;
    pub const NSEC: usize = 8;
    pub const SNAPLEN: usize = 12;
    pub const LEN: usize = 16;
    pub const STATUS: usize = 20;
    pub const MAC: usize = 24;
    pub const NET: usize = 26;
    pub const RXHASH: usize = 28;
    pub const VLAN_TCI: usize = 32;
    pub const VLAN_TPID: usize = 36;
}

/// `struct tpacket_req3`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct tpacket_req3 {
    pub tp_block_size: u32,
    pub tp_block_nr: u32,
    pub tp_frame_size: u32,
    pub tp_frame_nr: u32,
    pub tp_retire_blk_tov: u32,
    pub tp_sizeof_priv: u32,
    pub tp_feature_req_word: u32,
}

/// `struct packet_mreq`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct packet_mreq {
    pub mr_ifindex: libc::c_int,
    pub mr_type: libc::c_ushort,
    pub mr_alen: libc::c_ushort,
    pub mr_address: [u8; 8],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(std::mem::size_of::<tpacket_req3>(), 28);
        assert_eq!(std::mem::size_of::<packet_mreq>(), 16);
        assert_eq!(
            std::mem::size_of::<libc::sockaddr_ll>(),
            SOCKADDR_LL_LEN
        );
        assert_eq!(TPACKET3_HDRLEN, 68);
    }

    #[test]
    fn test_tpacket_align() {
        assert_eq!(tpacket_align(0), 0);
        assert_eq!(tpacket_align(1), 16);
        assert_eq!(tpacket_align(48), 48);
        assert_eq!(tpacket_align(49), 64);
    }
}
