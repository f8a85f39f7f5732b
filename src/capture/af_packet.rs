//! AF_PACKET socket implementation

use super::sys::{self, packet_mreq, tpacket_req3};
use super::{Interest, RingIo};
use crate::config::{FanoutMode, Protocol};
use crate::engine::{QueueFactory, QueuePlan};
use crate::ring::{Direction, Ring, RingAllocator, RingFacility, RingGeometry, RingKind, RingRegion};
use crate::{Error, Result};
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::{debug, warn};

/// AF_PACKET socket carrying mmap'd TPACKET_V3 rings
pub struct AfPacketSocket {
    fd: OwnedFd,
    ifindex: i32,
    promisc: bool,
    rx_len: Option<usize>,
    tx_len: Option<usize>,
}

impl AfPacketSocket {
    /// Create an unbound raw packet socket for the specified interface
    ///
    /// The socket receives nothing until [`AfPacketSocket::bind`], so rings
    /// can be set up first.
    pub fn open(ifname: &str) -> Result<Self> {
        // SAFETY: plain socket(2) call
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, 0) };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        // SAFETY: fd was just returned by socket(2) and is owned by nobody else
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let ifindex = Self::get_ifindex(fd.as_raw_fd(), ifname)?;

        Ok(Self {
            fd,
            ifindex,
            promisc: false,
            rx_len: None,
            tx_len: None,
        })
    }

    fn get_ifindex(fd: RawFd, ifname: &str) -> Result<i32> {
        let ifname_c = CString::new(ifname).map_err(|_| Error::InterfaceNotFound {
            name: ifname.to_string(),
        })?;

        let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
        let name_bytes = ifname_c.as_bytes_with_nul();
        if name_bytes.len() > ifr.ifr_name.len() {
            return Err(Error::InterfaceNotFound {
                name: ifname.to_string(),
            });
        }
        for (dst, &src) in ifr.ifr_name.iter_mut().zip(name_bytes) {
            *dst = src as libc::c_char;
        }

        let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX as _, &mut ifr) };
        if ret < 0 {
            return Err(Error::InterfaceNotFound {
                name: ifname.to_string(),
            });
        }

        Ok(unsafe { ifr.ifr_ifru.ifru_ifindex })
    }

    /// Bind to the interface, receiving frames of `protocol`
    pub fn bind(&self, protocol: Protocol) -> Result<()> {
        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: protocol.ethertype().to_be(),
            sll_ifindex: self.ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };

        let ret = unsafe {
            libc::bind(
                self.fd.as_raw_fd(),
                &sockaddr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };

        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        Ok(())
    }

    /// Enable promiscuous mode; undone when the socket drops
    pub fn enable_promisc(&mut self) -> Result<()> {
        Self::set_promisc(self.fd.as_raw_fd(), self.ifindex, true)?;
        self.promisc = true;
        Ok(())
    }

    fn set_promisc(fd: RawFd, ifindex: i32, enable: bool) -> Result<()> {
        let mreq = packet_mreq {
            mr_ifindex: ifindex,
            mr_type: sys::PACKET_MR_PROMISC,
            mr_alen: 0,
            mr_address: [0; 8],
        };

        let optname = if enable {
            sys::PACKET_ADD_MEMBERSHIP
        } else {
            sys::PACKET_DROP_MEMBERSHIP
        };

        setsockopt(fd, optname, &mreq).map_err(Error::Io)
    }

    /// Join fanout group `group` so the kernel spreads traffic over every
    /// socket in it
    pub fn join_fanout(&self, group: u16, mode: FanoutMode) -> Result<()> {
        let arg: u32 = group as u32 | (mode.kernel_mode() << 16);
        setsockopt(self.fd.as_raw_fd(), sys::PACKET_FANOUT, &arg).map_err(Error::Io)
    }
}

fn setsockopt<T>(fd: RawFd, optname: libc::c_int, value: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            optname,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl RingFacility for AfPacketSocket {
    fn set_version(&mut self) -> io::Result<()> {
        setsockopt(self.fd.as_raw_fd(), sys::PACKET_VERSION, &sys::TPACKET_V3)
    }

    fn header_len(&mut self) -> io::Result<usize> {
        // The kernel reads the version from the buffer and answers in place.
        let mut val: libc::c_int = sys::TPACKET_V3;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_PACKET,
                sys::PACKET_HDRLEN,
                &mut val as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(val as usize)
    }

    fn request_ring(&mut self, kind: RingKind, req: &tpacket_req3) -> io::Result<()> {
        let optname = match kind {
            RingKind::Rx => sys::PACKET_RX_RING,
            RingKind::Tx => sys::PACKET_TX_RING,
        };
        setsockopt(self.fd.as_raw_fd(), optname, req)?;

        // The kernel backs each ring with tp_block_nr page vectors of
        // tp_block_size bytes (pg_vec_len * pg_vec_pages * PAGE_SIZE), and
        // block sizes are page multiples, so this is exactly what it reserved.
        let len = req.tp_block_size as usize * req.tp_block_nr as usize;
        match kind {
            RingKind::Rx => self.rx_len = Some(len),
            RingKind::Tx => self.tx_len = Some(len),
        }
        Ok(())
    }

    fn accepted_len(&self, kind: RingKind) -> Option<usize> {
        match kind {
            RingKind::Rx => self.rx_len,
            RingKind::Tx => self.tx_len,
        }
    }

    fn map(&mut self, len: usize) -> io::Result<RingRegion> {
        RingRegion::map_socket(self.fd.as_raw_fd(), len)
    }
}

impl RingIo for AfPacketSocket {
    fn wait(&mut self, interest: Interest, timeout: Duration) -> io::Result<bool> {
        let events = match interest {
            Interest::Readable => libc::POLLIN | libc::POLLERR,
            Interest::Writable => libc::POLLOUT | libc::POLLERR,
        };
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret > 0)
    }

    fn flush(&mut self) -> io::Result<()> {
        // A zero-length send kicks the kernel to walk the tx ring.
        let ret = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                std::ptr::null(),
                0,
                libc::MSG_DONTWAIT,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for AfPacketSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for AfPacketSocket {
    fn drop(&mut self) {
        if self.promisc {
            let _ = Self::set_promisc(self.fd.as_raw_fd(), self.ifindex, false);
        }
    }
}

/// Opens one ring-backed packet socket per queue
#[derive(Debug, Clone)]
pub struct AfPacketFactory {
    pub ifname: String,
    pub protocol: Protocol,
    pub promiscuous: bool,
    pub fanout: FanoutMode,
    pub geometry: RingGeometry,
    pub map_both: bool,
    pub lock_pages: bool,
}

impl QueueFactory for AfPacketFactory {
    type Io = AfPacketSocket;

    fn open(&mut self, plan: &QueuePlan, direction: Direction) -> Result<(AfPacketSocket, Ring)> {
        let direction = if self.map_both {
            Direction::Both
        } else {
            direction
        };

        let mut socket = AfPacketSocket::open(&self.ifname)?;
        let ring = RingAllocator::new(self.geometry, direction)
            .lock_pages(self.lock_pages)
            .allocate(&mut socket)?;

        socket.bind(self.protocol)?;
        if self.promiscuous {
            if let Err(e) = socket.enable_promisc() {
                warn!("Queue {}: promiscuous mode unavailable: {}", plan.queue, e);
            }
        }
        socket.join_fanout(plan.fanout_group, self.fanout)?;

        debug!(
            "Queue {}: {} ifindex={} fanout group {} ({:?})",
            plan.queue, self.ifname, socket.ifindex, plan.fanout_group, self.fanout
        );

        Ok((socket, ring))
    }
}
