//! Shared ring memory
//!
//! The kernel writes into this memory concurrently with us, so nothing here
//! hands out references that assume the bytes are stable except [`RingRegion::bytes`],
//! which callers only use on blocks/frames the ownership protocol has given
//! to user space.

use crate::{Error, Result};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// One `mmap` extent, unmapped when the last view drops.
#[derive(Debug)]
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory; all access goes through
// bounds-checked volatile/atomic accessors on RingRegion.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once
        unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
    }
}

/// Bounds-checked view of a ring mapping.
#[derive(Debug)]
pub struct RingRegion {
    map: Arc<Mapping>,
    locked: bool,
}

impl RingRegion {
    /// Maps `len` bytes of the socket's ring memory.
    pub fn map_socket(fd: RawFd, len: usize) -> io::Result<Self> {
        Self::map(fd, len, libc::MAP_SHARED)
    }

    /// Maps `len` zeroed bytes not backed by any socket.
    ///
    /// Used by simulated kernels, which then write through
    /// [`RingRegion::kernel_view`] the way the real kernel writes into a
    /// socket mapping.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        Self::map(-1, len, libc::MAP_SHARED | libc::MAP_ANONYMOUS)
    }

    fn map(fd: RawFd, len: usize, flags: libc::c_int) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty ring",
            ));
        }

        // SAFETY: fresh mapping, no existing memory is aliased
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::other("mmap returned null"))?;

        Ok(Self {
            map: Arc::new(Mapping { ptr, len }),
            locked: false,
        })
    }

    /// Second view of the same pages, for the producer side of a simulation.
    pub fn kernel_view(&self) -> RingRegion {
        RingRegion {
            map: Arc::clone(&self.map),
            locked: false,
        }
    }

    /// Pins the pages in RAM so the hot path never page-faults.
    pub fn lock(&mut self) -> io::Result<()> {
        if self.locked {
            return Ok(());
        }
        // SAFETY: locks exactly the mapped range
        let ret = unsafe { libc::mlock(self.map.ptr.as_ptr() as *const libc::c_void, self.map.len) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        self.locked = true;
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn len(&self) -> usize {
        self.map.len
    }

    pub fn is_empty(&self) -> bool {
        self.map.len == 0
    }

    fn check(&self, offset: usize, len: usize) -> Result<*mut u8> {
        match offset.checked_add(len) {
            Some(end) if end <= self.map.len => {
                // SAFETY: offset is within the mapping
                Ok(unsafe { self.map.ptr.as_ptr().add(offset) })
            }
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                limit: self.map.len,
            }),
        }
    }

    fn check_aligned(&self, offset: usize, len: usize) -> Result<*mut u8> {
        let p = self.check(offset, len)?;
        if (p as usize) % len != 0 {
            return Err(Error::CorruptBlock(format!(
                "misaligned {}-byte field at offset {}",
                len, offset
            )));
        }
        Ok(p)
    }

    // ========================================
    // Plain fields
    // ========================================

    pub fn load_u16(&self, offset: usize) -> Result<u16> {
        let p = self.check(offset, 2)?;
        // SAFETY: bounds checked; unaligned read tolerates any offset
        let raw = unsafe { ptr::read_volatile(p as *const [u8; 2]) };
        Ok(u16::from_ne_bytes(raw))
    }

    pub fn load_u32(&self, offset: usize) -> Result<u32> {
        let p = self.check(offset, 4)?;
        // SAFETY: bounds checked
        let raw = unsafe { ptr::read_volatile(p as *const [u8; 4]) };
        Ok(u32::from_ne_bytes(raw))
    }

    pub fn load_u64(&self, offset: usize) -> Result<u64> {
        let p = self.check(offset, 8)?;
        // SAFETY: bounds checked
        let raw = unsafe { ptr::read_volatile(p as *const [u8; 8]) };
        Ok(u64::from_ne_bytes(raw))
    }

    pub fn store_u16(&self, offset: usize, value: u16) -> Result<()> {
        let p = self.check(offset, 2)?;
        // SAFETY: bounds checked
        unsafe { ptr::write_volatile(p as *mut [u8; 2], value.to_ne_bytes()) };
        Ok(())
    }

    pub fn store_u32(&self, offset: usize, value: u32) -> Result<()> {
        let p = self.check(offset, 4)?;
        // SAFETY: bounds checked
        unsafe { ptr::write_volatile(p as *mut [u8; 4], value.to_ne_bytes()) };
        Ok(())
    }

    pub fn store_u64(&self, offset: usize, value: u64) -> Result<()> {
        let p = self.check(offset, 8)?;
        // SAFETY: bounds checked
        unsafe { ptr::write_volatile(p as *mut [u8; 8], value.to_ne_bytes()) };
        Ok(())
    }

    // ========================================
    // Ownership words
    // ========================================

    /// Acquire-loads a status word; everything the other party wrote before
    /// flipping it is visible afterwards.
    pub fn load_status(&self, offset: usize) -> Result<u32> {
        let p = self.check_aligned(offset, 4)?;
        // SAFETY: aligned, in bounds, lives as long as the mapping
        let word = unsafe { AtomicU32::from_ptr(p as *mut u32) };
        Ok(word.load(Ordering::Acquire))
    }

    /// Release-stores a status word, publishing every earlier write.
    pub fn store_status(&self, offset: usize, value: u32) -> Result<()> {
        let p = self.check_aligned(offset, 4)?;
        // SAFETY: aligned, in bounds, lives as long as the mapping
        let word = unsafe { AtomicU32::from_ptr(p as *mut u32) };
        word.store(value, Ordering::Release);
        Ok(())
    }

    // ========================================
    // Byte spans
    // ========================================

    /// Borrows `len` bytes at `offset`.
    ///
    /// Only valid while the surrounding block is user-owned; the slice must
    /// not outlive that ownership.
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let p = self.check(offset, len)?;
        // SAFETY: bounds checked; the ownership protocol keeps the kernel
        // from writing this span while user space holds it
        Ok(unsafe { std::slice::from_raw_parts(p as *const u8, len) })
    }

    pub fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<()> {
        let p = self.check(offset, src.len())?;
        // SAFETY: bounds checked; src cannot overlap the mapping's owned span
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), p, src.len()) };
        Ok(())
    }
}
