//! Packet socket backends
//!
//! The ring loops talk to the kernel through [`RingIo`]:
//! - readiness waits with a bounded timeout
//! - flush requests for queued transmit frames
//!
//! `AF_PACKET` is the only backend; the simulated kernel behind the
//! `testkit` feature implements the same trait.

mod af_packet;
pub mod sys;

pub use af_packet::{AfPacketFactory, AfPacketSocket};

use std::io;
use std::time::Duration;

/// Readiness a loop is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// A capture block may have been handed to user space.
    Readable,
    /// A transmit frame may have been returned to user space.
    Writable,
}

/// Kernel I/O a ring loop needs besides the shared memory itself.
pub trait RingIo {
    /// Waits until the kernel signals `interest` or `timeout` elapses.
    ///
    /// Returns whether readiness was signalled. Interrupted waits come back
    /// as `ErrorKind::Interrupted` for the caller to retry.
    fn wait(&mut self, interest: Interest, timeout: Duration) -> io::Result<bool>;

    /// Asks the kernel to transmit every send-requested frame.
    fn flush(&mut self) -> io::Result<()>;
}
