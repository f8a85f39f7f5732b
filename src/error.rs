use std::io;

/// Reasons the kernel facility refused to set up a ring.
#[derive(Debug, thiserror::Error)]
pub enum RingCreationError {
    #[error("ring version TPACKET_V3 not supported: {0}")]
    UnsupportedVersion(#[source] io::Error),

    #[error("permission denied while creating ring: {0}")]
    PermissionDenied(#[source] io::Error),

    #[error("invalid ring geometry: {0}")]
    InvalidGeometry(String),

    #[error("kernel rejected {kind} ring: {source}")]
    Rejected {
        kind: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to map ring memory: {0}")]
    Map(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("interface {name} not found")]
    InterfaceNotFound { name: String },

    #[error(transparent)]
    RingCreation(#[from] RingCreationError),

    #[error("queue {queue} setup failed: {source}")]
    Setup {
        queue: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("access of {len} bytes at offset {offset} exceeds ring region of {limit} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        limit: usize,
    },

    #[error("corrupt capture block: {0}")]
    CorruptBlock(String),

    #[error("payload of {len} bytes exceeds frame capacity of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("frame slot {slot} is not available to user space")]
    SlotBusy { slot: usize },
}

impl Error {
    /// Wraps a per-queue setup failure.
    pub fn setup(queue: usize, source: Error) -> Self {
        Error::Setup {
            queue,
            source: Box::new(source),
        }
    }

    /// Returns true for conditions the ring loops retry silently.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) => is_transient_io(e),
            _ => false,
        }
    }
}

/// Interrupted waits, would-block and momentary buffer exhaustion.
pub fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    ) || err.raw_os_error() == Some(libc::ENOBUFS)
}

pub type Result<T> = std::result::Result<T, Error>;
