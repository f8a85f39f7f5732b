//! pktring - zero-copy packet rings
//!
//! Captures and transmits raw frames through TPACKET_V3 rings shared with
//! the Linux AF_PACKET socket, one pinned worker per queue.

pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod ring;
pub mod telemetry;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use error::{Error, Result};
