//! Transmit payloads

use crate::{Error, Result};
use std::path::Path;

/// Ethernet/IPv4 TCP SYN, 192.168.1.2:35980 -> 192.168.0.10:80.
pub const TCP_SYN_FRAME: [u8; 74] = [
    0x08, 0x00, 0x27, 0x99, 0x66, 0xc5, 0x08, 0x00, 0x27, 0xe5, 0xa9, 0x29, 0x08, 0x00, 0x45, 0x00,
    0x00, 0x3c, 0x32, 0x87, 0x40, 0x00, 0x3f, 0x06, 0x86, 0xd8, 0xc0, 0xa8, 0x01, 0x02, 0xc0, 0xa8,
    0x00, 0x0a, 0x8c, 0x8c, 0x00, 0x50, 0xaa, 0xe1, 0x0c, 0x62, 0x00, 0x00, 0x00, 0x00, 0xa0, 0x02,
    0xfa, 0xf0, 0x19, 0xb6, 0x00, 0x00, 0x02, 0x04, 0x05, 0xb4, 0x04, 0x02, 0x08, 0x0a, 0xfa, 0xf8,
    0x71, 0xe3, 0x00, 0x00, 0x00, 0x00, 0x01, 0x03, 0x03, 0x07,
];

/// Supplies the bytes of each frame the transmit loop sends.
pub trait PayloadSource {
    fn next_payload(&mut self) -> &[u8];

    /// Largest payload this source will ever return.
    fn max_len(&self) -> usize;
}

/// The same frame every time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticPayload {
    bytes: Vec<u8>,
}

impl StaticPayload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn tcp_syn() -> Self {
        Self::new(TCP_SYN_FRAME.to_vec())
    }

    /// Loads a raw frame (starting at the Ethernet header) from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        if bytes.is_empty() {
            return Err(Error::Config(format!("payload file {} is empty", path.display())));
        }
        Ok(Self::new(bytes))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Default for StaticPayload {
    fn default() -> Self {
        Self::tcp_syn()
    }
}

impl PayloadSource for StaticPayload {
    fn next_payload(&mut self) -> &[u8] {
        &self.bytes
    }

    fn max_len(&self) -> usize {
        self.bytes.len()
    }
}
