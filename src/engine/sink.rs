//! Packet consumers
//!
//! A [`PacketSink`] receives every captured record synchronously while its
//! block is still owned by user space. The span it gets aliases ring memory,
//! so a sink that wants to keep bytes must copy them.

use crate::ring::Timestamp;
use chrono::{DateTime, SecondsFormat};
use std::fmt::Write;
use tracing::debug;

/// Bytes of each packet [`LogSink`] shows: Ethernet plus a minimal IPv4 header.
pub const LOG_PREFIX_LEN: usize = 34;

pub trait PacketSink {
    /// Called once per record, in ring order.
    fn on_packet(&mut self, timestamp: Timestamp, len: u32, data: &[u8]);
}

impl<F> PacketSink for F
where
    F: FnMut(Timestamp, u32, &[u8]),
{
    fn on_packet(&mut self, timestamp: Timestamp, len: u32, data: &[u8]) {
        self(timestamp, len, data)
    }
}

/// Stateless packet classifier.
///
/// Implementations must bounds-check every access to `data`.
pub trait Classifier {
    fn matches(&self, data: &[u8]) -> bool;
}

/// Classifier that lets everything through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Classifier for AcceptAll {
    fn matches(&self, _data: &[u8]) -> bool {
        true
    }
}

/// Forwards only the packets a classifier accepts.
#[derive(Debug)]
pub struct FilteredSink<C, S> {
    classifier: C,
    inner: S,
    rejected: u64,
}

impl<C: Classifier, S: PacketSink> FilteredSink<C, S> {
    pub fn new(classifier: C, inner: S) -> Self {
        Self {
            classifier,
            inner,
            rejected: 0,
        }
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<C: Classifier, S: PacketSink> PacketSink for FilteredSink<C, S> {
    fn on_packet(&mut self, timestamp: Timestamp, len: u32, data: &[u8]) {
        if self.classifier.matches(data) {
            self.inner.on_packet(timestamp, len, data);
        } else {
            self.rejected += 1;
        }
    }
}

/// Diagnostic sink logging a hex prefix of each packet at debug level.
#[derive(Debug, Clone)]
pub struct LogSink {
    queue: usize,
}

impl LogSink {
    pub fn new(queue: usize) -> Self {
        Self { queue }
    }
}

impl PacketSink for LogSink {
    fn on_packet(&mut self, timestamp: Timestamp, len: u32, data: &[u8]) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        debug!(
            "queue {} {} len={} {}",
            self.queue,
            format_timestamp(timestamp),
            len,
            hex_prefix(data, LOG_PREFIX_LEN)
        );
    }
}

/// RFC 3339 rendering of a capture timestamp.
pub fn format_timestamp(ts: Timestamp) -> String {
    match DateTime::from_timestamp(ts.sec as i64, ts.nsec) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Nanos, true),
        None => ts.to_string(),
    }
}

/// Lowercase hex of the first `max` bytes of `data`.
pub fn hex_prefix(data: &[u8], max: usize) -> String {
    let shown = &data[..data.len().min(max)];
    let mut out = String::with_capacity(shown.len() * 2);
    for byte in shown {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
