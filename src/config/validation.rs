//! Configuration validation

use super::{ConfigLock, Mode};
use crate::capture::sys;

/// Rings bigger than this per queue get a warning.
const LARGE_RING_BYTES: usize = 1 << 30;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a resolved configuration and return warnings/errors
pub fn validate(lock: &ConfigLock) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_engine(lock, &mut result);
    validate_ring(lock, &mut result);
    validate_transmit(lock, &mut result);
    validate_logging(lock, &mut result);

    result
}

fn validate_engine(lock: &ConfigLock, result: &mut ValidationResult) {
    let engine = &lock.engine;

    if engine.interface.is_empty() {
        result.warn("engine.interface: not set, must be given on the command line");
    }

    if engine.max_queues == 0 {
        result.error("engine.max_queues: must be at least 1");
    }

    if let Some(queues) = lock.queues() {
        if queues > engine.max_queues {
            result.warn(format!(
                "engine.queues: {} exceeds max_queues, capped at {}",
                queues, engine.max_queues
            ));
        }
        let cpus = crate::engine::cpu_count();
        if queues > cpus {
            result.warn(format!(
                "engine.queues: {} queues on {} logical CPUs, several queues share a CPU",
                queues, cpus
            ));
        }
    }

    if engine.poll_timeout_ms == 0 {
        result.warn("engine.poll_timeout_ms: 0 turns every wait into a busy poll");
    }
}

fn validate_ring(lock: &ConfigLock, result: &mut ValidationResult) {
    let geometry = match lock.ring.geometry() {
        Ok(geometry) => geometry,
        Err(e) => {
            result.error(format!("ring: {}", e));
            return;
        }
    };

    let rings = if lock.ring.map_both { 2 } else { 1 };
    let per_queue = geometry.ring_len() * rings;
    if per_queue > LARGE_RING_BYTES {
        result.warn(format!(
            "ring: {} MiB of ring memory per queue",
            per_queue >> 20
        ));
    }

    if lock.engine.mode == Mode::Send && lock.transmit.batch_size > geometry.frame_count() as u64 {
        result.warn(format!(
            "transmit.batch_size: {} exceeds the {} frames of the ring, frames are flushed whenever the ring fills",
            lock.transmit.batch_size,
            geometry.frame_count()
        ));
    }
}

fn validate_transmit(lock: &ConfigLock, result: &mut ValidationResult) {
    let transmit = &lock.transmit;

    if transmit.batch_size == 0 {
        result.error("transmit.batch_size: must be at least 1");
    }

    if transmit.flush_retries == 0 && lock.engine.mode == Mode::Send {
        result.warn("transmit.flush_retries: 0, frames still queued at shutdown are reported lost");
    }

    if lock.engine.mode == Mode::Receive && lock.packet_limit().is_some() {
        result.warn("transmit.packet_limit: ignored in receive mode");
    }

    if let Some(path) = lock.payload_file() {
        match std::fs::metadata(&path) {
            Ok(meta) => {
                let capacity =
                    (lock.ring.frame_size as usize).saturating_sub(sys::tpacket_align(sys::TPACKET3_HDR_LEN));
                if meta.len() as usize > capacity {
                    result.error(format!(
                        "transmit.payload_file: {} is {} bytes, frames hold at most {}",
                        path.display(),
                        meta.len(),
                        capacity
                    ));
                }
                if meta.len() == 0 {
                    result.error(format!("transmit.payload_file: {} is empty", path.display()));
                }
            }
            Err(e) => {
                result.error(format!("transmit.payload_file: {}: {}", path.display(), e));
            }
        }
    }
}

fn validate_logging(lock: &ConfigLock, result: &mut ValidationResult) {
    let level = lock.logging.level.to_lowercase();
    if !["error", "warn", "info", "debug", "trace"].contains(&level.as_str()) {
        result.warn(format!(
            "logging.level: unknown level '{}', using info",
            lock.logging.level
        ));
    }
    if !["pretty", "compact", "json"].contains(&lock.logging.format.as_str()) {
        result.warn(format!(
            "logging.format: unknown format '{}', using pretty",
            lock.logging.format
        ));
    }
}
