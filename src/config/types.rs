//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// User-defined configuration (config.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub ring: RingConfig,
    #[serde(default)]
    pub transmit: TransmitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    pub interface: Option<String>,
    pub mode: Option<Mode>,
    /// Queue count; defaults to the number of logical CPUs
    pub queues: Option<usize>,
    pub max_queues: Option<usize>,
    pub poll_timeout_ms: Option<u64>,
    pub on_setup_failure: Option<SetupPolicy>,
    pub protocol: Option<Protocol>,
    pub fanout: Option<FanoutMode>,
    pub promiscuous: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RingConfig {
    pub frame_size: Option<u32>,
    pub block_size: Option<u32>,
    pub block_count: Option<u32>,
    pub lock_pages: Option<bool>,
    /// Map both rings on every queue regardless of mode
    pub map_both: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransmitConfig {
    pub batch_size: Option<u64>,
    /// Stop after this many frames; unlimited when absent
    pub packet_limit: Option<u64>,
    pub flush_retries: Option<u32>,
    pub flush_retry_delay_ms: Option<u64>,
    /// Raw Ethernet frame to send; built-in TCP SYN when absent
    pub payload_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Receive,
    Send,
}

/// What the orchestrator does when one queue cannot be set up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupPolicy {
    /// Tear everything down and fail the start
    #[default]
    Abort,
    /// Log it and run with the queues that did come up
    Continue,
}

/// Ethertype the sockets bind to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    All,
    #[default]
    Ipv4,
}

impl Protocol {
    pub fn ethertype(&self) -> u16 {
        match self {
            Protocol::All => libc::ETH_P_ALL as u16,
            Protocol::Ipv4 => libc::ETH_P_IP as u16,
        }
    }
}

/// How the kernel spreads flows over the sockets of a fanout group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutMode {
    /// By the CPU the frame arrived on
    #[default]
    Cpu,
    /// By flow hash
    Hash,
    /// Round robin
    Lb,
}

impl FanoutMode {
    pub fn kernel_mode(&self) -> u32 {
        use crate::capture::sys;
        match self {
            FanoutMode::Cpu => sys::PACKET_FANOUT_CPU,
            FanoutMode::Hash => sys::PACKET_FANOUT_HASH,
            FanoutMode::Lb => sys::PACKET_FANOUT_LB,
        }
    }
}

// ============================================================================
// Lock file types (generated, includes all defaults)
// ============================================================================

pub const DEFAULT_FRAME_SIZE: u32 = 2048;
pub const DEFAULT_BLOCK_SIZE: u32 = 1 << 22;
pub const DEFAULT_BLOCK_COUNT: u32 = 64;
pub const DEFAULT_MAX_QUEUES: usize = 64;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_BATCH_SIZE: u64 = 10_000;
pub const DEFAULT_FLUSH_RETRIES: u32 = 3;
pub const DEFAULT_FLUSH_RETRY_DELAY_MS: u64 = 100;

/// Generated lock file with all defaults filled in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigLock {
    pub generated_at: String,
    pub engine: EngineLock,
    pub ring: RingLock,
    pub transmit: TransmitLock,
    pub logging: LoggingLock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineLock {
    /// Empty until given on the command line or in config.toml
    pub interface: String,
    pub mode: Mode,
    /// 0 means one queue per logical CPU
    pub queues: usize,
    pub max_queues: usize,
    pub poll_timeout_ms: u64,
    pub on_setup_failure: SetupPolicy,
    pub protocol: Protocol,
    pub fanout: FanoutMode,
    pub promiscuous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingLock {
    pub frame_size: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub lock_pages: bool,
    pub map_both: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmitLock {
    pub batch_size: u64,
    /// 0 means unlimited
    pub packet_limit: u64,
    pub flush_retries: u32,
    pub flush_retry_delay_ms: u64,
    /// Empty means the built-in TCP SYN frame
    pub payload_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingLock {
    pub level: String,
    pub format: String,
}

impl ConfigLock {
    pub fn from_config(config: &Config) -> Self {
        let engine = &config.engine;
        let ring = &config.ring;
        let transmit = &config.transmit;

        ConfigLock {
            generated_at: chrono::Utc::now().to_rfc3339(),
            engine: EngineLock {
                interface: engine.interface.clone().unwrap_or_default(),
                mode: engine.mode.unwrap_or_default(),
                queues: engine.queues.unwrap_or(0),
                max_queues: engine.max_queues.unwrap_or(DEFAULT_MAX_QUEUES),
                poll_timeout_ms: engine.poll_timeout_ms.unwrap_or(DEFAULT_POLL_TIMEOUT_MS),
                on_setup_failure: engine.on_setup_failure.unwrap_or_default(),
                protocol: engine.protocol.unwrap_or_default(),
                fanout: engine.fanout.unwrap_or_default(),
                promiscuous: engine.promiscuous.unwrap_or(true),
            },
            ring: RingLock {
                frame_size: ring.frame_size.unwrap_or(DEFAULT_FRAME_SIZE),
                block_size: ring.block_size.unwrap_or(DEFAULT_BLOCK_SIZE),
                block_count: ring.block_count.unwrap_or(DEFAULT_BLOCK_COUNT),
                lock_pages: ring.lock_pages.unwrap_or(true),
                map_both: ring.map_both.unwrap_or(false),
            },
            transmit: TransmitLock {
                batch_size: transmit.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
                packet_limit: transmit.packet_limit.unwrap_or(0),
                flush_retries: transmit.flush_retries.unwrap_or(DEFAULT_FLUSH_RETRIES),
                flush_retry_delay_ms: transmit
                    .flush_retry_delay_ms
                    .unwrap_or(DEFAULT_FLUSH_RETRY_DELAY_MS),
                payload_file: transmit
                    .payload_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            },
            logging: LoggingLock {
                level: config
                    .logging
                    .level
                    .clone()
                    .unwrap_or_else(|| "info".to_string()),
                format: config
                    .logging
                    .format
                    .clone()
                    .unwrap_or_else(|| "pretty".to_string()),
            },
        }
    }

    /// Transmit packet limit, `None` when unlimited
    pub fn packet_limit(&self) -> Option<u64> {
        (self.transmit.packet_limit > 0).then_some(self.transmit.packet_limit)
    }

    /// Configured queue count, `None` for one per CPU
    pub fn queues(&self) -> Option<usize> {
        (self.engine.queues > 0).then_some(self.engine.queues)
    }

    pub fn payload_file(&self) -> Option<PathBuf> {
        (!self.transmit.payload_file.is_empty()).then(|| PathBuf::from(&self.transmit.payload_file))
    }
}
