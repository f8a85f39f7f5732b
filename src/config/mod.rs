//! Configuration management
//!
//! Handles config.toml (user-defined) and config.lock (generated with all defaults).

mod types;
mod validation;

pub use types::*;
pub use validation::{validate, ValidationResult};

use crate::error::RingCreationError;
use crate::ring::RingGeometry;
use crate::{Error, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    let config: Config = toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
    Ok(config)
}

/// Load a previously generated lock file
pub fn load_lock<P: AsRef<Path>>(path: P) -> Result<ConfigLock> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
}

/// Generate a lock file from config, filling in all defaults
pub fn generate_lock(config: &Config) -> ConfigLock {
    ConfigLock::from_config(config)
}

/// Serialize a lock file with its header comment
pub fn render_lock(lock: &ConfigLock) -> Result<String> {
    let body = toml::to_string_pretty(lock).map_err(|e| Error::Config(e.to_string()))?;
    Ok(format!(
        "# pktring configuration lock\n# Generated at {}; edit config.toml and regenerate instead.\n\n{}",
        lock.generated_at, body
    ))
}

impl RingLock {
    pub fn geometry(&self) -> std::result::Result<RingGeometry, RingCreationError> {
        RingGeometry::new(self.frame_size, self.block_size, self.block_count)
    }
}
