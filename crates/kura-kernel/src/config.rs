//! Engine configuration.
//!
//! Configuration is plain data with defaults for every field, so a RON file
//! only needs to name what it changes:
//!
//! ```ron
//! (
//!     block_size: 4096,
//!     gc_interval_secs: 60,
//! )
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::*;

/// Error loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for a [`crate::Kura`] engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KuraConfig {
    /// Default chunk size for `write_file`.
    pub block_size: usize,
    /// Seconds between garbage collection passes. Zero disables the timer.
    pub gc_interval_secs: u64,
    /// Milliseconds between outbound replication frames.
    pub tx_interval_ms: u64,
    /// Byte budget of one outbound frame.
    pub frame_size: usize,
    /// Capacity of the async event subscription channel.
    pub bus_capacity: usize,
    /// Queue local changes for replication.
    pub sync: bool,
    /// Seconds a deletion is remembered before garbage collection forgets
    /// it. Zero remembers deletions forever.
    pub tombstone_ttl_secs: u64,
}

impl Default for KuraConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            gc_interval_secs: DEFAULT_GC_INTERVAL_SECS,
            tx_interval_ms: DEFAULT_TX_INTERVAL_MS,
            frame_size: DEFAULT_FRAME_SIZE,
            bus_capacity: DEFAULT_BUS_CAPACITY,
            sync: true,
            tombstone_ttl_secs: DEFAULT_TOMBSTONE_TTL_SECS,
        }
    }
}

impl KuraConfig {
    /// Parse a RON document.
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        let config: KuraConfig = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a RON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron_str(&text)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::Invalid("block_size must be positive".into()));
        }
        if self.frame_size == 0 {
            return Err(ConfigError::Invalid("frame_size must be positive".into()));
        }
        Ok(())
    }

    /// Garbage collection period, if enabled.
    pub fn gc_interval(&self) -> Option<Duration> {
        (self.gc_interval_secs > 0).then(|| Duration::from_secs(self.gc_interval_secs))
    }

    /// How long deletions are remembered, if not forever.
    pub fn tombstone_ttl(&self) -> Option<Duration> {
        (self.tombstone_ttl_secs > 0).then(|| Duration::from_secs(self.tombstone_ttl_secs))
    }

    /// Replication producer period.
    pub fn tx_interval(&self) -> Duration {
        Duration::from_millis(self.tx_interval_ms.max(1))
    }
}
