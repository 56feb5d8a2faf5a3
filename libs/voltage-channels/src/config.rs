//! Runtime configuration
//!
//! Loaded with `common::load_config("channels")`: defaults, then
//! `config/channels.{toml,yaml,json}`, then `CHANNELS_*` environment variables.

use std::path::Path;
use std::time::Duration;

use errors::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Per-channel wait of `connect_and_wait_async` and `wait_until_ready_async`
    pub connect_timeout_ms: u64,
    pub get_timeout_ms: u64,
    pub put_timeout_ms: u64,
    /// Rolling notification log size, `None` for unbounded
    pub diagnostics_capacity: Option<usize>,
    pub warnings_capacity: usize,
    /// Default for new group handlers
    pub auto_raise_synthetic_events: bool,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3000,
            get_timeout_ms: 3000,
            put_timeout_ms: 3000,
            diagnostics_capacity: Some(1000),
            warnings_capacity: 200,
            auto_raise_synthetic_events: false,
        }
    }
}

impl ChannelsConfig {
    /// Load from the standard configuration sources
    pub fn load() -> Result<Self> {
        common::load_config("channels")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        common::load_config_from_file(path)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.get_timeout_ms)
    }

    pub fn put_timeout(&self) -> Duration {
        Duration::from_millis(self.put_timeout_ms)
    }
}
