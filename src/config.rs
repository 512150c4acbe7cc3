use crate::error::ConfigError;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Tunables for one capture session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MeterConfig {
    /// env_logger filter used when `RUST_LOG` is unset ("info", "debug", ...)
    pub log_level: String,
    /// Span of the realtime DPS window
    pub window_ms: u64,
    /// Cadence of the window sweep and the segment cache sweep
    pub sweep_interval_ms: u64,
    /// Cadence of `DataUpdate` pushes to the presentation layer
    pub push_interval_ms: u64,
    /// How long an undrained segment (or a drained slot) may stay cached
    pub cache_ttl_ms: u64,
    /// Silence on the active flow before the session is reset
    pub stall_timeout_ms: u64,
    /// Frame length sanity bound, also used to recognize a stream start
    pub max_frame_len: u32,
    /// Bound of the outgoing event channel
    pub event_capacity: usize,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            window_ms: 1000,
            sweep_interval_ms: 100,
            push_interval_ms: 200,
            cache_ttl_ms: 10_000,
            stall_timeout_ms: 30_000,
            max_frame_len: 999_999,
            event_capacity: 1024,
        }
    }
}

impl MeterConfig {
    /// Reads the config at `path`. A missing file is created with the defaults,
    /// an unreadable JSON body falls back to the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let default_config = MeterConfig::default();
            if let Err(e) = default_config.save(path) {
                warn!("[Config] Could not write default config to {}: {}", path.display(), e);
            }
            return Ok(default_config);
        }

        let content = fs::read_to_string(path)?;
        match serde_json::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("[Config] Invalid config {} ({}). Using defaults.", path.display(), e);
                Ok(MeterConfig::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        info!("[Config] Saved {}", path.display());
        Ok(())
    }
}
