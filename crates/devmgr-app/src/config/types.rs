//! Configuration types for Device Manager
//!
//! Defines `Settings` (the `config.toml` file) and its sections.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application settings (config.toml)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub logging: LogSettings,

    #[serde(default)]
    pub adb: AdbSettings,

    #[serde(default)]
    pub scripts: ScriptSettings,
}

/// Worker pool and helper-script limits
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineSettings {
    /// Maximum number of device operations running at once
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Timeout for helper scripts that are not long-running
    #[serde(default = "default_script_timeout_secs")]
    pub script_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            script_timeout_secs: default_script_timeout_secs(),
        }
    }
}

impl EngineSettings {
    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }
}

fn default_pool_size() -> usize {
    10
}

fn default_script_timeout_secs() -> u64 {
    30
}

/// Log streaming cadence
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LogSettings {
    /// Minimum gap between two batches delivered to the log listener
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Delay between process table refreshes
    #[serde(default = "default_process_refresh_secs")]
    pub process_refresh_secs: u64,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            process_refresh_secs: default_process_refresh_secs(),
        }
    }
}

impl LogSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Never shorter than a second; zero would spin the refresh loop
    pub fn process_refresh(&self) -> Duration {
        Duration::from_secs(self.process_refresh_secs.max(1))
    }
}

fn default_flush_interval_ms() -> u64 {
    100
}

fn default_process_refresh_secs() -> u64 {
    30
}

/// Location of the adb client
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AdbSettings {
    /// Bare name (looked up on PATH) or absolute path
    #[serde(default = "default_adb_path")]
    pub path: String,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            path: default_adb_path(),
        }
    }
}

fn default_adb_path() -> String {
    "adb".to_string()
}

/// Where helper scripts live
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ScriptSettings {
    /// Defaults to the OS temp directory
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl ScriptSettings {
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
