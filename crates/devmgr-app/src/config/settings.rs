//! Settings loader for config.toml

use super::types::Settings;
use devmgr_core::prelude::*;
use std::path::{Path, PathBuf};

const CONFIG_FILENAME: &str = "config.toml";
const APP_DIR: &str = "device-manager";

/// Default location: `<config_dir>/device-manager/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILENAME))
}

/// Load settings from `config_path`
///
/// A missing file yields defaults. A file that cannot be read or parsed is
/// reported with a warning and also yields defaults.
pub fn load_settings(config_path: &Path) -> Settings {
    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match std::fs::read_to_string(config_path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", config_path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", config_path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            Settings::default()
        }
    }
}

/// Load from `--config` when given, otherwise from the default location
pub fn load_settings_from(explicit: Option<&Path>) -> Settings {
    match explicit.map(Path::to_path_buf).or_else(default_config_path) {
        Some(path) => load_settings(&path),
        None => {
            warn!("No config directory on this platform, using defaults");
            Settings::default()
        }
    }
}

/// Write settings back to `config_path`, creating its directory
pub fn save_settings(config_path: &Path, settings: &Settings) -> Result<()> {
    if let Some(dir) = config_path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::config(format!("Failed to create {:?}: {}", dir, e)))?;
        }
    }

    let content = toml::to_string_pretty(settings)
        .map_err(|e| Error::config(format!("Failed to serialize settings: {}", e)))?;

    // Atomic write: temp file, then rename
    let temp_path = config_path.with_extension("toml.tmp");
    std::fs::write(&temp_path, format!("{}{}", generate_config_header(), content))
        .map_err(|e| Error::config(format!("Failed to write temp file: {}", e)))?;
    std::fs::rename(&temp_path, config_path)
        .map_err(|e| Error::config(format!("Failed to rename temp file: {}", e)))?;

    info!("Saved settings to {:?}", config_path);
    Ok(())
}

fn generate_config_header() -> &'static str {
    "# Device Manager Configuration\n\n"
}
