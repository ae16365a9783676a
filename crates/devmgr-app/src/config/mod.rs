//! Configuration file parsing for Device Manager
//!
//! Supports `<config_dir>/device-manager/config.toml` or an explicit path.

pub mod settings;
pub mod types;

pub use settings::{default_config_path, load_settings, load_settings_from, save_settings};
pub use types::*;
