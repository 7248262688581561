//! Configuration module
//!
//! Handles capture settings, wait defaults and event bindings

mod settings;

pub use settings::{AppConfig, ConfigError, EventBinding};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Config file name inside the config directory
pub const CONFIG_FILE: &str = "config.toml";

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "tracewait", "Tracewait").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Default config file location
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join(CONFIG_FILE))
}
