//! Application settings and event bindings

use crate::core::error::CaptureError;
use crate::core::event_map::EventMap;
use crate::core::session::CaptureSettings;
use crate::core::trace::WaitOptions;
use crate::core::transport::SerialConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration load/save errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Could not determine config directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// File could not be read or written
    #[error("{path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("{path}: {source}")]
    Parse {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: toml::de::Error,
    },

    /// Config could not be serialized
    #[error("Could not serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// One `[[events]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBinding {
    /// Symbolic event name
    pub event: String,
    /// Pattern identifying it
    pub pattern: String,
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Session timing
    pub capture: CaptureSettings,
    /// Default wait options for the harness
    pub wait: WaitOptions,
    /// Serial port to capture from, when not given on the command line
    pub serial: Option<SerialConfig>,
    /// Event map entries
    pub events: Vec<EventBinding>,
}

impl AppConfig {
    /// Load config from the default location; a missing file yields defaults
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::config_path().ok_or(ConfigError::NoConfigDir)?;
        Self::load_from(&path)
    }

    /// Load config from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `(event, pattern)` pairs in file order
    pub fn event_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.events.iter().map(|b| (b.event.as_str(), b.pattern.as_str()))
    }

    /// Build the event map, rejecting duplicate events or patterns
    pub fn event_map(&self) -> Result<EventMap, CaptureError> {
        EventMap::from_pairs(self.event_pairs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::trace::CollectionPolicy;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.capture.mutex_timeout_ms, 10_000);
    }

    #[test]
    fn test_parse_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[capture]
hardware_recovery_time_sec = 1.5

[wait]
collection = "matching"

[serial]
port = "/dev/ttyACM0"
baud_rate = 9600

[[events]]
event = "boot"
pattern = "Booting"

[[events]]
event = "ready"
pattern = "READY"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert!((config.capture.hardware_recovery_time_sec - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.capture.poll_interval_ms, 50);
        assert_eq!(config.wait.collection, CollectionPolicy::Matching);
        assert_eq!(config.wait.timeout_ms, 10_000);
        assert_eq!(config.serial.as_ref().map(|s| s.baud_rate), Some(9600));

        let map = config.event_map().unwrap();
        assert_eq!(map.pattern_for("ready"), Some("READY"));
    }

    #[test]
    fn test_duplicate_binding_rejected() {
        let config = AppConfig {
            events: vec![
                EventBinding {
                    event: "a".into(),
                    pattern: "X".into(),
                },
                EventBinding {
                    event: "b".into(),
                    pattern: "X".into(),
                },
            ],
            ..Default::default()
        };
        assert!(matches!(config.event_map(), Err(CaptureError::InvalidEventMap(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.capture.startup_timeout_ms = 0;
        config.events.push(EventBinding {
            event: "ready".into(),
            pattern: "READY".into(),
        });
        config.save_to(&path).unwrap();

        assert_eq!(AppConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[capture\n").unwrap();

        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }
}
