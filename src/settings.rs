//! Persisted engine settings.
//!
//! The settings document is JSON under the per-user configuration directory
//! (`<config_dir>/WhoaScope/settings.json`). Missing keys take their defaults, and a file that
//! cannot be parsed is reported and replaced by defaults rather than failing startup.

use crate::config::{AcquisitionConfig, ChannelConfig, ConfigError};
use crate::trigger_config::TriggerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "WhoaScope";
const FILE_NAME: &str = "settings.json";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid settings file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No configuration directory on this platform")]
    NoConfigDir,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub acquisition: AcquisitionConfig,
    pub trigger: TriggerConfig,
    /// Indexed by channel. Extended with defaults or truncated to the device channel count on
    /// connect.
    pub channels: Vec<ChannelConfig>,
    /// Frames averaged by the rolling voltmeter.
    pub voltmeter_depth: usize,
    /// Serial port of the last device used.
    pub last_port: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            acquisition: AcquisitionConfig::default(),
            trigger: TriggerConfig::default(),
            channels: vec![ChannelConfig::default(); 2],
            voltmeter_depth: 8,
            last_port: None,
        }
    }
}

impl Settings {
    /// Checks everything that does not depend on the connected device.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.acquisition.validate(0)?;
        for (channel, config) in self.channels.iter().enumerate() {
            config.validate(channel)?;
        }
        self.trigger.validate(usize::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_location() -> Result<Self, SettingsError> {
        let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
        Ok(Self::new(dir.join(APP_DIR).join(FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no settings were saved yet.
    pub fn try_load(&self) -> Result<Option<Settings>, SettingsError> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Load the saved settings, falling back to defaults when there are none or they are
    /// unreadable.
    pub fn load(&self) -> Settings {
        match self.try_load() {
            Ok(Some(settings)) => {
                log::debug!("Loaded settings from {}", self.path.display());
                settings
            }
            Ok(None) => {
                log::debug!("No settings at {}, using defaults", self.path.display());
                Settings::default()
            }
            Err(e) => {
                log::warn!(
                    "Ignoring settings at {}: {}. Using defaults",
                    self.path.display(),
                    e
                );
                Settings::default()
            }
        }
    }

    /// Write the settings, replacing the previous file only once the new one is complete.
    pub fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, json)?;
        fs::rename(&staging, &self.path)?;
        log::debug!("Saved settings to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger_config::Edge;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("nested").join(FILE_NAME));
        let settings = Settings {
            trigger: TriggerConfig::start_capturing_when(1)
                .normal()
                .falling_edge(0.8),
            last_port: Some("/dev/ttyACM0".to_string()),
            ..Settings::default()
        };
        store.save(&settings).unwrap();
        assert_eq!(store.load(), settings);
    }

    #[test]
    fn test_missing_keys_take_defaults() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join(FILE_NAME));
        fs::write(store.path(), r#"{ "trigger": { "level": 1.25, "edge": "Falling" } }"#).unwrap();
        let settings = store.load();
        assert_eq!(settings.trigger.level, 1.25);
        assert_eq!(settings.trigger.edge, Edge::Falling);
        assert_eq!(settings.acquisition, AcquisitionConfig::default());
        assert_eq!(settings.channels.len(), 2);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join(FILE_NAME));
        fs::write(store.path(), "{ not json").unwrap();
        assert!(matches!(store.try_load(), Err(SettingsError::Json(_))));
        assert_eq!(store.load(), Settings::default());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join(FILE_NAME));
        assert!(matches!(store.try_load(), Ok(None)));
    }

    #[test]
    fn test_default_settings_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }
}
