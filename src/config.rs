//! Global snapvisor configuration.
//!
//! The configuration is a TOML file at `<config dir>/snapvisor/config.toml`.
//! A missing file yields the defaults.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config and data directories.
const APP_NAME: &str = "snapvisor";

/// Config file name.
const CONFIG_FILE: &str = "config.toml";

/// Global snapvisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SnapvisorConfig {
    /// Directory id new VMs are registered under.
    pub directory_id: String,

    /// Directory holding VM homes.
    pub vm_root: PathBuf,

    /// Catalogue persistence file.
    pub catalogue_path: PathBuf,

    /// Poll interval for agent replies and lock waits.
    #[serde(with = "duration_str")]
    pub agent_poll_interval: Duration,

    /// Agent socket file name inside a VM home.
    pub agent_socket_name: String,

    /// API listen address.
    pub listen: String,

    /// MAC prefix for VMs (6 hex digits).
    pub mac_prefix_vm: String,

    /// MAC prefix for containers (6 hex digits).
    pub mac_prefix_ct: String,
}

impl Default for SnapvisorConfig {
    fn default() -> Self {
        let data = data_dir();
        Self {
            directory_id: "default".to_string(),
            vm_root: data.join("vms"),
            catalogue_path: data.join("catalogue.json"),
            agent_poll_interval: Duration::from_millis(100),
            agent_socket_name: "agent.sock".to_string(),
            listen: "127.0.0.1:8090".to_string(),
            mac_prefix_vm: "001C42".to_string(),
            mac_prefix_ct: "C43772".to_string(),
        }
    }
}

impl SnapvisorConfig {
    /// Default config file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_NAME)
            .join(CONFIG_FILE)
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from a file.
    ///
    /// If the file doesn't exist, returns the default configuration.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(Error::ConfigLoad(format!("{}: {}", path.display(), e))),
        };
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::ConfigSave(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::ConfigSave(format!("{}: {}", parent.display(), e)))?;
        }
        std::fs::write(path, text)
            .map_err(|e| Error::ConfigSave(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Check field values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        for (field, prefix) in [
            ("mac_prefix_vm", &self.mac_prefix_vm),
            ("mac_prefix_ct", &self.mac_prefix_ct),
        ] {
            if prefix.len() != 6 || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::Config(format!(
                    "{} must be 6 hex digits, got '{}'",
                    field, prefix
                )));
            }
        }
        if self.agent_poll_interval.is_zero() {
            return Err(Error::Config("agent_poll_interval must be positive".into()));
        }
        Ok(())
    }
}

/// Data directory for snapvisor state.
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Serialize durations as humantime strings ("100ms", "2s").
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = SnapvisorConfig::default();
        assert_eq!(config.directory_id, "default");
        assert_eq!(config.agent_poll_interval, Duration::from_millis(100));
        assert_eq!(config.mac_prefix_vm, "001C42");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = SnapvisorConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, SnapvisorConfig::default());
    }

    #[test]
    fn test_partial_file_and_humantime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "directory_id = \"lab\"\nagent_poll_interval = \"250ms\"\n",
        )
        .unwrap();

        let config = SnapvisorConfig::load_from(&path).unwrap();
        assert_eq!(config.directory_id, "lab");
        assert_eq!(config.agent_poll_interval, Duration::from_millis(250));
        assert_eq!(config.listen, "127.0.0.1:8090");
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = SnapvisorConfig::default();
        config.vm_root = dir.path().join("vms");
        config.save_to(&path).unwrap();

        assert_eq!(SnapvisorConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_bad_mac_prefix_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "mac_prefix_ct = \"XYZ\"\n").unwrap();
        assert!(matches!(
            SnapvisorConfig::load_from(&path),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_garbage_is_load_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is = = not toml").unwrap();
        assert!(matches!(
            SnapvisorConfig::load_from(&path),
            Err(Error::ConfigLoad(_))
        ));
    }
}
