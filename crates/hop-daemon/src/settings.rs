//! Daemon settings (TOML)

use crate::backend::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Permission bits of the socket file
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Where the wg-quick configuration is written
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Log lines kept for `logs` requests
    #[serde(default = "default_log_lines")]
    pub log_lines: usize,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/hopvpn/daemon.socket")
}

fn default_socket_mode() -> u32 {
    0o666
}

fn default_interface() -> String {
    "hop0".to_string()
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/run/hopvpn")
}

fn default_log_lines() -> usize {
    crate::logs::DEFAULT_LOG_LINES
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            socket_mode: default_socket_mode(),
            backend: BackendKind::default(),
            interface: default_interface(),
            config_dir: default_config_dir(),
            log_lines: default_log_lines(),
        }
    }
}

impl DaemonSettings {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(content)
            .map_err(|e| SettingsError::Parse(e.to_string()))?;

        if settings.interface.is_empty() || settings.interface.len() > 15 {
            return Err(SettingsError::Invalid(format!("interface name {:?}", settings.interface)));
        }
        Ok(settings)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = DaemonSettings::from_toml("").unwrap();

        assert_eq!(settings, DaemonSettings::default());
        assert_eq!(settings.backend, BackendKind::WgQuick);
        assert_eq!(settings.socket_mode, 0o666);
    }

    #[test]
    fn test_dummy_backend() {
        let settings = DaemonSettings::from_toml("backend = \"dummy\"\ninterface = \"wg-test\"").unwrap();

        assert_eq!(settings.backend, BackendKind::Dummy);
        assert_eq!(settings.interface, "wg-test");
    }

    #[test]
    fn test_interface_name_too_long() {
        assert!(DaemonSettings::from_toml("interface = \"a-very-long-interface\"").is_err());
    }
}
