//! Session settings
//!
//! TOML file holding the device identity, the daemon socket location and
//! tuning for timeouts, health monitoring and the latency sweep. Every
//! field has a default so a partial file is valid.

use crate::config::{ConfigError, IpRange};
use crate::controller::{ControllerConfig, DeviceIdentity};
use crate::health::HealthConfig;
use crate::keys::{KeyError, PrivateKey};
use crate::runtime::LoopIntervals;
use crate::server::CitySelection;
use crate::sweep::SweepConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client settings file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Daemon control socket
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Server catalog (JSON)
    #[serde(default)]
    pub servers_file: Option<PathBuf>,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default = "default_true")]
    pub ipv6_enabled: bool,
    /// Extra CIDR ranges kept off the tunnel
    #[serde(default)]
    pub excluded_ranges: Vec<String>,
    /// DNS override; the server gateways are used when unset
    #[serde(default)]
    pub dns_server: Option<String>,
    /// ISO country code of the user, lifts scores of local cities
    #[serde(default)]
    pub user_country: Option<String>,
    /// City used when activating without an explicit choice
    #[serde(default)]
    pub last_selection: Option<CitySelection>,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub sweep: SweepSettings,
}

/// Tunnel identity assigned to this device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Device private key (base64)
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub ipv4_address: String,
    #[serde(default)]
    pub ipv6_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_handshake_secs")]
    pub handshake_secs: u64,
    #[serde(default = "default_confirm_secs")]
    pub confirm_secs: u64,
    #[serde(default = "default_disconnect_secs")]
    pub disconnect_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub server_cooldown_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            handshake_secs: default_handshake_secs(),
            confirm_secs: default_confirm_secs(),
            disconnect_secs: default_disconnect_secs(),
            server_cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_checkup_interval_ms")]
    pub checkup_interval_ms: u64,
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    #[serde(default = "default_very_slow_ms")]
    pub very_slow_ms: u64,
    #[serde(default = "default_ewma_divisor")]
    pub ewma_divisor: u32,
    /// Share of unanswered probes, in percent, that marks the link unstable
    #[serde(default = "default_loss_unstable_percent")]
    pub loss_unstable_percent: u32,
    /// Move to another server of the city when the link becomes unstable
    #[serde(default = "default_true")]
    pub switch_on_unstable: bool,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            checkup_interval_ms: default_checkup_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
            very_slow_ms: default_very_slow_ms(),
            ewma_divisor: default_ewma_divisor(),
            loss_unstable_percent: default_loss_unstable_percent(),
            switch_on_unstable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_sweep_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_sweep_retries")]
    pub retries: u32,
    #[serde(default = "default_refresh_mins")]
    pub refresh_mins: u64,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_parallel: default_max_parallel(),
            timeout_ms: default_sweep_timeout_ms(),
            retries: default_sweep_retries(),
            refresh_mins: default_refresh_mins(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/hopvpn/daemon.socket")
}

fn default_true() -> bool {
    true
}

fn default_handshake_secs() -> u64 {
    15
}

fn default_confirm_secs() -> u64 {
    10
}

fn default_disconnect_secs() -> u64 {
    10
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_probe_interval_ms() -> u64 {
    1000
}

fn default_checkup_interval_ms() -> u64 {
    1000
}

fn default_stale_after_ms() -> u64 {
    4000
}

fn default_very_slow_ms() -> u64 {
    1000
}

fn default_ewma_divisor() -> u32 {
    8
}

fn default_loss_unstable_percent() -> u32 {
    10
}

fn default_max_parallel() -> usize {
    8
}

fn default_sweep_timeout_ms() -> u64 {
    5000
}

fn default_sweep_retries() -> u32 {
    2
}

fn default_refresh_mins() -> u64 {
    30
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            servers_file: None,
            device: DeviceSettings::default(),
            ipv6_enabled: true,
            excluded_ranges: Vec::new(),
            dns_server: None,
            user_country: None,
            last_selection: None,
            timeouts: TimeoutSettings::default(),
            health: HealthSettings::default(),
            sweep: SweepSettings::default(),
        }
    }
}

impl SessionSettings {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        toml::from_str(content)
            .map_err(|e| SettingsError::Parse(e.to_string()))
    }

    /// Defaults with a freshly generated device key
    pub fn default_config() -> Self {
        Self {
            device: DeviceSettings {
                private_key: PrivateKey::generate().to_base64(),
                ipv4_address: "10.64.0.2/32".to_string(),
                ipv6_address: String::new(),
            },
            ..Self::default()
        }
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Write to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SettingsError::Io(e.to_string()))?;
        }
        std::fs::write(path, self.to_toml()).map_err(|e| SettingsError::Io(e.to_string()))
    }

    pub fn device_identity(&self) -> Result<DeviceIdentity, SettingsError> {
        if self.device.private_key.is_empty() {
            return Err(SettingsError::MissingPrivateKey);
        }
        if self.device.ipv4_address.is_empty() {
            return Err(SettingsError::Invalid("device.ipv4_address is empty".to_string()));
        }

        Ok(DeviceIdentity {
            private_key: PrivateKey::from_base64(&self.device.private_key)?,
            ipv4_address: self.device.ipv4_address.clone(),
            ipv6_address: self.device.ipv6_address.clone(),
        })
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            probe_interval: Duration::from_millis(self.health.probe_interval_ms),
            stale_after: Duration::from_millis(self.health.stale_after_ms),
            very_slow: Duration::from_millis(self.health.very_slow_ms),
            ewma_divisor: self.health.ewma_divisor.max(1),
            loss_unstable_threshold: f64::from(self.health.loss_unstable_percent.min(100)) / 100.0,
        }
    }

    pub fn controller_config(&self) -> Result<ControllerConfig, SettingsError> {
        let excluded_ranges = self.excluded_ranges
            .iter()
            .map(|range| range.parse::<IpRange>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ControllerConfig {
            handshake_timeout: Duration::from_secs(self.timeouts.handshake_secs),
            confirm_timeout: Duration::from_secs(self.timeouts.confirm_secs),
            disconnect_timeout: Duration::from_secs(self.timeouts.disconnect_secs),
            server_cooldown_secs: self.timeouts.server_cooldown_secs,
            ipv6_enabled: self.ipv6_enabled,
            excluded_ranges,
            dns_server: self.dns_server.clone(),
            switch_on_unstable: self.health.switch_on_unstable,
            health: self.health_config(),
        })
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            max_parallel: self.sweep.max_parallel.max(1),
            probe_timeout: Duration::from_millis(self.sweep.timeout_ms),
            max_retries: self.sweep.retries,
            refresh_interval: Duration::from_secs(self.sweep.refresh_mins * 60),
        }
    }

    pub fn loop_intervals(&self) -> LoopIntervals {
        LoopIntervals {
            probe: Duration::from_millis(self.health.probe_interval_ms.max(1)),
            checkup: Duration::from_millis(self.health.checkup_interval_ms.max(1)),
            ..LoopIntervals::default()
        }
    }
}

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("No device private key configured")]
    MissingPrivateKey,

    #[error("Invalid device key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("Invalid range: {0}")]
    InvalidRange(#[from] ConfigError),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}
