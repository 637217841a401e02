//! Tunnel backends
//!
//! A backend brings one WireGuard peer up or down and reports its handshake
//! state. `WgQuickBackend` shells out to `wg-quick` and `wg`; `DummyBackend`
//! keeps everything in memory.

use async_trait::async_trait;
use hop_session::TunnelConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// State of the configured peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStatus {
    pub public_key: String,
    /// Latest handshake in epoch seconds, 0 before the first one
    pub last_handshake: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Tunnel driver
#[async_trait]
pub trait Backend: Send {
    fn name(&self) -> &'static str;

    /// Bring the tunnel up with `config`
    async fn start(&mut self, config: &TunnelConfig) -> Result<(), BackendError>;

    /// Tear the tunnel down
    async fn stop(&mut self) -> Result<(), BackendError>;

    /// Peer state, `None` when no tunnel is up
    async fn status(&mut self) -> Result<Option<PeerStatus>, BackendError>;
}

/// Backend selection in settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    WgQuick,
    Dummy,
}

impl BackendKind {
    pub fn create(self, interface: &str, config_dir: &Path) -> Box<dyn Backend> {
        match self {
            BackendKind::WgQuick => Box::new(WgQuickBackend::new(interface, config_dir)),
            BackendKind::Dummy => Box::new(DummyBackend::new()),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wg-quick" => Ok(BackendKind::WgQuick),
            "dummy" => Ok(BackendKind::Dummy),
            other => Err(BackendError::Unsupported(other.to_string())),
        }
    }
}

/// Render a wg-quick configuration file
pub fn render_config(config: &TunnelConfig) -> Result<String, BackendError> {
    let endpoint = config.endpoint()
        .ok_or_else(|| BackendError::InvalidConfig("no server endpoint".to_string()))?;

    let mut addresses = vec![config.device_ipv4_address.as_str()];
    if config.ipv6_enabled && !config.device_ipv6_address.is_empty() {
        addresses.push(config.device_ipv6_address.as_str());
    }
    addresses.retain(|a| !a.is_empty());

    let allowed: Vec<String> = config.sorted_ranges().iter().map(|r| r.to_string()).collect();

    let mut out = String::new();
    out.push_str("[Interface]\n");
    out.push_str(&format!("PrivateKey = {}\n", config.private_key));
    out.push_str(&format!("Address = {}\n", addresses.join(", ")));
    let dns = config.dns_servers();
    if !dns.is_empty() {
        out.push_str(&format!("DNS = {}\n", dns.join(", ")));
    }
    out.push_str("\n[Peer]\n");
    out.push_str(&format!("PublicKey = {}\n", config.server_public_key));
    out.push_str(&format!("Endpoint = {}\n", SocketAddr::new(endpoint, config.server_port)));
    out.push_str(&format!("AllowedIPs = {}\n", allowed.join(", ")));
    Ok(out)
}

/// Parse `wg show <iface> dump` and return the peer with `public_key`
pub fn parse_dump(dump: &str, public_key: &str) -> Option<PeerStatus> {
    // First line describes the interface itself
    dump.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 || fields[0] != public_key {
            return None;
        }
        Some(PeerStatus {
            public_key: fields[0].to_string(),
            last_handshake: fields[4].parse().unwrap_or(0),
            rx_bytes: fields[5].parse().unwrap_or(0),
            tx_bytes: fields[6].parse().unwrap_or(0),
        })
    })
}

/// `wg-quick` driven tunnel
pub struct WgQuickBackend {
    interface: String,
    config_dir: PathBuf,
    peer: Option<String>,
}

impl WgQuickBackend {
    pub fn new(interface: &str, config_dir: &Path) -> Self {
        Self {
            interface: interface.to_string(),
            config_dir: config_dir.to_path_buf(),
            peer: None,
        }
    }

    /// wg-quick derives the interface name from the file name
    fn config_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.conf", self.interface))
    }

    async fn write_config(&self, content: &str) -> Result<PathBuf, BackendError> {
        let path = self.config_path();
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .map_err(|e| BackendError::Io(e.to_string()))?;

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&path)
            .await
            .map_err(|e| BackendError::Io(e.to_string()))?;
        tokio::io::AsyncWriteExt::write_all(&mut file, content.as_bytes())
            .await
            .map_err(|e| BackendError::Io(e.to_string()))?;

        Ok(path)
    }

    async fn wg_quick(&self, action: &str, path: &Path) -> Result<(), BackendError> {
        debug!("Running wg-quick {} {}", action, path.display());
        let output = Command::new("wg-quick")
            .arg(action)
            .arg(path)
            .output()
            .await
            .map_err(|e| BackendError::Command(format!("wg-quick: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Command(format!("wg-quick {} failed: {}", action, stderr.trim())));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for WgQuickBackend {
    fn name(&self) -> &'static str {
        "wg-quick"
    }

    async fn start(&mut self, config: &TunnelConfig) -> Result<(), BackendError> {
        let content = render_config(config)?;
        let path = self.write_config(&content).await?;

        if let Err(e) = self.wg_quick("up", &path).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }

        info!("Interface {} is up", self.interface);
        self.peer = Some(config.server_public_key.clone());
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), BackendError> {
        if self.peer.take().is_none() {
            return Ok(());
        }

        let path = self.config_path();
        let result = self.wg_quick("down", &path).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Cannot remove {}: {}", path.display(), e);
        }
        result?;

        info!("Interface {} is down", self.interface);
        Ok(())
    }

    async fn status(&mut self) -> Result<Option<PeerStatus>, BackendError> {
        let Some(peer) = &self.peer else {
            return Ok(None);
        };

        let output = Command::new("wg")
            .args(["show", &self.interface, "dump"])
            .output()
            .await
            .map_err(|e| BackendError::Command(format!("wg: {}", e)))?;

        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_dump(&String::from_utf8_lossy(&output.stdout), peer))
    }
}

#[derive(Debug, Default)]
struct DummyState {
    peer: Option<PeerStatus>,
    fail_start: bool,
    fail_stop: bool,
    /// Status polls left before the handshake shows up
    handshake_after: u32,
    pending_polls: u32,
    starts: u32,
}

/// In-memory backend. Clones share state so tests can steer a backend that
/// the daemon owns.
#[derive(Debug, Clone, Default)]
pub struct DummyBackend {
    state: Arc<Mutex<DummyState>>,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start(&self, fail: bool) {
        self.lock().fail_start = fail;
    }

    pub fn fail_stop(&self, fail: bool) {
        self.lock().fail_stop = fail;
    }

    /// Report the handshake only after `polls` status calls
    pub fn handshake_after(&self, polls: u32) {
        self.lock().handshake_after = polls;
    }

    /// Public key of the active peer
    pub fn active_peer(&self) -> Option<String> {
        self.lock().peer.as_ref().map(|p| p.public_key.clone())
    }

    pub fn starts(&self) -> u32 {
        self.lock().starts
    }

    fn lock(&self) -> MutexGuard<'_, DummyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Backend for DummyBackend {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn start(&mut self, config: &TunnelConfig) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.fail_start {
            return Err(BackendError::Command("injected start failure".to_string()));
        }
        state.starts += 1;
        state.pending_polls = state.handshake_after;
        state.peer = Some(PeerStatus {
            public_key: config.server_public_key.clone(),
            ..PeerStatus::default()
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.peer = None;
        if state.fail_stop {
            return Err(BackendError::Command("injected stop failure".to_string()));
        }
        Ok(())
    }

    async fn status(&mut self) -> Result<Option<PeerStatus>, BackendError> {
        let mut state = self.lock();
        if state.pending_polls > 0 {
            state.pending_polls -= 1;
        } else if let Some(peer) = state.peer.as_mut() {
            if peer.last_handshake == 0 {
                peer.last_handshake = hop_session::system_epoch_secs();
            }
            peer.rx_bytes += 1024;
            peer.tx_bytes += 512;
        }
        Ok(state.peer.clone())
    }
}

/// Backend errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported backend: {0}")]
    Unsupported(String),
}
