//! Tunnel actor
//!
//! One task owns the backend, the access control state and the log buffer.
//! Connections send it commands over an mpsc queue and receive
//! notifications (`connected`, `disconnected`, `backendFailure`) over a
//! broadcast channel, so requests from several clients are applied one at a
//! time.

use crate::access::AccessControl;
use crate::backend::Backend;
use crate::logs::LogBuffer;
use hop_session::{system_epoch_secs, DaemonReply, DaemonRequest, StatusReply, TunnelConfig};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How often the backend is polled for a pending handshake
pub const HANDSHAKE_POLL: Duration = Duration::from_millis(250);

/// Actor commands
#[derive(Debug)]
pub enum DaemonCommand {
    /// A decoded request from the peer `uid`
    Request {
        uid: Option<u32>,
        request: DaemonRequest,
        reply: oneshot::Sender<Option<DaemonReply>>,
    },
    /// An `activate` frame whose payload could not be parsed
    InvalidActivation { uid: Option<u32>, reason: String },
    /// Tear the tunnel down and stop
    Shutdown { done: oneshot::Sender<()> },
}

struct ActiveTunnel {
    config: TunnelConfig,
    activated_at: u64,
    /// Set once the backend reports the first handshake
    handshake_at: Option<u64>,
}

struct DaemonActor {
    backend: Box<dyn Backend>,
    access: AccessControl,
    logs: LogBuffer,
    active: Option<ActiveTunnel>,
    events: broadcast::Sender<DaemonReply>,
}

impl DaemonActor {
    fn is_active(&self) -> bool {
        self.active.is_some()
    }

    fn awaiting_handshake(&self) -> bool {
        self.active.as_ref().map(|t| t.handshake_at.is_none()).unwrap_or(false)
    }

    fn broadcast(&self, reply: DaemonReply) {
        // No connected clients is fine
        let _ = self.events.send(reply);
    }

    async fn handle_request(&mut self, uid: Option<u32>, request: DaemonRequest) -> Option<DaemonReply> {
        debug!("Command received: {}", request.kind());

        if !self.access.authorize(uid, request.kind(), self.is_active()) {
            warn!("Caller is unauthorized. Ignoring {}", request.kind());
            // Queries still get an answer, with nothing in it
            return match request {
                DaemonRequest::Status => Some(DaemonReply::Status(StatusReply::default())),
                DaemonRequest::Logs => Some(DaemonReply::Logs { logs: String::new() }),
                _ => None,
            };
        }

        match request {
            DaemonRequest::Activate(config) => {
                self.activate(config).await;
                None
            }
            DaemonRequest::Deactivate => {
                self.deactivate().await;
                None
            }
            DaemonRequest::Status => Some(DaemonReply::Status(self.status().await)),
            DaemonRequest::Logs => Some(DaemonReply::Logs { logs: self.logs.contents() }),
            DaemonRequest::CleanLogs => {
                self.logs.clear();
                None
            }
        }
    }

    fn reject_activation(&mut self, uid: Option<u32>, reason: &str) {
        if !self.access.authorize(uid, "activate", self.is_active()) {
            warn!("Caller is unauthorized. Ignoring activate");
            return;
        }
        error!("Invalid configuration: {}", reason);
        if !self.is_active() {
            self.access.reset();
        }
        self.broadcast(DaemonReply::Disconnected);
    }

    async fn activate(&mut self, config: TunnelConfig) {
        if let Err(e) = config.validate() {
            error!("Invalid configuration: {}", e);
            if !self.is_active() {
                self.access.reset();
            }
            self.broadcast(DaemonReply::Disconnected);
            return;
        }

        if let Some(previous) = self.active.take() {
            info!("Already connected, switching server");
            if let Err(e) = self.backend.stop().await {
                warn!("Failed to stop previous tunnel to {}: {}", previous.config.server_ipv4_addr_in, e);
            }
        }

        info!(
            "Activating interface via {} (endpoint {}:{})",
            self.backend.name(),
            config.server_ipv4_addr_in,
            config.server_port
        );

        match self.backend.start(&config).await {
            Ok(()) => {
                debug!("Session owned by uid {:?}", self.access.session_owner());
                self.active = Some(ActiveTunnel {
                    config,
                    activated_at: system_epoch_secs(),
                    handshake_at: None,
                });
            }
            Err(e) => {
                error!("Failed to activate the interface: {}", e);
                self.access.reset();
                self.broadcast(DaemonReply::Disconnected);
            }
        }
    }

    async fn deactivate(&mut self) {
        if self.active.take().is_some() {
            info!("Deactivating interface");
            if let Err(e) = self.backend.stop().await {
                error!("Failed to deactivate the interface: {}", e);
                self.broadcast(DaemonReply::BackendFailure);
            }
        } else {
            debug!("Deactivate requested with no tunnel up");
        }

        self.access.reset();
        self.broadcast(DaemonReply::Disconnected);
    }

    async fn status(&mut self) -> StatusReply {
        let Some(tunnel) = &self.active else {
            return StatusReply::default();
        };

        let peer = match self.backend.status().await {
            Ok(Some(peer)) if peer.public_key == tunnel.config.server_public_key => peer,
            Ok(_) => return StatusReply::default(),
            Err(e) => {
                warn!("Status query failed: {}", e);
                return StatusReply::default();
            }
        };

        StatusReply {
            connected: true,
            server_ipv4_gateway: tunnel.config.server_ipv4_gateway.clone(),
            device_ipv4_address: tunnel.config.device_ipv4_address.clone(),
            date: tunnel.handshake_at.unwrap_or(tunnel.activated_at),
            tx_bytes: peer.tx_bytes,
            rx_bytes: peer.rx_bytes,
        }
    }

    async fn check_handshake(&mut self) {
        let Some(public_key) = self.active.as_ref().map(|t| t.config.server_public_key.clone()) else {
            return;
        };
        debug!("Checking for handshake...");

        let peer = match self.backend.status().await {
            Ok(Some(peer)) if peer.public_key == public_key => peer,
            Ok(_) => return,
            Err(e) => {
                debug!("Handshake check failed: {}", e);
                return;
            }
        };
        if peer.last_handshake == 0 {
            return;
        }

        if let Some(tunnel) = self.active.as_mut() {
            tunnel.handshake_at = Some(peer.last_handshake);
        }
        info!("Handshake completed");
        self.broadcast(DaemonReply::Connected { pubkey: public_key });
    }

    async fn shutdown(&mut self) {
        if self.active.take().is_some() {
            info!("Shutting down, bringing the tunnel down");
            if let Err(e) = self.backend.stop().await {
                error!("Failed to deactivate the interface: {}", e);
            }
            self.broadcast(DaemonReply::Disconnected);
        }
        self.access.reset();
    }
}

/// Cloneable handle to the tunnel actor
#[derive(Clone)]
pub struct DaemonHandle {
    commands: mpsc::Sender<DaemonCommand>,
    events: broadcast::Sender<DaemonReply>,
}

impl DaemonHandle {
    /// Run a request; `None` when there is no direct reply
    pub async fn request(&self, uid: Option<u32>, request: DaemonRequest) -> Option<DaemonReply> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(DaemonCommand::Request { uid, request, reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn invalid_activation(&self, uid: Option<u32>, reason: String) {
        let _ = self.commands.send(DaemonCommand::InvalidActivation { uid, reason }).await;
    }

    /// Subscribe to notifications for all clients
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonReply> {
        self.events.subscribe()
    }

    /// Bring the tunnel down and stop the actor
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(DaemonCommand::Shutdown { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawn the tunnel actor
pub fn spawn_daemon(backend: Box<dyn Backend>, logs: LogBuffer) -> DaemonHandle {
    let (commands, mut command_rx) = mpsc::channel::<DaemonCommand>(256);
    let (events, _) = broadcast::channel(256);

    let mut actor = DaemonActor {
        backend,
        access: AccessControl::new(),
        logs,
        active: None,
        events: events.clone(),
    };

    tokio::spawn(async move {
        let mut poll = tokio::time::interval(HANDSHAKE_POLL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    match command {
                        DaemonCommand::Request { uid, request, reply } => {
                            let response = actor.handle_request(uid, request).await;
                            let _ = reply.send(response);
                        }
                        DaemonCommand::InvalidActivation { uid, reason } => {
                            actor.reject_activation(uid, &reason);
                        }
                        DaemonCommand::Shutdown { done } => {
                            actor.shutdown().await;
                            let _ = done.send(());
                            break;
                        }
                    }
                }
                _ = poll.tick(), if actor.awaiting_handshake() => {
                    actor.check_handshake().await;
                }
            }
        }

        debug!("Tunnel actor stopped");
    });

    DaemonHandle { commands, events }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use hop_session::{compute_allowed_ips, KeyPair};

    const OWNER: Option<u32> = Some(1000);
    const OTHER: Option<u32> = Some(1001);

    fn config() -> TunnelConfig {
        TunnelConfig {
            private_key: KeyPair::generate().private.to_base64(),
            device_ipv4_address: "10.64.0.2/32".to_string(),
            device_ipv6_address: String::new(),
            server_ipv4_gateway: "10.64.0.1".to_string(),
            server_ipv6_gateway: String::new(),
            server_public_key: KeyPair::generate().public.to_base64(),
            server_ipv4_addr_in: "185.65.135.10".to_string(),
            server_ipv6_addr_in: String::new(),
            server_port: 51820,
            ipv6_enabled: false,
            allowed_ip_address_ranges: compute_allowed_ips("10.64.0.1".parse().unwrap(), None, &[]),
            dns_server: None,
        }
    }

    async fn next(events: &mut broadcast::Receiver<DaemonReply>) -> DaemonReply {
        tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_activate_reports_handshake() {
        let backend = DummyBackend::new();
        backend.handshake_after(2);
        let handle = spawn_daemon(Box::new(backend.clone()), LogBuffer::default());
        let mut events = handle.subscribe();
        let config = config();

        assert_eq!(handle.request(OWNER, DaemonRequest::Activate(config.clone())).await, None);

        assert_eq!(next(&mut events).await, DaemonReply::Connected { pubkey: config.server_public_key.clone() });
        assert_eq!(backend.active_peer(), Some(config.server_public_key));

        let Some(DaemonReply::Status(status)) = handle.request(OWNER, DaemonRequest::Status).await else {
            panic!("expected status");
        };
        assert!(status.connected);
        assert_eq!(status.server_ipv4_gateway, "10.64.0.1");
        assert!(status.date > 0);
    }

    #[tokio::test]
    async fn test_deactivate_broadcasts_and_releases() {
        let handle = spawn_daemon(Box::new(DummyBackend::new()), LogBuffer::default());
        let mut events = handle.subscribe();

        handle.request(OWNER, DaemonRequest::Activate(config())).await;
        assert!(matches!(next(&mut events).await, DaemonReply::Connected { .. }));

        // Someone else cannot take the tunnel down
        handle.request(OTHER, DaemonRequest::Deactivate).await;
        handle.request(OWNER, DaemonRequest::Deactivate).await;
        assert_eq!(next(&mut events).await, DaemonReply::Disconnected);

        // Session released
        handle.request(OTHER, DaemonRequest::Activate(config())).await;
        assert!(matches!(next(&mut events).await, DaemonReply::Connected { .. }));
    }

    #[tokio::test]
    async fn test_other_user_queries_get_empty_answers() {
        let logs = LogBuffer::default();
        logs.push_line("activating");
        let handle = spawn_daemon(Box::new(DummyBackend::new()), logs);
        let mut events = handle.subscribe();

        handle.request(OWNER, DaemonRequest::Activate(config())).await;
        assert!(matches!(next(&mut events).await, DaemonReply::Connected { .. }));

        let Some(DaemonReply::Status(status)) = handle.request(OTHER, DaemonRequest::Status).await else {
            panic!("expected status");
        };
        assert_eq!(status, StatusReply::default());
        assert!(!status.connected);

        assert_eq!(
            handle.request(OTHER, DaemonRequest::Logs).await,
            Some(DaemonReply::Logs { logs: String::new() })
        );
        assert_eq!(handle.request(OTHER, DaemonRequest::CleanLogs).await, None);

        // The owner still sees the real state
        let Some(DaemonReply::Status(status)) = handle.request(OWNER, DaemonRequest::Status).await else {
            panic!("expected status");
        };
        assert!(status.connected);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_closed() {
        let backend = DummyBackend::new();
        let handle = spawn_daemon(Box::new(backend.clone()), LogBuffer::default());
        let mut events = handle.subscribe();

        let mut config = config();
        config.server_ipv4_gateway = "10.64.0.1\nPostUp = rm -rf /".to_string();
        handle.request(OWNER, DaemonRequest::Activate(config)).await;

        assert_eq!(next(&mut events).await, DaemonReply::Disconnected);
        assert_eq!(backend.starts(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_activation_fails_closed() {
        let handle = spawn_daemon(Box::new(DummyBackend::new()), LogBuffer::default());
        let mut events = handle.subscribe();

        handle.invalid_activation(OWNER, "missing field `serverPort`".to_string()).await;

        assert_eq!(next(&mut events).await, DaemonReply::Disconnected);
    }

    #[tokio::test]
    async fn test_backend_start_failure() {
        let backend = DummyBackend::new();
        backend.fail_start(true);
        let handle = spawn_daemon(Box::new(backend), LogBuffer::default());
        let mut events = handle.subscribe();

        handle.request(OWNER, DaemonRequest::Activate(config())).await;

        assert_eq!(next(&mut events).await, DaemonReply::Disconnected);
        let Some(DaemonReply::Status(status)) = handle.request(OTHER, DaemonRequest::Status).await else {
            panic!("expected status");
        };
        assert!(!status.connected);
    }

    #[tokio::test]
    async fn test_stop_failure_reports_backend_failure() {
        let backend = DummyBackend::new();
        let handle = spawn_daemon(Box::new(backend.clone()), LogBuffer::default());
        let mut events = handle.subscribe();
        handle.request(OWNER, DaemonRequest::Activate(config())).await;
        next(&mut events).await;

        backend.fail_stop(true);
        handle.request(OWNER, DaemonRequest::Deactivate).await;

        assert_eq!(next(&mut events).await, DaemonReply::BackendFailure);
        assert_eq!(next(&mut events).await, DaemonReply::Disconnected);
    }

    #[tokio::test]
    async fn test_switch_server_restarts_backend() {
        let backend = DummyBackend::new();
        let handle = spawn_daemon(Box::new(backend.clone()), LogBuffer::default());
        let mut events = handle.subscribe();

        handle.request(OWNER, DaemonRequest::Activate(config())).await;
        next(&mut events).await;
        let second = config();
        handle.request(OWNER, DaemonRequest::Activate(second.clone())).await;

        assert_eq!(next(&mut events).await, DaemonReply::Connected { pubkey: second.server_public_key.clone() });
        assert_eq!(backend.starts(), 2);
        assert_eq!(backend.active_peer(), Some(second.server_public_key));
    }

    #[tokio::test]
    async fn test_logs_and_cleanlogs() {
        let logs = LogBuffer::default();
        logs.push_line("INFO daemon started");
        let handle = spawn_daemon(Box::new(DummyBackend::new()), logs.clone());

        let reply = handle.request(OTHER, DaemonRequest::Logs).await;
        assert_eq!(reply, Some(DaemonReply::Logs { logs: "INFO daemon started\n".to_string() }));

        // Refused without a session
        handle.request(OTHER, DaemonRequest::CleanLogs).await;
        assert_eq!(logs.len(), 1);

        handle.request(Some(0), DaemonRequest::CleanLogs).await;
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_deactivates() {
        let backend = DummyBackend::new();
        let handle = spawn_daemon(Box::new(backend.clone()), LogBuffer::default());
        let mut events = handle.subscribe();
        handle.request(OWNER, DaemonRequest::Activate(config())).await;
        next(&mut events).await;

        handle.shutdown().await;

        assert_eq!(backend.active_peer(), None);
        assert_eq!(next(&mut events).await, DaemonReply::Disconnected);
    }
}
