//! Connection Controller
//!
//! The single authoritative state machine for the VPN session. Every
//! activate, deactivate and switch request goes through here, as does every
//! daemon notification, timer expiration and probe reply.
//!
//! # States
//!
//! ```text
//! Initializing ─▶ Off ─activate─▶ Connecting ─connected─▶ Confirming ─status─▶ On
//!                  ▲                                                           │
//!                  └──── disconnected ◀── Disconnecting ◀──── deactivate ──────┤
//!                                                                              │
//!            On ─change_server─▶ Switching / SilentSwitching ─connected─▶ On  │
//!            On ─captive portal─▶ CaptivePortal ─portal gone─▶ Connecting ◀───┘
//! ```
//!
//! A newer request supersedes an in-flight one: outstanding timers are
//! invalidated by bumping a generation counter, and expectations are
//! replaced. Requests that arrive while a deactivation is pending are held
//! (last writer wins) and applied once the daemon acknowledges.

use crate::allowed_ips::compute_allowed_ips;
use crate::config::{ConfigError, IpRange, TunnelConfig};
use crate::health::{HealthConfig, HealthMonitor, Stability};
use crate::keys::{short_key, PrivateKey};
use crate::latency::ServerLatencyRegistry;
use crate::probe::{ProbePurpose, ProbeReply, ProbeSender};
use crate::protocol::{DaemonReply, DaemonRequest, StatusReply};
use crate::server::{Server, ServerData};
use crate::transport::{DaemonEvent, DaemonLink, TransportError};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

/// Controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Waiting for the first status from the daemon
    Initializing,
    Off,
    /// Activation sent, waiting for the handshake
    Connecting,
    /// Handshake seen, waiting for the daemon to confirm the tunnel
    Confirming,
    On,
    /// Moving to another server, user-visible
    Switching,
    /// Moving to another server without notifying the user
    SilentSwitching,
    Disconnecting,
    /// Tunnel taken down so a captive portal can be reached
    CaptivePortal,
}

impl ConnectionState {
    /// Check if traffic is flowing through the tunnel
    pub fn is_on(&self) -> bool {
        matches!(self, ConnectionState::On)
    }

    /// Check if a tunnel is up or being brought up
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Confirming
                | ConnectionState::On
                | ConnectionState::Switching
                | ConnectionState::SilentSwitching
        )
    }
}

/// Which timer fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Handshake,
    Confirm,
    Disconnect,
}

/// Identifies one armed timer; stale generations are ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Arms one-shot timers that come back as events
pub trait Scheduler: Send {
    fn schedule(&mut self, delay: Duration, token: TimerToken);
}

/// The device side of the tunnel
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub private_key: PrivateKey,
    /// Tunnel address, IPv4 (CIDR)
    pub ipv4_address: String,
    /// Tunnel address, IPv6 (CIDR), empty when unassigned
    pub ipv6_address: String,
}

/// Controller tuning
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub handshake_timeout: Duration,
    pub confirm_timeout: Duration,
    pub disconnect_timeout: Duration,
    /// How long an unresponsive server is excluded
    pub server_cooldown_secs: u64,
    pub ipv6_enabled: bool,
    /// Ranges kept off the tunnel on top of local networks
    pub excluded_ranges: Vec<IpRange>,
    pub dns_server: Option<String>,
    /// Move to another server when the connection becomes unstable
    pub switch_on_unstable: bool,
    pub health: HealthConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            confirm_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(10),
            server_cooldown_secs: 300,
            ipv6_enabled: true,
            excluded_ranges: Vec::new(),
            dns_server: None,
            switch_on_unstable: true,
            health: HealthConfig::default(),
        }
    }
}

/// Observable controller output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    StateChanged(ConnectionState),
    /// The attempted server never completed its handshake
    HandshakeFailed { public_key: String },
    ReadyToQuit,
    ReadyToServerUnavailable { ping_received: bool },
    ReadyToBackendFailure,
    ActivationBlockedForCaptivePortal,
    StabilityChanged(Stability),
    StatusUpdated { tx_bytes: u64, rx_bytes: u64 },
}

/// What the controller is waiting for from the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
enum Expectation {
    None,
    Handshake { public_key: String },
    Confirm { public_key: String },
    Disconnect,
}

/// What to do once the tunnel is down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum NextStep {
    #[default]
    None,
    Quit,
    ServerUnavailable,
}

/// Controller errors
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("No usable server available")]
    NoServerAvailable,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// VPN session state machine
pub struct ConnectionController {
    config: ControllerConfig,
    device: DeviceIdentity,
    state: ConnectionState,
    link: Box<dyn DaemonLink>,
    scheduler: Box<dyn Scheduler>,
    prober: Box<dyn ProbeSender>,
    health: HealthMonitor,
    registry: ServerLatencyRegistry,
    /// Current city selection
    server_data: Option<ServerData>,
    /// Exit server of the current or last attempt
    current_server: Option<Server>,
    /// Activation requested while the previous session winds down
    pending_activation: Option<ServerData>,
    next_step: NextStep,
    expectation: Expectation,
    generation: u64,
    portal_detected: bool,
    awaiting_initial_status: bool,
    connected_since: Option<u64>,
    last_status: Option<StatusReply>,
    pending_logs: VecDeque<oneshot::Sender<String>>,
    finished: bool,
    events: broadcast::Sender<ControllerEvent>,
    rng: StdRng,
}

impl ConnectionController {
    /// Create a controller in `Initializing`
    pub fn new(
        config: ControllerConfig,
        device: DeviceIdentity,
        registry: ServerLatencyRegistry,
        link: Box<dyn DaemonLink>,
        scheduler: Box<dyn Scheduler>,
        prober: Box<dyn ProbeSender>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let health = HealthMonitor::new(config.health.clone());

        Self {
            config,
            device,
            state: ConnectionState::Initializing,
            link,
            scheduler,
            prober,
            health,
            registry,
            server_data: None,
            current_server: None,
            pending_activation: None,
            next_step: NextStep::None,
            expectation: Expectation::None,
            generation: 0,
            portal_detected: false,
            awaiting_initial_status: false,
            connected_since: None,
            last_status: None,
            pending_logs: VecDeque::new(),
            finished: false,
            events,
            rng: StdRng::from_entropy(),
        }
    }

    /// Subscribe to controller events
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn server_data(&self) -> Option<&ServerData> {
        self.server_data.as_ref()
    }

    pub fn current_server(&self) -> Option<&Server> {
        self.current_server.as_ref()
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn registry(&self) -> &ServerLatencyRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ServerLatencyRegistry {
        &mut self.registry
    }

    /// Activation time of the current tunnel in epoch seconds
    pub fn connected_since(&self) -> Option<u64> {
        self.connected_since
    }

    pub fn last_status(&self) -> Option<&StatusReply> {
        self.last_status.as_ref()
    }

    /// Has quitting completed?
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    // ------------------------------------------------------------------
    // Requests from the UI
    // ------------------------------------------------------------------

    /// Bring a tunnel up to a server of `server_data`
    pub fn activate(&mut self, server_data: ServerData) -> Result<(), ControllerError> {
        match self.state {
            ConnectionState::Off => {}
            ConnectionState::Initializing | ConnectionState::Disconnecting => {
                debug!("Activation deferred while {:?}", self.state);
                self.pending_activation = Some(server_data);
                return Ok(());
            }
            state => {
                return Err(ControllerError::InvalidState { operation: "activate", state });
            }
        }

        if self.portal_detected {
            info!("Activation blocked by captive portal");
            self.portal_detected = false;
            self.emit(ControllerEvent::ActivationBlockedForCaptivePortal);
            return Ok(());
        }

        self.start_activation(server_data, ConnectionState::Connecting)
    }

    /// Take the tunnel down. Returns `false` when there was nothing to do.
    pub fn deactivate(&mut self) -> bool {
        self.pending_activation = None;

        match self.state {
            ConnectionState::Off | ConnectionState::Initializing => {
                debug!("Deactivate ignored while {:?}", self.state);
                false
            }
            ConnectionState::Disconnecting => false,
            ConnectionState::CaptivePortal => {
                if self.expectation == Expectation::Disconnect {
                    self.set_state(ConnectionState::Disconnecting);
                } else {
                    self.finish_off();
                }
                true
            }
            _ => {
                self.begin_disconnect(ConnectionState::Disconnecting);
                true
            }
        }
    }

    /// Move to another server, re-activating in place
    pub fn change_server(&mut self, server_data: ServerData, silent: bool) -> Result<(), ControllerError> {
        match self.state {
            ConnectionState::Off
            | ConnectionState::Initializing
            | ConnectionState::CaptivePortal => {
                debug!("Server selection stored for next activation");
                self.server_data = Some(server_data);
                Ok(())
            }
            ConnectionState::Disconnecting => {
                if self.pending_activation.is_some() {
                    self.pending_activation = Some(server_data);
                } else {
                    self.server_data = Some(server_data);
                }
                Ok(())
            }
            _ => {
                let target = if silent {
                    ConnectionState::SilentSwitching
                } else {
                    ConnectionState::Switching
                };
                info!("Switching to {} ({:?})", server_data.city_name, target);
                self.stop_health();
                self.start_activation(server_data, target)
            }
        }
    }

    /// Put the current server on cooldown and move to another one of the
    /// same city without notifying the user.
    ///
    /// Falls through to "server unavailable" when no alternative is left.
    pub fn silent_switch(&mut self) -> bool {
        if self.state != ConnectionState::On {
            return false;
        }
        let (Some(server_data), Some(current)) = (self.server_data.clone(), self.current_server.clone()) else {
            return false;
        };
        if server_data.servers.len() < 2 {
            debug!("No alternative server in {}", server_data.city_name);
            return false;
        }

        self.registry.set_cooldown(&current.public_key, self.config.server_cooldown_secs);

        if server_data.available(&self.registry).is_empty() {
            self.server_unavailable();
            return false;
        }

        self.change_server(server_data, true).is_ok()
    }

    /// Deactivate if needed, then report readiness to exit
    pub fn quit(&mut self) {
        info!("Quit requested");
        self.pending_activation = None;

        match self.state {
            ConnectionState::Off | ConnectionState::Initializing => self.ready_to_quit(),
            ConnectionState::CaptivePortal if self.expectation != Expectation::Disconnect => {
                self.finish_off();
                self.ready_to_quit();
            }
            ConnectionState::Disconnecting | ConnectionState::CaptivePortal => {
                self.next_step = NextStep::Quit;
            }
            _ => {
                self.next_step = NextStep::Quit;
                self.begin_disconnect(ConnectionState::Disconnecting);
            }
        }
    }

    pub fn captive_portal_detected(&mut self) {
        match self.state {
            ConnectionState::On => {
                info!("Captive portal detected, suspending tunnel");
                self.portal_detected = true;
                self.begin_disconnect(ConnectionState::CaptivePortal);
            }
            ConnectionState::Off => {
                self.portal_detected = true;
            }
            state => debug!("Captive portal ignored while {:?}", state),
        }
    }

    pub fn captive_portal_gone(&mut self) {
        self.portal_detected = false;

        // With a deactivation still pending, completion picks this up
        if self.state != ConnectionState::CaptivePortal || self.expectation == Expectation::Disconnect {
            return;
        }

        info!("Captive portal gone, reconnecting");
        self.reactivate_current();
    }

    /// Ask the daemon for its logs; an empty string when unreachable
    pub fn fetch_logs(&mut self, reply: oneshot::Sender<String>) {
        match self.link.send(DaemonRequest::Logs) {
            Ok(()) => self.pending_logs.push_back(reply),
            Err(e) => {
                debug!("Cannot fetch daemon logs: {}", e);
                let _ = reply.send(String::new());
            }
        }
    }

    pub fn clean_logs(&mut self) {
        if let Err(e) = self.link.send(DaemonRequest::CleanLogs) {
            debug!("Cannot clean daemon logs: {}", e);
        }
    }

    /// Refresh transfer counters while connected
    pub fn request_status(&mut self) {
        if self.state != ConnectionState::On || self.expectation != Expectation::None {
            return;
        }
        if let Err(e) = self.link.send(DaemonRequest::Status) {
            debug!("Status request failed: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Daemon, timer and probe input
    // ------------------------------------------------------------------

    pub fn handle_daemon_event(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::Ready => self.on_transport_ready(),
            DaemonEvent::Lost => self.on_transport_lost(),
            DaemonEvent::Message(DaemonReply::Connected { pubkey }) => self.on_connected(pubkey),
            DaemonEvent::Message(DaemonReply::Disconnected) => self.on_disconnected(),
            DaemonEvent::Message(DaemonReply::Status(status)) => self.on_status(status),
            DaemonEvent::Message(DaemonReply::Logs { logs }) => {
                if let Some(reply) = self.pending_logs.pop_front() {
                    let _ = reply.send(logs);
                }
            }
            DaemonEvent::Message(DaemonReply::BackendFailure) => {
                error!("Daemon reported a backend failure");
                // A failed teardown is still followed by `disconnected`
                if self.expectation != Expectation::Disconnect {
                    self.finish_off();
                }
                self.emit(ControllerEvent::ReadyToBackendFailure);
            }
        }
    }

    pub fn on_timer(&mut self, token: TimerToken) {
        if token.generation != self.generation {
            debug!("Ignoring stale {:?} timer", token.kind);
            return;
        }

        match (token.kind, &self.expectation) {
            (TimerKind::Handshake, Expectation::Handshake { public_key })
            | (TimerKind::Confirm, Expectation::Confirm { public_key }) => {
                let public_key = public_key.clone();
                warn!("Handshake with {} timed out", short_key(&public_key));
                self.handshake_failed(public_key);
            }
            (TimerKind::Disconnect, Expectation::Disconnect) => {
                warn!("Daemon did not acknowledge deactivation, assuming tunnel down");
                self.complete_disconnect();
            }
            (kind, expectation) => debug!("{:?} timer fired while expecting {:?}", kind, expectation),
        }
    }

    /// Send the next health probe if connected
    pub fn probe_tick(&mut self, now: Instant) {
        if self.state != ConnectionState::On {
            return;
        }
        let Some((target, sequence)) = self.health.next_probe(now) else {
            return;
        };
        if let Err(e) = self.prober.send_probe(target, sequence) {
            debug!("Health probe failed: {}", e);
            self.health.on_send_failure();
        }
    }

    pub fn on_probe_reply(&mut self, reply: &ProbeReply) {
        if reply.purpose != ProbePurpose::Health || self.health.target() != Some(reply.from) {
            return;
        }
        self.health.on_ack(reply.sequence, reply.received_at);
    }

    /// Classify stability and react to the monitor entering `Unstable`
    pub fn health_checkup(&mut self, now: Instant) {
        let Some(stability) = self.health.checkup(now) else {
            return;
        };
        self.emit(ControllerEvent::StabilityChanged(stability));

        if stability == Stability::Unstable
            && self.config.switch_on_unstable
            && self.state == ConnectionState::On
        {
            info!("Connection unstable, trying another server");
            self.silent_switch();
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn on_transport_ready(&mut self) {
        self.awaiting_initial_status = true;
        if let Err(e) = self.link.send(DaemonRequest::Status) {
            warn!("Initial status request failed: {}", e);
            self.awaiting_initial_status = false;
        }
    }

    fn on_transport_lost(&mut self) {
        self.awaiting_initial_status = false;
        for reply in self.pending_logs.drain(..) {
            let _ = reply.send(String::new());
        }

        match self.state {
            ConnectionState::Initializing => {
                warn!("Daemon unreachable");
                self.set_state(ConnectionState::Off);
                if self.pending_activation.take().is_some() {
                    self.emit(ControllerEvent::ReadyToBackendFailure);
                }
            }
            ConnectionState::Off => {}
            _ if self.expectation == Expectation::Disconnect => self.complete_disconnect(),
            _ => {
                warn!("Daemon connection lost while {:?}", self.state);
                self.finish_off();
                self.emit(ControllerEvent::ReadyToBackendFailure);
            }
        }
    }

    fn on_connected(&mut self, pubkey: String) {
        match &self.expectation {
            Expectation::Handshake { public_key } if *public_key == pubkey => {
                info!("Handshake completed with {}", short_key(&pubkey));
                self.cancel_timers();
                self.expectation = Expectation::Confirm { public_key: pubkey };
                if self.state == ConnectionState::Connecting {
                    self.set_state(ConnectionState::Confirming);
                }

                if let Err(e) = self.link.send(DaemonRequest::Status) {
                    warn!("Cannot confirm tunnel: {}", e);
                    self.finish_off();
                    self.emit(ControllerEvent::ReadyToBackendFailure);
                    return;
                }
                self.arm(TimerKind::Confirm, self.config.confirm_timeout);
            }
            Expectation::Handshake { .. } => {
                warn!("Ignoring handshake from unexpected server {}", short_key(&pubkey));
            }
            _ => debug!("Ignoring connected notification while {:?}", self.state),
        }
    }

    fn on_disconnected(&mut self) {
        match self.expectation {
            Expectation::Disconnect => self.complete_disconnect(),
            Expectation::Handshake { .. } | Expectation::Confirm { .. } => {
                warn!("Daemon rejected the activation");
                self.finish_off();
            }
            Expectation::None => match self.state {
                ConnectionState::Off
                | ConnectionState::Initializing
                | ConnectionState::CaptivePortal => {
                    debug!("Ignoring disconnected notification while {:?}", self.state);
                }
                _ => {
                    warn!("Tunnel dropped by the daemon");
                    self.finish_off();
                }
            },
        }
    }

    fn on_status(&mut self, status: StatusReply) {
        if self.awaiting_initial_status {
            self.awaiting_initial_status = false;
            self.on_initial_status(status);
            return;
        }

        if let Expectation::Confirm { public_key } = &self.expectation {
            if status.connected {
                self.confirm_connected(status);
            } else {
                let public_key = public_key.clone();
                warn!("Daemon reports no tunnel after handshake");
                self.handshake_failed(public_key);
            }
            return;
        }

        self.emit(ControllerEvent::StatusUpdated {
            tx_bytes: status.tx_bytes,
            rx_bytes: status.rx_bytes,
        });
        self.last_status = Some(status);
    }

    fn on_initial_status(&mut self, status: StatusReply) {
        let restorable = matches!(self.state, ConnectionState::Initializing | ConnectionState::Off);

        if status.connected && restorable {
            info!("Daemon already has a tunnel up, restoring session");
            self.connected_since = Some(status.date);
            if let Ok(target) = status.server_ipv4_gateway.parse::<IpAddr>() {
                self.health.start(target, Instant::now());
            }
            self.last_status = Some(status);
            self.set_state(ConnectionState::On);
        } else if self.state == ConnectionState::Initializing {
            self.set_state(ConnectionState::Off);
        }

        let Some(server_data) = self.pending_activation.take() else {
            return;
        };
        let result = match self.state {
            ConnectionState::Off => self.activate(server_data),
            ConnectionState::On => self.change_server(server_data, false),
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!("Deferred activation failed: {}", e);
        }
    }

    fn confirm_connected(&mut self, status: StatusReply) {
        self.cancel_timers();
        self.expectation = Expectation::None;

        self.connected_since = Some(if status.date > 0 { status.date } else { self.registry.now() });

        let target = status.server_ipv4_gateway.parse::<IpAddr>().ok().or_else(|| {
            self.current_server.as_ref().and_then(|s| s.ipv4_gateway.parse().ok())
        });
        if let Some(target) = target {
            self.health.start(target, Instant::now());
        }

        self.last_status = Some(status);
        self.set_state(ConnectionState::On);
    }

    fn handshake_failed(&mut self, public_key: String) {
        self.registry.set_cooldown(&public_key, self.config.server_cooldown_secs);
        self.emit(ControllerEvent::HandshakeFailed { public_key });
        self.begin_disconnect(ConnectionState::Disconnecting);
    }

    fn server_unavailable(&mut self) {
        warn!("Every server in the selected city is unavailable");
        self.next_step = NextStep::ServerUnavailable;
        self.begin_disconnect(ConnectionState::Disconnecting);
    }

    fn start_activation(&mut self, server_data: ServerData, during: ConnectionState) -> Result<(), ControllerError> {
        let Some(server) = server_data.choose(&self.registry, &mut self.rng).cloned() else {
            warn!("No usable server in {}", server_data.city_name);
            self.server_data = Some(server_data);
            self.finish_off();
            self.emit(ControllerEvent::ReadyToServerUnavailable { ping_received: false });
            return Err(ControllerError::NoServerAvailable);
        };

        let config = match self.build_config(&server) {
            Ok(config) => config,
            Err(e) => {
                error!("Cannot build tunnel config for {}: {}", server.hostname, e);
                self.finish_off();
                return Err(e.into());
            }
        };

        self.cancel_timers();
        if let Err(e) = self.link.send(DaemonRequest::Activate(config)) {
            warn!("Daemon unreachable, activation failed: {}", e);
            self.finish_off();
            self.emit(ControllerEvent::ReadyToBackendFailure);
            return Err(e.into());
        }

        info!("Activating {} ({})", server.hostname, short_key(&server.public_key));
        self.expectation = Expectation::Handshake { public_key: server.public_key.clone() };
        self.server_data = Some(server_data);
        self.current_server = Some(server);
        self.set_state(during);
        self.arm(TimerKind::Handshake, self.config.handshake_timeout);
        Ok(())
    }

    /// Bring the previous tunnel back, on the same server while it is usable
    fn reactivate_current(&mut self) {
        let Some(server_data) = self.server_data.clone() else {
            self.finish_off();
            return;
        };

        let pinned = match &self.current_server {
            Some(server) => server_data.clone().with_exit_server(&server.public_key),
            None => server_data.clone(),
        };
        if let Err(e) = self.start_activation(pinned, ConnectionState::Connecting) {
            warn!("Reconnect failed: {}", e);
        }

        // The pin only holds for this one reconnect
        if let Some(data) = self.server_data.as_mut() {
            data.exit_server = server_data.exit_server;
        }
    }

    fn build_config(&self, server: &Server) -> Result<TunnelConfig, ConfigError> {
        let gateway_v4: Ipv4Addr = server.ipv4_gateway.parse()
            .map_err(|_| ConfigError::InvalidAddress(server.ipv4_gateway.clone()))?;

        let gateway_v6: Option<Ipv6Addr> =
            if self.config.ipv6_enabled && !self.device.ipv6_address.is_empty() {
                server.ipv6_gateway.parse().ok()
            } else {
                None
            };

        let config = TunnelConfig {
            private_key: self.device.private_key.to_base64(),
            device_ipv4_address: self.device.ipv4_address.clone(),
            device_ipv6_address: if gateway_v6.is_some() {
                self.device.ipv6_address.clone()
            } else {
                String::new()
            },
            server_ipv4_gateway: server.ipv4_gateway.clone(),
            server_ipv6_gateway: gateway_v6.map(|g| g.to_string()).unwrap_or_default(),
            server_public_key: server.public_key.clone(),
            server_ipv4_addr_in: server.ipv4_addr_in.clone(),
            server_ipv6_addr_in: server.ipv6_addr_in.clone(),
            server_port: server.port,
            ipv6_enabled: gateway_v6.is_some(),
            allowed_ip_address_ranges: compute_allowed_ips(
                gateway_v4,
                gateway_v6,
                &self.config.excluded_ranges,
            ),
            dns_server: self.config.dns_server.clone(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Send `deactivate` and wait in `during` for the acknowledgement
    fn begin_disconnect(&mut self, during: ConnectionState) {
        self.cancel_timers();
        self.stop_health();
        self.set_state(during);

        match self.link.send(DaemonRequest::Deactivate) {
            Ok(()) => {
                self.expectation = Expectation::Disconnect;
                self.arm(TimerKind::Disconnect, self.config.disconnect_timeout);
            }
            Err(e) => {
                warn!("Daemon unreachable while deactivating: {}", e);
                self.complete_disconnect();
            }
        }
    }

    /// The tunnel is down (acknowledged or assumed)
    fn complete_disconnect(&mut self) {
        self.cancel_timers();
        self.expectation = Expectation::None;
        self.stop_health();
        self.connected_since = None;

        match std::mem::take(&mut self.next_step) {
            NextStep::Quit => {
                self.set_state(ConnectionState::Off);
                self.ready_to_quit();
                return;
            }
            NextStep::ServerUnavailable => {
                let ping_received = self.health.ping_received();
                self.set_state(ConnectionState::Off);
                self.emit(ControllerEvent::ReadyToServerUnavailable { ping_received });
                return;
            }
            NextStep::None => {}
        }

        if self.state == ConnectionState::CaptivePortal {
            if self.portal_detected {
                info!("Tunnel down, waiting for the captive portal to clear");
            } else {
                self.reactivate_current();
            }
            return;
        }

        self.set_state(ConnectionState::Off);

        if let Some(server_data) = self.pending_activation.take() {
            if let Err(e) = self.activate(server_data) {
                warn!("Deferred activation failed: {}", e);
            }
        }
    }

    /// Drop every expectation and land in `Off` without talking to the daemon
    fn finish_off(&mut self) {
        self.cancel_timers();
        self.expectation = Expectation::None;
        self.stop_health();
        self.connected_since = None;
        self.set_state(ConnectionState::Off);
    }

    fn ready_to_quit(&mut self) {
        self.finished = true;
        self.emit(ControllerEvent::ReadyToQuit);
    }

    fn stop_health(&mut self) {
        if let Some(stability) = self.health.stop(Instant::now()) {
            self.emit(ControllerEvent::StabilityChanged(stability));
        }
    }

    fn cancel_timers(&mut self) {
        self.generation += 1;
    }

    fn arm(&mut self, kind: TimerKind, delay: Duration) {
        let token = TimerToken { kind, generation: self.generation };
        self.scheduler.schedule(delay, token);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!("Connection state: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.emit(ControllerEvent::StateChanged(state));
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<ControllerEvent> {
        self.events.clone()
    }

    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use crate::probe::ProbeError;
    use crate::server::ServerCity;
    use rand::Rng;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub(crate) struct FakeLink {
        pub(crate) sent: Arc<Mutex<Vec<DaemonRequest>>>,
        pub(crate) down: Arc<AtomicBool>,
    }

    impl FakeLink {
        pub(crate) fn take(&self) -> Vec<DaemonRequest> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl DaemonLink for FakeLink {
        fn send(&mut self, request: DaemonRequest) -> Result<(), TransportError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            self.sent.lock().unwrap().push(request);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.down.load(Ordering::SeqCst)
        }
    }

    #[derive(Clone, Default)]
    struct FakeScheduler {
        armed: Arc<Mutex<Vec<TimerToken>>>,
    }

    impl FakeScheduler {
        fn last(&self, kind: TimerKind) -> TimerToken {
            *self.armed.lock().unwrap().iter().rev().find(|t| t.kind == kind).unwrap()
        }
    }

    impl Scheduler for FakeScheduler {
        fn schedule(&mut self, _delay: Duration, token: TimerToken) {
            self.armed.lock().unwrap().push(token);
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeProber {
        pub(crate) sent: Arc<Mutex<Vec<(IpAddr, u16)>>>,
    }

    impl ProbeSender for FakeProber {
        fn send_probe(&mut self, target: IpAddr, sequence: u16) -> Result<(), ProbeError> {
            self.sent.lock().unwrap().push((target, sequence));
            Ok(())
        }
    }

    struct Harness {
        controller: ConnectionController,
        link: FakeLink,
        scheduler: FakeScheduler,
        prober: FakeProber,
        events: broadcast::Receiver<ControllerEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let link = FakeLink::default();
            let scheduler = FakeScheduler::default();
            let prober = FakeProber::default();
            let device = DeviceIdentity {
                private_key: PrivateKey::generate(),
                ipv4_address: "10.64.12.7/32".to_string(),
                ipv6_address: "fc00:bbbb:bbbb:bb01::c:7/128".to_string(),
            };
            let controller = ConnectionController::new(
                ControllerConfig::default(),
                device,
                ServerLatencyRegistry::new(),
                Box::new(link.clone()),
                Box::new(scheduler.clone()),
                Box::new(prober.clone()),
            );
            let events = controller.subscribe();
            Self { controller, link, scheduler, prober, events }
        }

        /// Daemon reachable, no tunnel up
        fn off() -> Self {
            let mut h = Self::new();
            h.daemon(DaemonEvent::Ready);
            h.status(false);
            h.link.take();
            h.drain();
            h
        }

        /// Connected to a server of `data`
        fn on(data: &ServerData) -> Self {
            let mut h = Self::off();
            h.controller.activate(data.clone()).unwrap();
            h.complete_handshake();
            h.link.take();
            h.drain();
            h
        }

        fn daemon(&mut self, event: DaemonEvent) {
            self.controller.handle_daemon_event(event);
        }

        fn reply(&mut self, reply: DaemonReply) {
            self.daemon(DaemonEvent::Message(reply));
        }

        fn status(&mut self, connected: bool) {
            self.reply(DaemonReply::Status(StatusReply {
                connected,
                server_ipv4_gateway: if connected { "10.64.0.1".to_string() } else { String::new() },
                date: if connected { 1_700_000_000 } else { 0 },
                ..Default::default()
            }));
        }

        fn current_key(&self) -> String {
            self.controller.current_server().unwrap().public_key.clone()
        }

        fn complete_handshake(&mut self) {
            let pubkey = self.current_key();
            self.reply(DaemonReply::Connected { pubkey });
            self.status(true);
        }

        fn drain(&mut self) -> Vec<ControllerEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn states(&mut self) -> Vec<ConnectionState> {
            self.drain()
                .into_iter()
                .filter_map(|e| match e {
                    ControllerEvent::StateChanged(s) => Some(s),
                    _ => None,
                })
                .collect()
        }
    }

    /// A German city with `servers` real-key servers behind gateway 10.64.0.1
    pub(crate) fn city_entry(name: &str, servers: usize) -> ServerCity {
        let servers = (0..servers)
            .map(|i| Server {
                hostname: format!("{}-wg-{:03}", name, i),
                public_key: KeyPair::generate().public.to_base64(),
                ipv4_addr_in: format!("185.65.135.{}", i + 1),
                ipv6_addr_in: String::new(),
                ipv4_gateway: "10.64.0.1".to_string(),
                ipv6_gateway: "fc00:bbbb:bbbb:bb01::1".to_string(),
                port: 51820,
                weight: 1,
            })
            .collect();
        ServerCity {
            name: name.to_string(),
            code: name.to_lowercase(),
            country_code: "de".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            servers,
        }
    }

    fn city(name: &str, servers: usize) -> ServerData {
        ServerData::from_city(&city_entry(name, servers))
    }

    fn activated_key(request: &DaemonRequest) -> String {
        match request {
            DaemonRequest::Activate(config) => config.server_public_key.clone(),
            other => panic!("expected activate, got {:?}", other),
        }
    }

    #[test]
    fn test_initial_status_off() {
        let mut h = Harness::new();
        assert_eq!(h.controller.state(), ConnectionState::Initializing);

        h.daemon(DaemonEvent::Ready);
        assert_eq!(h.link.take(), vec![DaemonRequest::Status]);

        h.status(false);
        assert_eq!(h.controller.state(), ConnectionState::Off);
    }

    #[test]
    fn test_initial_status_restores_tunnel() {
        let mut h = Harness::new();

        h.daemon(DaemonEvent::Ready);
        h.status(true);

        assert_eq!(h.controller.state(), ConnectionState::On);
        assert_eq!(h.controller.connected_since(), Some(1_700_000_000));
        assert!(h.controller.health().is_armed());
    }

    #[test]
    fn test_activation_deferred_until_initialized() {
        let data = city("Berlin", 1);
        let mut h = Harness::new();

        h.controller.activate(data.clone()).unwrap();
        assert!(h.link.take().is_empty());

        h.daemon(DaemonEvent::Ready);
        h.status(false);

        let sent = h.link.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(activated_key(&sent[1]), data.servers[0].public_key);
        assert_eq!(h.controller.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_daemon_unreachable_at_startup() {
        let data = city("Berlin", 1);
        let mut h = Harness::new();
        h.controller.activate(data).unwrap();

        h.daemon(DaemonEvent::Lost);

        assert_eq!(h.controller.state(), ConnectionState::Off);
        assert!(h.drain().contains(&ControllerEvent::ReadyToBackendFailure));
    }

    #[test]
    fn test_connect_then_disconnect() {
        let data = city("Berlin", 1);
        let mut h = Harness::off();

        h.controller.activate(data.clone()).unwrap();
        let sent = h.link.take();
        assert_eq!(activated_key(&sent[0]), data.servers[0].public_key);
        assert_eq!(h.states(), vec![ConnectionState::Connecting]);

        h.reply(DaemonReply::Connected { pubkey: data.servers[0].public_key.clone() });
        assert_eq!(h.link.take(), vec![DaemonRequest::Status]);
        h.status(true);
        assert_eq!(h.states(), vec![ConnectionState::Confirming, ConnectionState::On]);
        assert!(h.controller.health().is_armed());

        assert!(h.controller.deactivate());
        assert_eq!(h.link.take(), vec![DaemonRequest::Deactivate]);
        h.reply(DaemonReply::Disconnected);

        assert_eq!(h.states(), vec![ConnectionState::Disconnecting, ConnectionState::Off]);
        assert!(!h.controller.health().is_armed());
    }

    #[test]
    fn test_activate_config_contents() {
        let data = city("Berlin", 1);
        let mut h = Harness::off();

        h.controller.activate(data).unwrap();
        let DaemonRequest::Activate(config) = h.link.take().remove(0) else {
            panic!("expected activate");
        };

        assert!(config.validate().is_ok());
        assert!(config.ipv6_enabled);
        assert_eq!(config.allowed_ip_address_ranges[0].to_string(), "10.64.0.1/32");
    }

    #[test]
    fn test_deactivate_when_off_is_noop() {
        let mut h = Harness::off();

        assert!(!h.controller.deactivate());

        assert!(h.link.take().is_empty());
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_activate_while_on_is_rejected() {
        let data = city("Berlin", 1);
        let mut h = Harness::on(&data);

        assert!(matches!(
            h.controller.activate(data),
            Err(ControllerError::InvalidState { state: ConnectionState::On, .. })
        ));
    }

    #[test]
    fn test_connected_for_other_server_ignored() {
        let data = city("Berlin", 1);
        let mut h = Harness::off();
        h.controller.activate(data).unwrap();
        h.link.take();
        h.drain();

        h.reply(DaemonReply::Connected { pubkey: KeyPair::generate().public.to_base64() });

        assert_eq!(h.controller.state(), ConnectionState::Connecting);
        assert!(h.link.take().is_empty());
    }

    #[test]
    fn test_handshake_timeout() {
        let data = city("Berlin", 1);
        let mut h = Harness::off();
        h.controller.activate(data.clone()).unwrap();
        h.link.take();
        h.drain();

        let token = h.scheduler.last(TimerKind::Handshake);
        h.controller.on_timer(token);

        let key = data.servers[0].public_key.clone();
        let events = h.drain();
        assert!(events.contains(&ControllerEvent::HandshakeFailed { public_key: key.clone() }));
        assert!(events.contains(&ControllerEvent::StateChanged(ConnectionState::Disconnecting)));
        assert!(h.controller.registry().is_cooling_down(&key));
        assert_eq!(h.link.take(), vec![DaemonRequest::Deactivate]);

        h.reply(DaemonReply::Disconnected);
        assert_eq!(h.controller.state(), ConnectionState::Off);
    }

    #[test]
    fn test_stale_timer_ignored() {
        let data = city("Berlin", 1);
        let mut h = Harness::off();
        h.controller.activate(data).unwrap();
        let token = h.scheduler.last(TimerKind::Handshake);

        h.complete_handshake();
        h.drain();
        h.controller.on_timer(token);

        assert_eq!(h.controller.state(), ConnectionState::On);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_daemon_unreachable_on_activate() {
        let data = city("Berlin", 1);
        let mut h = Harness::off();
        h.link.down.store(true, Ordering::SeqCst);

        assert!(matches!(h.controller.activate(data), Err(ControllerError::Transport(_))));

        assert_eq!(h.controller.state(), ConnectionState::Off);
        assert_eq!(h.drain(), vec![ControllerEvent::ReadyToBackendFailure]);
    }

    #[test]
    fn test_daemon_rejects_activation() {
        let data = city("Berlin", 1);
        let mut h = Harness::off();
        h.controller.activate(data).unwrap();
        h.drain();

        h.reply(DaemonReply::Disconnected);

        assert_eq!(h.states(), vec![ConnectionState::Off]);
    }

    #[test]
    fn test_latest_activation_wins_while_disconnecting() {
        let berlin = city("Berlin", 1);
        let paris = city("Paris", 1);
        let tokyo = city("Tokyo", 1);
        let mut h = Harness::on(&berlin);

        h.controller.deactivate();
        h.controller.activate(paris).unwrap();
        h.controller.activate(tokyo.clone()).unwrap();
        assert_eq!(h.link.take(), vec![DaemonRequest::Deactivate]);

        h.reply(DaemonReply::Disconnected);

        let sent = h.link.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(activated_key(&sent[0]), tokyo.servers[0].public_key);
        assert_eq!(h.controller.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_deactivate_clears_deferred_activation() {
        let berlin = city("Berlin", 1);
        let mut h = Harness::on(&berlin);

        h.controller.deactivate();
        h.controller.activate(city("Paris", 1)).unwrap();
        h.controller.deactivate();
        h.link.take();

        h.reply(DaemonReply::Disconnected);

        assert!(h.link.take().is_empty());
        assert_eq!(h.controller.state(), ConnectionState::Off);
    }

    #[test]
    fn test_deactivate_supersedes_connecting() {
        let data = city("Berlin", 1);
        let mut h = Harness::off();
        h.controller.activate(data.clone()).unwrap();
        let handshake = h.scheduler.last(TimerKind::Handshake);

        h.controller.deactivate();
        h.controller.on_timer(handshake);
        h.reply(DaemonReply::Connected { pubkey: data.servers[0].public_key.clone() });
        h.reply(DaemonReply::Disconnected);

        assert_eq!(
            h.states(),
            vec![ConnectionState::Connecting, ConnectionState::Disconnecting, ConnectionState::Off]
        );
        assert!(!h.controller.registry().is_cooling_down(&data.servers[0].public_key));
    }

    #[test]
    fn test_change_server() {
        let berlin = city("Berlin", 1);
        let paris = city("Paris", 1);
        let mut h = Harness::on(&berlin);

        h.controller.change_server(paris.clone(), false).unwrap();
        let sent = h.link.take();
        assert_eq!(activated_key(&sent[0]), paris.servers[0].public_key);
        assert_eq!(h.controller.state(), ConnectionState::Switching);

        h.complete_handshake();
        assert_eq!(h.states(), vec![ConnectionState::Switching, ConnectionState::On]);
        assert_eq!(h.controller.server_data().unwrap().city_name, "Paris");
    }

    #[test]
    fn test_change_server_when_off_only_stores() {
        let mut h = Harness::off();

        h.controller.change_server(city("Paris", 1), false).unwrap();

        assert!(h.link.take().is_empty());
        assert_eq!(h.controller.state(), ConnectionState::Off);
        assert_eq!(h.controller.server_data().unwrap().city_name, "Paris");
    }

    #[test]
    fn test_unstable_triggers_silent_switch() {
        let data = city("Berlin", 2);
        let mut h = Harness::on(&data);
        let first = h.current_key();

        h.controller.health_checkup(Instant::now() + Duration::from_secs(10));

        let events = h.drain();
        assert!(events.contains(&ControllerEvent::StabilityChanged(Stability::Unstable)));
        assert!(events.contains(&ControllerEvent::StateChanged(ConnectionState::SilentSwitching)));
        assert!(h.controller.registry().is_cooling_down(&first));

        let sent = h.link.take();
        assert_ne!(activated_key(&sent[0]), first);
    }

    #[test]
    fn test_unstable_without_alternatives_reports_unavailable() {
        let data = city("Berlin", 2);
        let mut h = Harness::on(&data);
        let first = h.current_key();
        let other = data.servers.iter().find(|s| s.public_key != first).unwrap();
        h.controller.registry_mut().set_cooldown(&other.public_key, 60);

        h.controller.health_checkup(Instant::now() + Duration::from_secs(10));
        assert_eq!(h.link.take(), vec![DaemonRequest::Deactivate]);

        h.reply(DaemonReply::Disconnected);
        let events = h.drain();
        assert!(events.contains(&ControllerEvent::ReadyToServerUnavailable { ping_received: false }));
        assert_eq!(h.controller.state(), ConnectionState::Off);
    }

    #[test]
    fn test_quit_with_unresponsive_daemon() {
        let data = city("Berlin", 1);
        let mut h = Harness::on(&data);

        h.controller.quit();
        assert_eq!(h.controller.state(), ConnectionState::Disconnecting);
        assert!(!h.controller.is_finished());

        h.controller.on_timer(h.scheduler.last(TimerKind::Disconnect));

        assert!(h.controller.is_finished());
        assert!(h.drain().contains(&ControllerEvent::ReadyToQuit));
        assert_eq!(h.controller.state(), ConnectionState::Off);
    }

    #[test]
    fn test_backend_failure_during_quit_waits_for_disconnected() {
        let data = city("Berlin", 1);
        let mut h = Harness::on(&data);
        h.controller.quit();
        h.drain();

        h.reply(DaemonReply::BackendFailure);
        assert_eq!(h.controller.state(), ConnectionState::Disconnecting);
        assert!(!h.controller.is_finished());

        h.reply(DaemonReply::Disconnected);

        assert!(h.controller.is_finished());
        let events = h.drain();
        assert!(events.contains(&ControllerEvent::ReadyToQuit));
        assert!(events.contains(&ControllerEvent::StateChanged(ConnectionState::Off)));
    }

    #[test]
    fn test_backend_failure_while_on() {
        let data = city("Berlin", 1);
        let mut h = Harness::on(&data);

        h.reply(DaemonReply::BackendFailure);

        assert_eq!(h.controller.state(), ConnectionState::Off);
        assert!(h.drain().contains(&ControllerEvent::ReadyToBackendFailure));
    }

    #[test]
    fn test_quit_when_off() {
        let mut h = Harness::off();

        h.controller.quit();

        assert!(h.link.take().is_empty());
        assert_eq!(h.drain(), vec![ControllerEvent::ReadyToQuit]);
    }

    #[test]
    fn test_transport_lost_while_on() {
        let data = city("Berlin", 1);
        let mut h = Harness::on(&data);

        h.daemon(DaemonEvent::Lost);

        assert_eq!(h.controller.state(), ConnectionState::Off);
        assert!(h.drain().contains(&ControllerEvent::ReadyToBackendFailure));
    }

    #[test]
    fn test_transport_lost_completes_pending_disconnect() {
        let data = city("Berlin", 1);
        let mut h = Harness::on(&data);
        h.controller.deactivate();
        h.drain();

        h.daemon(DaemonEvent::Lost);

        assert_eq!(h.states(), vec![ConnectionState::Off]);
    }

    #[test]
    fn test_captive_portal_cycle() {
        let data = city("Berlin", 1);
        let mut h = Harness::on(&data);

        h.controller.captive_portal_detected();
        assert_eq!(h.controller.state(), ConnectionState::CaptivePortal);
        assert_eq!(h.link.take(), vec![DaemonRequest::Deactivate]);

        h.reply(DaemonReply::Disconnected);
        assert_eq!(h.controller.state(), ConnectionState::CaptivePortal);

        h.controller.captive_portal_gone();
        assert_eq!(h.controller.state(), ConnectionState::Connecting);
        assert!(matches!(h.link.take()[0], DaemonRequest::Activate(_)));
    }

    #[test]
    fn test_captive_portal_reconnects_to_same_server() {
        let data = city("Berlin", 6);
        let mut h = Harness::on(&data);

        for _ in 0..5 {
            let before = h.current_key();
            h.controller.captive_portal_detected();
            h.reply(DaemonReply::Disconnected);
            h.link.take();

            h.controller.captive_portal_gone();
            let sent = h.link.take();
            assert_eq!(activated_key(&sent[0]), before);
            assert_eq!(h.controller.server_data().unwrap().exit_server, None);

            h.complete_handshake();
            assert_eq!(h.controller.state(), ConnectionState::On);
        }
    }

    #[test]
    fn test_captive_portal_blocks_activation_when_off() {
        let data = city("Berlin", 1);
        let mut h = Harness::off();

        h.controller.captive_portal_detected();
        h.controller.activate(data.clone()).unwrap();

        assert_eq!(h.drain(), vec![ControllerEvent::ActivationBlockedForCaptivePortal]);
        assert!(h.link.take().is_empty());

        h.controller.activate(data).unwrap();
        assert_eq!(h.controller.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_probes_feed_health_monitor() {
        let data = city("Berlin", 1);
        let mut h = Harness::on(&data);
        let now = Instant::now();

        h.controller.probe_tick(now);
        let (target, sequence) = h.prober.sent.lock().unwrap()[0];
        assert_eq!(target, "10.64.0.1".parse::<IpAddr>().unwrap());

        h.controller.on_probe_reply(&ProbeReply {
            purpose: ProbePurpose::Health,
            sequence,
            from: target,
            received_at: now + Duration::from_millis(25),
        });

        assert_eq!(h.controller.health().latest_latency(), Some(Duration::from_millis(25)));
    }

    #[test]
    fn test_no_probes_when_off() {
        let mut h = Harness::off();

        h.controller.probe_tick(Instant::now());

        assert!(h.prober.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_logs() {
        let mut h = Harness::off();
        let (tx, rx) = oneshot::channel();

        h.controller.fetch_logs(tx);
        assert_eq!(h.link.take(), vec![DaemonRequest::Logs]);
        h.reply(DaemonReply::Logs { logs: "daemon started".to_string() });

        assert_eq!(rx.await.unwrap(), "daemon started");
    }

    #[tokio::test]
    async fn test_fetch_logs_unreachable() {
        let mut h = Harness::off();
        h.link.down.store(true, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        h.controller.fetch_logs(tx);

        assert_eq!(rx.await.unwrap(), "");
    }

    /// Edges of the state diagram, including failure paths back to Off
    fn allowed(from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (from, to),
            (Initializing, Off)
                | (Initializing, On)
                | (Off, Connecting)
                | (Off, On)
                | (Connecting, Confirming)
                | (Confirming, On)
                | (On, Disconnecting)
                | (On, Switching)
                | (On, SilentSwitching)
                | (On, CaptivePortal)
                | (Switching, On)
                | (SilentSwitching, On)
                | (Switching, SilentSwitching)
                | (SilentSwitching, Switching)
                | (Connecting, Switching)
                | (Confirming, Switching)
                | (Connecting, SilentSwitching)
                | (Confirming, SilentSwitching)
                | (Connecting, Disconnecting)
                | (Confirming, Disconnecting)
                | (Switching, Disconnecting)
                | (SilentSwitching, Disconnecting)
                | (CaptivePortal, Disconnecting)
                | (CaptivePortal, Connecting)
                | (CaptivePortal, Off)
                | (Disconnecting, Off)
                | (Connecting, Off)
                | (Confirming, Off)
                | (On, Off)
                | (Switching, Off)
                | (SilentSwitching, Off)
        )
    }

    #[test]
    fn test_random_sequences_follow_state_edges() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..50 {
            let berlin = city("Berlin", 2);
            let paris = city("Paris", 1);
            let mut h = Harness::off();
            let mut previous = h.controller.state();

            for _ in 0..60 {
                match rng.gen_range(0..10) {
                    0 => { let _ = h.controller.activate(berlin.clone()); }
                    1 => { h.controller.deactivate(); }
                    2 => { let _ = h.controller.change_server(paris.clone(), rng.gen_bool(0.5)); }
                    3 => {
                        if let Some(server) = h.controller.current_server() {
                            let pubkey = server.public_key.clone();
                            h.reply(DaemonReply::Connected { pubkey });
                        }
                    }
                    4 => h.status(rng.gen_bool(0.8)),
                    5 => h.reply(DaemonReply::Disconnected),
                    6 => {
                        let kinds = [TimerKind::Handshake, TimerKind::Confirm, TimerKind::Disconnect];
                        let kind = kinds[rng.gen_range(0..3)];
                        let armed = h.scheduler.armed.lock().unwrap().clone();
                        if let Some(token) = armed.iter().rev().find(|t| t.kind == kind) {
                            h.controller.on_timer(*token);
                        }
                    }
                    7 => h.controller.captive_portal_detected(),
                    8 => h.controller.captive_portal_gone(),
                    _ => h.controller.health_checkup(Instant::now() + Duration::from_secs(rng.gen_range(0..10))),
                }

                for state in h.states() {
                    assert!(allowed(previous, state), "{:?} -> {:?}", previous, state);
                    previous = state;
                }
            }
        }
    }
}
