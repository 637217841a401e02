//! Session runtime
//!
//! Wires the controller, the daemon transport, probe sockets and the latency
//! sweep to one event queue and drives them from a single task.

use crate::controller::{ConnectionController, ConnectionState, ControllerEvent, Scheduler, TimerToken};
use crate::health::Stability;
use crate::latency::{ConnectionScore, ServerLatencyRegistry};
use crate::probe::{ProbeError, ProbePurpose, ProbeReply, ProbeSender};
use crate::server::{CitySelection, ServerCatalog, ServerData};
use crate::settings::{SessionSettings, SettingsError};
use crate::sweep::{LatencySweep, SweepTarget};
use crate::transport::{DaemonEvent, DaemonLink};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How long [`SessionHandle::status`] waits for the daemon's counters
pub const STATUS_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything the event loop reacts to, in receipt order
#[derive(Debug)]
pub enum Event {
    Command(Command),
    Daemon(DaemonEvent),
    Timer(TimerToken),
    Probe(ProbeReply),
}

/// Requests from the UI
#[derive(Debug)]
pub enum Command {
    /// Connect; without a selection the last used city is taken
    Activate { selection: Option<CitySelection> },
    Deactivate,
    ChangeServer { selection: CitySelection, silent: bool },
    SilentSwitch,
    Quit,
    /// Captive portal detected (`true`) or gone (`false`)
    CaptivePortal(bool),
    RequestStatus,
    FetchLogs(oneshot::Sender<String>),
    CleanLogs,
    Snapshot(oneshot::Sender<SessionStatus>),
    CityScores(oneshot::Sender<Vec<CityReport>>),
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub city: Option<String>,
    pub server: Option<String>,
    pub stability: Stability,
    pub latency_ms: Option<f64>,
    pub connected_since: Option<u64>,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

/// Measured quality of one city
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CityReport {
    pub country_code: String,
    pub city_name: String,
    /// Mean latency of measured servers, 0 when unmeasured
    pub latency_ms: u32,
    pub score: ConnectionScore,
}

/// Periodic work of the event loop
#[derive(Debug, Clone)]
pub struct LoopIntervals {
    pub probe: Duration,
    pub checkup: Duration,
    /// Transfer counter refresh while connected
    pub status: Duration,
    /// Sweep pump
    pub sweep: Duration,
}

impl Default for LoopIntervals {
    fn default() -> Self {
        Self {
            probe: Duration::from_secs(1),
            checkup: Duration::from_secs(1),
            status: Duration::from_secs(5),
            sweep: Duration::from_millis(250),
        }
    }
}

/// Arms controller timers on the tokio clock
struct TokioScheduler {
    events: mpsc::UnboundedSender<Event>,
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, delay: Duration, token: TimerToken) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Superseded timers are filtered by generation on arrival
            let _ = events.send(Event::Timer(token));
        });
    }
}

/// Controller plus the catalog-level state around it
pub struct SessionContext {
    controller: ConnectionController,
    catalog: ServerCatalog,
    sweep: LatencySweep,
    sweep_enabled: bool,
    sweep_prober: Box<dyn ProbeSender>,
    last_selection: Option<CitySelection>,
    user_country: Option<String>,
}

impl SessionContext {
    pub fn new(
        controller: ConnectionController,
        catalog: ServerCatalog,
        sweep: LatencySweep,
        sweep_prober: Box<dyn ProbeSender>,
    ) -> Self {
        Self {
            controller,
            catalog,
            sweep,
            sweep_enabled: true,
            sweep_prober,
            last_selection: None,
            user_country: None,
        }
    }

    pub fn with_last_selection(mut self, selection: Option<CitySelection>) -> Self {
        self.last_selection = selection;
        self
    }

    pub fn with_user_country(mut self, country: Option<String>) -> Self {
        self.user_country = country.map(|c| c.to_lowercase());
        self
    }

    pub fn with_sweep_enabled(mut self, enabled: bool) -> Self {
        self.sweep_enabled = enabled;
        self
    }

    pub fn controller(&self) -> &ConnectionController {
        &self.controller
    }

    pub fn sweep(&self) -> &LatencySweep {
        &self.sweep
    }

    pub fn last_selection(&self) -> Option<&CitySelection> {
        self.last_selection.as_ref()
    }

    /// Process one event
    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Command(command) => self.handle_command(command),
            Event::Daemon(event) => self.controller.handle_daemon_event(event),
            Event::Timer(token) => self.controller.on_timer(token),
            Event::Probe(reply) => match reply.purpose {
                ProbePurpose::Health => self.controller.on_probe_reply(&reply),
                ProbePurpose::Sweep => {
                    self.sweep.on_reply(&reply, self.controller.registry_mut());
                }
            },
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Activate { selection } => {
                let Some(server_data) = self.resolve(selection) else {
                    warn!("Nothing to activate: no known city selected");
                    return;
                };
                // Probe traffic would compete with the handshake
                self.sweep.cancel();
                if let Err(e) = self.controller.activate(server_data) {
                    warn!("Activation rejected: {}", e);
                }
            }
            Command::Deactivate => {
                self.controller.deactivate();
            }
            Command::ChangeServer { selection, silent } => {
                let Some(server_data) = self.resolve(Some(selection)) else {
                    warn!("Unknown city, server change ignored");
                    return;
                };
                if let Err(e) = self.controller.change_server(server_data, silent) {
                    warn!("Server change failed: {}", e);
                }
            }
            Command::SilentSwitch => {
                self.controller.silent_switch();
            }
            Command::Quit => {
                self.sweep.cancel();
                self.controller.quit();
            }
            Command::CaptivePortal(true) => self.controller.captive_portal_detected(),
            Command::CaptivePortal(false) => self.controller.captive_portal_gone(),
            Command::RequestStatus => self.controller.request_status(),
            Command::FetchLogs(reply) => self.controller.fetch_logs(reply),
            Command::CleanLogs => self.controller.clean_logs(),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::CityScores(reply) => {
                let _ = reply.send(self.city_scores());
            }
        }
    }

    /// Turn a selection into server data, remembering it for next time
    fn resolve(&mut self, selection: Option<CitySelection>) -> Option<ServerData> {
        let selection = selection
            .or_else(|| self.last_selection.clone())
            .or_else(|| {
                self.controller.server_data()
                    .map(|data| CitySelection::new(&data.country_code, &data.city_name))
            })
            .or_else(|| self.best_city())?;

        let server_data = self.catalog.server_data(&selection)?;
        self.last_selection = Some(selection);
        Some(server_data)
    }

    fn best_city(&self) -> Option<CitySelection> {
        let registry = self.controller.registry();
        self.catalog
            .cities()
            .max_by_key(|city| registry.connection_score(city, self.user_country.as_deref()))
            .map(|city| CitySelection::new(&city.country_code, &city.name))
    }

    pub fn snapshot(&self) -> SessionStatus {
        let controller = &self.controller;
        let status = controller.last_status();

        SessionStatus {
            state: controller.state(),
            city: controller.server_data().map(|d| d.city_name.clone()),
            server: controller.current_server().map(|s| s.hostname.clone()),
            stability: controller.health().stability(),
            latency_ms: controller.health().smoothed_latency_ms(),
            connected_since: controller.connected_since(),
            tx_bytes: status.map(|s| s.tx_bytes).unwrap_or(0),
            rx_bytes: status.map(|s| s.rx_bytes).unwrap_or(0),
        }
    }

    /// Score every city of the catalog, best first
    pub fn city_scores(&self) -> Vec<CityReport> {
        score_cities(&self.catalog, self.controller.registry(), self.user_country.as_deref())
    }

    pub fn probe_tick(&mut self, now: Instant) {
        self.controller.probe_tick(now);
    }

    pub fn checkup_tick(&mut self, now: Instant) {
        self.controller.health_checkup(now);
    }

    pub fn status_tick(&mut self) {
        self.controller.request_status();
    }

    /// Advance the latency sweep. Sweeps only run while disconnected.
    pub fn sweep_tick(&mut self, now: Instant) {
        if self.controller.state() != ConnectionState::Off {
            if self.sweep.is_running() {
                self.sweep.cancel();
            }
            return;
        }
        if !self.sweep_enabled {
            return;
        }

        if self.sweep.is_due(now) {
            self.sweep.start(SweepTarget::from_catalog(&self.catalog));
        }
        self.sweep.pump(now, self.sweep_prober.as_mut());
    }
}

/// Score every city of `catalog`, best first. Unmeasured cities sort last
/// within a tier.
pub fn score_cities(
    catalog: &ServerCatalog,
    registry: &ServerLatencyRegistry,
    user_country: Option<&str>,
) -> Vec<CityReport> {
    let mut reports: Vec<CityReport> = catalog
        .cities()
        .map(|city| CityReport {
            country_code: city.country_code.clone(),
            city_name: city.name.clone(),
            latency_ms: registry.city_latency(city),
            score: registry.connection_score(city, user_country),
        })
        .collect();

    reports.sort_by(|a, b| {
        b.score.cmp(&a.score).then_with(|| match (a.latency_ms, b.latency_ms) {
            (0, 0) => std::cmp::Ordering::Equal,
            (0, _) => std::cmp::Ordering::Greater,
            (_, 0) => std::cmp::Ordering::Less,
            (a, b) => a.cmp(&b),
        })
    });
    reports
}

/// The single task that owns all session state
pub struct EventLoop {
    context: SessionContext,
    events: mpsc::UnboundedReceiver<Event>,
    intervals: LoopIntervals,
}

impl EventLoop {
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Run until quitting has completed
    pub async fn run(mut self) -> SessionContext {
        let mut probe = ticker(self.intervals.probe);
        let mut checkup = ticker(self.intervals.checkup);
        let mut status = ticker(self.intervals.status);
        let mut sweep = ticker(self.intervals.sweep);

        info!("Session event loop started");

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        debug!("Event queue closed");
                        break;
                    };
                    self.context.handle(event);
                }
                _ = probe.tick() => self.context.probe_tick(Instant::now()),
                _ = checkup.tick() => self.context.checkup_tick(Instant::now()),
                _ = status.tick() => self.context.status_tick(),
                _ = sweep.tick() => self.context.sweep_tick(Instant::now()),
            }

            if self.context.controller().is_finished() {
                break;
            }
        }

        info!("Session event loop stopped");
        self.context
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Cloneable front end to a running session
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Event>,
    events: broadcast::Sender<ControllerEvent>,
}

impl SessionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn send(&self, command: Command) -> Result<(), SessionError> {
        self.tx.send(Event::Command(command)).map_err(|_| SessionError::Closed)
    }

    pub fn activate(&self, selection: Option<CitySelection>) -> Result<(), SessionError> {
        self.send(Command::Activate { selection })
    }

    pub fn deactivate(&self) -> Result<(), SessionError> {
        self.send(Command::Deactivate)
    }

    pub fn change_server(&self, selection: CitySelection, silent: bool) -> Result<(), SessionError> {
        self.send(Command::ChangeServer { selection, silent })
    }

    pub fn silent_switch(&self) -> Result<(), SessionError> {
        self.send(Command::SilentSwitch)
    }

    pub fn quit(&self) -> Result<(), SessionError> {
        self.send(Command::Quit)
    }

    pub fn captive_portal(&self, detected: bool) -> Result<(), SessionError> {
        self.send(Command::CaptivePortal(detected))
    }

    pub fn clean_logs(&self) -> Result<(), SessionError> {
        self.send(Command::CleanLogs)
    }

    /// Daemon logs, empty when the daemon is unreachable
    pub async fn logs(&self) -> Result<String, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::FetchLogs(tx))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Current session view. While on, the traffic counters come from a
    /// fresh daemon reply, or the last known one after [`STATUS_REPLY_TIMEOUT`].
    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        let status = self.snapshot().await?;
        if !status.state.is_on() {
            return Ok(status);
        }

        let mut events = self.subscribe();
        self.send(Command::RequestStatus)?;
        let refreshed = tokio::time::timeout(STATUS_REPLY_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Ok(ControllerEvent::StatusUpdated { .. }) => return true,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        })
        .await;
        if !matches!(refreshed, Ok(true)) {
            debug!("No fresh status from the daemon, using the last one");
        }

        self.snapshot().await
    }

    async fn snapshot(&self) -> Result<SessionStatus, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn city_scores(&self) -> Result<Vec<CityReport>, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::CityScores(tx))?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

/// Session construction
pub struct Session;

impl Session {
    /// Connect to the daemon and bind probe sockets
    #[cfg(unix)]
    pub async fn start(
        settings: &SessionSettings,
        catalog: ServerCatalog,
    ) -> Result<(SessionHandle, EventLoop), SessionError> {
        use crate::probe::DnsProbeSender;
        use crate::transport::{Backoff, DaemonTransport};

        let (tx, rx) = mpsc::unbounded_channel();

        let health_prober = DnsProbeSender::bind(ProbePurpose::Health, tx.clone()).await?;
        let sweep_prober = DnsProbeSender::bind(ProbePurpose::Sweep, tx.clone()).await?;
        let transport = DaemonTransport::spawn(settings.socket_path.clone(), tx.clone(), Backoff::default());

        Self::assemble(
            settings,
            catalog,
            (tx, rx),
            Box::new(transport),
            Box::new(health_prober),
            Box::new(sweep_prober),
        )
    }

    /// Build a session around already constructed I/O
    pub fn assemble(
        settings: &SessionSettings,
        catalog: ServerCatalog,
        (tx, rx): (mpsc::UnboundedSender<Event>, mpsc::UnboundedReceiver<Event>),
        link: Box<dyn DaemonLink>,
        health_prober: Box<dyn ProbeSender>,
        sweep_prober: Box<dyn ProbeSender>,
    ) -> Result<(SessionHandle, EventLoop), SessionError> {
        let controller = ConnectionController::new(
            settings.controller_config()?,
            settings.device_identity()?,
            ServerLatencyRegistry::new(),
            link,
            Box::new(TokioScheduler { events: tx.clone() }),
            health_prober,
        );
        let events = controller.event_sender();

        let context = SessionContext::new(
            controller,
            catalog,
            LatencySweep::new(settings.sweep_config()),
            sweep_prober,
        )
        .with_last_selection(settings.last_selection.clone())
        .with_user_country(settings.user_country.clone())
        .with_sweep_enabled(settings.sweep.enabled);

        let handle = SessionHandle { tx, events };
        let event_loop = EventLoop {
            context,
            events: rx,
            intervals: settings.loop_intervals(),
        };

        Ok((handle, event_loop))
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Session stopped")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::{city_entry, FakeLink, FakeProber};
    use crate::keys::PrivateKey;
    use crate::protocol::{DaemonReply, DaemonRequest, StatusReply};
    use crate::server::ServerCountry;
    use std::net::IpAddr;

    fn catalog() -> ServerCatalog {
        ServerCatalog {
            countries: vec![ServerCountry {
                name: "Germany".to_string(),
                code: "de".to_string(),
                cities: vec![city_entry("Berlin", 2), city_entry("Frankfurt", 1)],
            }],
        }
    }

    fn settings() -> SessionSettings {
        let mut settings = SessionSettings::default();
        settings.device.private_key = PrivateKey::generate().to_base64();
        settings.device.ipv4_address = "10.64.3.4/32".to_string();
        settings
    }

    struct Fixture {
        handle: SessionHandle,
        event_loop: EventLoop,
        link: FakeLink,
        sweep_prober: FakeProber,
    }

    fn fixture(settings: &SessionSettings) -> Fixture {
        let link = FakeLink::default();
        let sweep_prober = FakeProber::default();
        let (handle, event_loop) = Session::assemble(
            settings,
            catalog(),
            mpsc::unbounded_channel(),
            Box::new(link.clone()),
            Box::new(FakeProber::default()),
            Box::new(sweep_prober.clone()),
        )
        .unwrap();
        Fixture { handle, event_loop, link, sweep_prober }
    }

    fn daemon_off(context: &mut SessionContext) {
        context.handle(Event::Daemon(DaemonEvent::Ready));
        context.handle(Event::Daemon(DaemonEvent::Message(DaemonReply::Status(StatusReply::default()))));
    }

    #[tokio::test]
    async fn test_activate_resolves_selection() {
        let Fixture { mut event_loop, link, .. } = fixture(&settings());
        let context = &mut event_loop.context;
        daemon_off(context);
        link.take();

        context.handle(Event::Command(Command::Activate {
            selection: Some(CitySelection::new("DE", "frankfurt")),
        }));

        let sent = link.take();
        assert!(matches!(sent[0], DaemonRequest::Activate(_)));
        assert_eq!(context.controller().state(), ConnectionState::Connecting);
        assert_eq!(context.last_selection(), Some(&CitySelection::new("de", "frankfurt")));
    }

    #[tokio::test]
    async fn test_activate_without_selection_uses_last() {
        let mut settings = settings();
        settings.last_selection = Some(CitySelection::new("de", "Berlin"));
        let Fixture { mut event_loop, link, .. } = fixture(&settings);
        let context = &mut event_loop.context;
        daemon_off(context);

        context.handle(Event::Command(Command::Activate { selection: None }));

        assert_eq!(context.controller().server_data().unwrap().city_name, "Berlin");
        assert!(link.take().iter().any(|r| matches!(r, DaemonRequest::Activate(_))));
    }

    #[tokio::test]
    async fn test_unknown_city_ignored() {
        let Fixture { mut event_loop, link, .. } = fixture(&settings());
        let context = &mut event_loop.context;
        daemon_off(context);
        link.take();

        context.handle(Event::Command(Command::Activate {
            selection: Some(CitySelection::new("fr", "Paris")),
        }));

        assert!(link.take().is_empty());
        assert_eq!(context.controller().state(), ConnectionState::Off);
    }

    #[tokio::test]
    async fn test_sweep_only_while_off() {
        let Fixture { mut event_loop, sweep_prober, .. } = fixture(&settings());
        let context = &mut event_loop.context;
        let now = Instant::now();

        context.sweep_tick(now);
        assert!(sweep_prober.sent.lock().unwrap().is_empty());

        daemon_off(context);
        context.sweep_tick(now);
        assert_eq!(sweep_prober.sent.lock().unwrap().len(), 3);
        assert!(context.sweep().is_running());

        context.handle(Event::Command(Command::Activate { selection: None }));
        assert!(!context.sweep().is_running());
    }

    #[tokio::test]
    async fn test_sweep_reply_feeds_scores() {
        let Fixture { mut event_loop, sweep_prober, .. } = fixture(&settings());
        let context = &mut event_loop.context;
        let now = Instant::now();
        daemon_off(context);
        context.sweep_tick(now);

        let sent = sweep_prober.sent.lock().unwrap().clone();
        for (from, sequence) in sent {
            context.handle(Event::Probe(ProbeReply {
                purpose: ProbePurpose::Sweep,
                sequence,
                from,
                received_at: now + Duration::from_millis(20),
            }));
        }
        context.sweep_tick(now + Duration::from_millis(30));

        assert!(!context.sweep().is_running());
        let scores = context.city_scores();
        assert_eq!(scores.len(), 2);
        assert!(scores.iter().all(|r| r.latency_ms == 20));
        assert_eq!(scores[0].city_name, "Berlin");
        // Every city sits at the average, so no latency bonus applies
        assert_eq!(scores[0].score, ConnectionScore::Moderate);
        assert_eq!(scores[1].score, ConnectionScore::Poor);
    }

    #[tokio::test]
    async fn test_health_reply_not_taken_by_sweep() {
        let Fixture { mut event_loop, .. } = fixture(&settings());
        let context = &mut event_loop.context;
        daemon_off(context);

        context.handle(Event::Probe(ProbeReply {
            purpose: ProbePurpose::Health,
            sequence: 0,
            from: IpAddr::from([10, 64, 0, 1]),
            received_at: Instant::now(),
        }));

        assert_eq!(context.controller().registry().measured_count(), 0);
    }

    #[tokio::test]
    async fn test_event_loop_quits() {
        let Fixture { handle, event_loop, .. } = fixture(&settings());
        let mut events = handle.subscribe();

        let task = tokio::spawn(event_loop.run());
        handle.quit().unwrap();

        let context = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(context.controller().is_finished());
        assert_eq!(events.recv().await.unwrap(), ControllerEvent::ReadyToQuit);
    }

    #[tokio::test]
    async fn test_snapshot_through_handle() {
        let Fixture { handle, event_loop, .. } = fixture(&settings());
        let task = tokio::spawn(event_loop.run());

        let status = handle.status().await.unwrap();
        assert_eq!(status.state, ConnectionState::Initializing);
        assert_eq!(status.stability, Stability::NoSignal);

        handle.quit().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_status_waits_for_daemon_counters() {
        let Fixture { handle, event_loop, link, .. } = fixture(&settings());
        let task = tokio::spawn(event_loop.run());
        let daemon = |reply| handle.tx.send(Event::Daemon(DaemonEvent::Message(reply))).unwrap();

        handle.tx.send(Event::Daemon(DaemonEvent::Ready)).unwrap();
        daemon(DaemonReply::Status(StatusReply::default()));
        handle.activate(Some(CitySelection::new("de", "Frankfurt"))).unwrap();
        assert_eq!(handle.snapshot().await.unwrap().state, ConnectionState::Connecting);

        let pubkey = link
            .take()
            .into_iter()
            .find_map(|r| match r {
                DaemonRequest::Activate(config) => Some(config.server_public_key),
                _ => None,
            })
            .unwrap();
        daemon(DaemonReply::Connected { pubkey });
        daemon(DaemonReply::Status(StatusReply {
            connected: true,
            server_ipv4_gateway: "10.64.0.1".to_string(),
            date: 1_700_000_000,
            ..Default::default()
        }));
        assert_eq!(handle.snapshot().await.unwrap().state, ConnectionState::On);
        link.take();

        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.status().await }
        });
        tokio::time::timeout(Duration::from_secs(1), async {
            while !link.take().contains(&DaemonRequest::Status) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        daemon(DaemonReply::Status(StatusReply {
            connected: true,
            server_ipv4_gateway: "10.64.0.1".to_string(),
            date: 1_700_000_000,
            tx_bytes: 4096,
            rx_bytes: 8192,
            ..Default::default()
        }));
        let status = pending.await.unwrap().unwrap();
        assert_eq!(status.state, ConnectionState::On);
        assert_eq!((status.tx_bytes, status.rx_bytes), (4096, 8192));

        handle.quit().unwrap();
        task.await.unwrap();
    }
}
