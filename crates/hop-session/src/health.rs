//! Connection Health Monitoring
//!
//! While the tunnel is up, a probe with an increasing sequence number is sent
//! to the gateway on a fixed interval. Replies feed a smoothed latency
//! estimate; a periodic checkup classifies the connection.
//!
//! # Classification
//!
//! - **NoSignal**: monitoring is not armed, or the last probe could not be sent
//! - **Unstable**: too many probes in the window went unanswered, nothing
//!   acknowledged within the staleness window, or the latest sample exceeds
//!   the "very slow" bound
//! - **Stable**: otherwise
//!
//! The monitor never tears the tunnel down. It reports, the controller decides.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Probes kept for loss statistics
pub const PING_WINDOW: usize = 32;

/// Stability classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stability {
    Stable,
    Unstable,
    NoSignal,
}

/// Configuration for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How often to send a probe
    pub probe_interval: Duration,
    /// How long without an acknowledgement before the link is unstable
    pub stale_after: Duration,
    /// Latency above which a single sample marks the link unstable
    pub very_slow: Duration,
    /// EWMA divisor; each sample weighs `1/divisor`
    pub ewma_divisor: u32,
    /// Loss ratio above which the link is unstable
    pub loss_unstable_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(4),
            very_slow: Duration::from_secs(1),
            ewma_divisor: 8,
            loss_unstable_threshold: 0.10,
        }
    }
}

/// One health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PingRecord {
    sequence: u16,
    sent_at: Instant,
    /// Round-trip time once acknowledged
    latency: Option<Duration>,
}

/// Entries into each stability state and time spent there.
///
/// Counted once per transition, never per checkup tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StabilityCounters {
    pub stable_entries: u32,
    pub unstable_entries: u32,
    pub no_signal_entries: u32,
    pub stable_time: Duration,
    pub unstable_time: Duration,
    pub no_signal_time: Duration,
}

impl StabilityCounters {
    fn enter(&mut self, state: Stability) {
        match state {
            Stability::Stable => self.stable_entries += 1,
            Stability::Unstable => self.unstable_entries += 1,
            Stability::NoSignal => self.no_signal_entries += 1,
        }
    }

    fn exit(&mut self, state: Stability, spent: Duration) {
        match state {
            Stability::Stable => self.stable_time += spent,
            Stability::Unstable => self.unstable_time += spent,
            Stability::NoSignal => self.no_signal_time += spent,
        }
    }
}

/// Probe bookkeeping and stability classification
pub struct HealthMonitor {
    config: HealthConfig,
    /// Probe target while armed
    target: Option<IpAddr>,
    armed_at: Option<Instant>,
    records: VecDeque<PingRecord>,
    next_sequence: u16,
    last_sent: Option<u16>,
    last_ack_at: Option<Instant>,
    ewma_ms: Option<f64>,
    latest: Option<Duration>,
    measurement_error: bool,
    stability: Stability,
    entered_at: Instant,
    counters: StabilityCounters,
}

impl HealthMonitor {
    /// Create a disarmed monitor
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            target: None,
            armed_at: None,
            records: VecDeque::with_capacity(PING_WINDOW),
            next_sequence: 0,
            last_sent: None,
            last_ack_at: None,
            ewma_ms: None,
            latest: None,
            measurement_error: false,
            stability: Stability::NoSignal,
            entered_at: Instant::now(),
            counters: StabilityCounters::default(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Start probing `target`. The smoothed estimate survives a restart
    /// against the same target; everything else is per session.
    pub fn start(&mut self, target: IpAddr, now: Instant) {
        if self.target != Some(target) {
            self.ewma_ms = None;
        }
        self.records.clear();
        self.latest = None;
        self.last_ack_at = None;
        self.last_sent = None;

        info!("Health monitoring started (target: {})", target);
        self.target = Some(target);
        self.armed_at = Some(now);
        self.measurement_error = false;
    }

    /// Stop probing. Reports the transition to `NoSignal` if there was one.
    pub fn stop(&mut self, now: Instant) -> Option<Stability> {
        if self.target.take().is_none() {
            return None;
        }

        debug!("Health monitoring stopped");
        self.armed_at = None;
        self.last_sent = None;
        self.transition(Stability::NoSignal, now)
    }

    /// Is a probe timer active?
    pub fn is_armed(&self) -> bool {
        self.target.is_some()
    }

    pub fn target(&self) -> Option<IpAddr> {
        self.target
    }

    /// Register the next probe and return where to send it
    pub fn next_probe(&mut self, now: Instant) -> Option<(IpAddr, u16)> {
        let target = self.target?;

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        if self.records.len() == PING_WINDOW {
            self.records.pop_front();
        }
        self.records.push_back(PingRecord {
            sequence,
            sent_at: now,
            latency: None,
        });
        self.last_sent = Some(sequence);

        Some((target, sequence))
    }

    /// Accept an acknowledgement.
    ///
    /// Only the most recently sent sequence number is accepted; anything else
    /// is stale and dropped without touching latency state.
    pub fn on_ack(&mut self, sequence: u16, received_at: Instant) -> bool {
        if self.last_sent != Some(sequence) {
            debug!("Dropping stale probe ack {}", sequence);
            return false;
        }

        let Some(record) = self.records.back_mut() else {
            return false;
        };
        if record.sequence != sequence || record.latency.is_some() {
            return false;
        }

        let latency = received_at.saturating_duration_since(record.sent_at);
        record.latency = Some(latency);

        self.latest = Some(latency);
        self.last_ack_at = Some(received_at);
        self.measurement_error = false;
        self.update_ewma(latency);
        true
    }

    /// A probe could not be sent
    pub fn on_send_failure(&mut self) {
        self.measurement_error = true;
    }

    fn update_ewma(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        let divisor = self.config.ewma_divisor.max(1) as f64;

        self.ewma_ms = Some(match self.ewma_ms {
            None => sample_ms,
            Some(previous) => sample_ms / divisor + previous * (divisor - 1.0) / divisor,
        });
    }

    /// Classify the connection. Returns the new state when it changed.
    pub fn checkup(&mut self, now: Instant) -> Option<Stability> {
        let next = self.classify(now);
        self.measurement_error = false;
        self.transition(next, now)
    }

    fn classify(&self, now: Instant) -> Stability {
        let Some(armed_at) = self.armed_at else {
            return Stability::NoSignal;
        };

        if self.measurement_error {
            return Stability::NoSignal;
        }

        if self.loss_ratio() > self.config.loss_unstable_threshold {
            return Stability::Unstable;
        }

        let reference = self.last_ack_at.unwrap_or(armed_at).max(armed_at);
        if now.saturating_duration_since(reference) > self.config.stale_after {
            return Stability::Unstable;
        }

        match self.latest {
            Some(latency) if latency > self.config.very_slow => Stability::Unstable,
            _ => Stability::Stable,
        }
    }

    fn transition(&mut self, next: Stability, now: Instant) -> Option<Stability> {
        if next == self.stability {
            return None;
        }

        let spent = now.saturating_duration_since(self.entered_at);
        self.counters.exit(self.stability, spent);
        self.counters.enter(next);

        info!("Connection stability: {:?} -> {:?}", self.stability, next);
        self.stability = next;
        self.entered_at = now;
        Some(next)
    }

    pub fn stability(&self) -> Stability {
        self.stability
    }

    pub fn counters(&self) -> &StabilityCounters {
        &self.counters
    }

    /// Smoothed latency, `None` before the first sample
    pub fn smoothed_latency_ms(&self) -> Option<f64> {
        self.ewma_ms
    }

    /// Latest accepted sample
    pub fn latest_latency(&self) -> Option<Duration> {
        self.latest
    }

    /// Has any probe been acknowledged since the target was set?
    pub fn ping_received(&self) -> bool {
        self.last_ack_at.is_some()
    }

    /// Share of probes in the window that went unanswered.
    ///
    /// The newest probe is still in flight and not counted.
    pub fn loss_ratio(&self) -> f64 {
        let settled = self.records.len().saturating_sub(1);
        if settled == 0 {
            return 0.0;
        }

        let lost = self.records
            .iter()
            .take(settled)
            .filter(|r| r.latency.is_none())
            .count();
        lost as f64 / settled as f64
    }
}
