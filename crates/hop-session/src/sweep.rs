//! Catalog latency sweep
//!
//! While disconnected, every server in the catalog is probed once so the
//! registry has fresh numbers for city scoring. At most `max_parallel`
//! probes are in flight; a probe that times out is retried a limited number
//! of times and then given up on.

use crate::latency::ServerLatencyRegistry;
use crate::probe::{ProbeReply, ProbeSender};
use crate::server::ServerCatalog;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Sweep tuning
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub max_parallel: usize,
    pub probe_timeout: Duration,
    pub max_retries: u32,
    pub refresh_interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            probe_timeout: Duration::from_secs(5),
            max_retries: 2,
            refresh_interval: Duration::from_secs(30 * 60),
        }
    }
}

/// A server to measure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepTarget {
    pub public_key: String,
    pub address: IpAddr,
}

impl SweepTarget {
    /// One target per catalog server with a parseable entry address
    pub fn from_catalog(catalog: &ServerCatalog) -> Vec<Self> {
        catalog
            .servers()
            .filter_map(|server| {
                let address = server.ipv4_addr_in.parse().ok()?;
                Some(Self {
                    public_key: server.public_key.clone(),
                    address,
                })
            })
            .collect()
    }
}

struct InFlight {
    target: SweepTarget,
    attempt: u32,
    sent_at: Instant,
}

/// Incremental latency sweep, driven by the event loop
pub struct LatencySweep {
    config: SweepConfig,
    queue: VecDeque<(SweepTarget, u32)>,
    in_flight: HashMap<u16, InFlight>,
    next_sequence: u16,
    running: bool,
    last_finished: Option<Instant>,
    measured: usize,
}

impl LatencySweep {
    pub fn new(config: SweepConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            next_sequence: 0,
            running: false,
            last_finished: None,
            measured: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Should a new sweep start now?
    pub fn is_due(&self, now: Instant) -> bool {
        if self.running {
            return false;
        }
        match self.last_finished {
            None => true,
            Some(finished) => now.saturating_duration_since(finished) >= self.config.refresh_interval,
        }
    }

    /// Begin measuring `targets`, discarding any sweep in progress
    pub fn start(&mut self, targets: Vec<SweepTarget>) {
        info!("Starting latency sweep over {} servers", targets.len());
        self.in_flight.clear();
        self.queue = targets.into_iter().map(|t| (t, 0)).collect();
        self.measured = 0;
        self.running = true;
    }

    /// Abandon the current sweep; it starts over next time it is due
    pub fn cancel(&mut self) {
        if self.running {
            debug!("Latency sweep cancelled");
        }
        self.queue.clear();
        self.in_flight.clear();
        self.running = false;
    }

    /// Expire timed-out probes and fill the in-flight window
    pub fn pump(&mut self, now: Instant, prober: &mut dyn ProbeSender) {
        if !self.running {
            return;
        }

        let timeout = self.config.probe_timeout;
        let expired: Vec<u16> = self.in_flight
            .iter()
            .filter(|(_, probe)| now.saturating_duration_since(probe.sent_at) >= timeout)
            .map(|(seq, _)| *seq)
            .collect();

        for sequence in expired {
            if let Some(probe) = self.in_flight.remove(&sequence) {
                self.retry_or_drop(probe.target, probe.attempt);
            }
        }

        while self.in_flight.len() < self.config.max_parallel {
            let Some((target, attempt)) = self.queue.pop_front() else {
                break;
            };

            let sequence = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);

            match prober.send_probe(target.address, sequence) {
                Ok(()) => {
                    self.in_flight.insert(sequence, InFlight { target, attempt, sent_at: now });
                }
                Err(e) => {
                    debug!("Sweep probe to {} failed: {}", target.address, e);
                    self.retry_or_drop(target, attempt);
                }
            }
        }

        if self.queue.is_empty() && self.in_flight.is_empty() {
            info!("Latency sweep finished ({} servers measured)", self.measured);
            self.running = false;
            self.last_finished = Some(now);
        }
    }

    /// Record a reply. Returns `true` when it matched an outstanding probe.
    pub fn on_reply(&mut self, reply: &ProbeReply, registry: &mut ServerLatencyRegistry) -> bool {
        let matches = self.in_flight
            .get(&reply.sequence)
            .map(|probe| probe.target.address == reply.from)
            .unwrap_or(false);
        if !matches {
            return false;
        }

        let Some(probe) = self.in_flight.remove(&reply.sequence) else {
            return false;
        };
        let latency = reply.received_at.saturating_duration_since(probe.sent_at);
        let latency_ms = latency.as_millis().clamp(1, u32::MAX as u128) as u32;

        registry.set_latency(&probe.target.public_key, latency_ms);
        self.measured += 1;
        true
    }

    fn retry_or_drop(&mut self, target: SweepTarget, attempt: u32) {
        if attempt < self.config.max_retries {
            self.queue.push_back((target, attempt + 1));
        } else {
            debug!("Giving up on {} after {} attempts", target.address, attempt + 1);
        }
    }
}
