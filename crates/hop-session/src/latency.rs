//! Server Latency Registry
//!
//! Process-wide table of measured latency and cooldowns per server, keyed by
//! server public key. Feeds city scoring and server selection.
//!
//! # Scoring
//!
//! | Non-cooldown servers | Base score  |
//! |----------------------|-------------|
//! | 0                    | Unavailable |
//! | 1                    | Poor        |
//! | 2                    | Moderate    |
//! | 3+                   | Good        |
//!
//! A city in the user's own country is lifted to at least `Good` as long as
//! one of its servers is usable. Latency can then add up to two tiers (see
//! [`ServerLatencyRegistry::connection_score`]).

use crate::server::ServerCity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Below this many usable servers a city scores `Poor`
pub const REDUNDANCY_MINIMUM: usize = 2;

/// At this many usable servers a city scores `Good`
pub const REDUNDANCY_GOOD: usize = 3;

/// Cities faster than this earn an extra tier
pub const LOW_LATENCY_MS: u32 = 30;

/// Source of wall-clock time in epoch seconds
pub type EpochClock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Current wall-clock time in epoch seconds
pub fn system_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// City connection quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionScore {
    Unavailable,
    Poor,
    Moderate,
    Good,
    Excellent,
}

impl ConnectionScore {
    /// One tier up, saturating at `Excellent`
    pub fn upgrade(self) -> Self {
        match self {
            ConnectionScore::Unavailable => ConnectionScore::Poor,
            ConnectionScore::Poor => ConnectionScore::Moderate,
            ConnectionScore::Moderate => ConnectionScore::Good,
            ConnectionScore::Good | ConnectionScore::Excellent => ConnectionScore::Excellent,
        }
    }

    /// Can a connection be attempted at all?
    pub fn is_available(&self) -> bool {
        !matches!(self, ConnectionScore::Unavailable)
    }
}

impl std::fmt::Display for ConnectionScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionScore::Unavailable => "unavailable",
            ConnectionScore::Poor => "poor",
            ConnectionScore::Moderate => "moderate",
            ConnectionScore::Good => "good",
            ConnectionScore::Excellent => "excellent",
        };
        f.write_str(label)
    }
}

/// Per-server measurement
#[derive(Debug, Clone, Copy, Default)]
struct LatencyEntry {
    /// Latest sample in ms, 0 when never measured
    latency_ms: u32,
    /// Epoch seconds until which the server is excluded, 0 when none
    cooldown_until: u64,
}

/// Latency and cooldown table
pub struct ServerLatencyRegistry {
    entries: HashMap<String, LatencyEntry>,
    clock: EpochClock,
}

impl ServerLatencyRegistry {
    /// Create an empty registry on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(system_epoch_secs))
    }

    /// Create an empty registry on a custom clock
    pub fn with_clock(clock: EpochClock) -> Self {
        Self {
            entries: HashMap::new(),
            clock,
        }
    }

    /// Current time according to this registry's clock
    pub fn now(&self) -> u64 {
        (self.clock)()
    }

    /// Store a latency sample, replacing the previous one
    pub fn set_latency(&mut self, public_key: &str, latency_ms: u32) {
        self.entries.entry(public_key.to_string()).or_default().latency_ms = latency_ms;
    }

    /// Latest sample for a server, 0 when there is no data
    pub fn latency(&self, public_key: &str) -> u32 {
        self.entries.get(public_key).map(|e| e.latency_ms).unwrap_or(0)
    }

    /// Mean latency over all measured servers (ceiling), 0 when there is no data
    pub fn avg_latency(&self) -> u32 {
        ceil_mean(self.entries.values().map(|e| e.latency_ms))
    }

    /// Exclude a server for `seconds` from now. Zero lifts the cooldown.
    pub fn set_cooldown(&mut self, public_key: &str, seconds: u64) {
        if seconds == 0 {
            if let Some(entry) = self.entries.get_mut(public_key) {
                entry.cooldown_until = 0;
            }
            return;
        }

        let until = self.now().saturating_add(seconds);
        debug!(
            "Server {} on cooldown for {}s",
            crate::keys::short_key(public_key),
            seconds
        );
        self.entries.entry(public_key.to_string()).or_default().cooldown_until = until;
    }

    /// Cooldown expiry in epoch seconds, 0 once expired or when never set
    pub fn cooldown(&self, public_key: &str) -> u64 {
        let now = self.now();
        match self.entries.get(public_key) {
            Some(entry) if entry.cooldown_until > now => entry.cooldown_until,
            _ => 0,
        }
    }

    /// Is the server currently excluded?
    pub fn is_cooling_down(&self, public_key: &str) -> bool {
        self.cooldown(public_key) != 0
    }

    /// Number of servers with a latency sample
    pub fn measured_count(&self) -> usize {
        self.entries.values().filter(|e| e.latency_ms > 0).count()
    }

    /// Servers of a city that are not cooling down
    pub fn active_servers(&self, city: &ServerCity) -> usize {
        city.servers
            .iter()
            .filter(|s| !self.is_cooling_down(&s.public_key))
            .count()
    }

    /// Redundancy-based score, with the user's own country lifted to `Good`.
    ///
    /// Cities without a single usable server stay `Unavailable` even in the
    /// user's country.
    pub fn base_city_score(&self, city: &ServerCity, user_country: Option<&str>) -> ConnectionScore {
        let active = self.active_servers(city);

        let score = match active {
            0 => return ConnectionScore::Unavailable,
            n if n < REDUNDANCY_MINIMUM => ConnectionScore::Poor,
            n if n < REDUNDANCY_GOOD => ConnectionScore::Moderate,
            _ => ConnectionScore::Good,
        };

        let local = user_country
            .map(|country| country.eq_ignore_ascii_case(&city.country_code))
            .unwrap_or(false);

        if local {
            score.max(ConnectionScore::Good)
        } else {
            score
        }
    }

    /// Mean latency over the measured servers of a city (ceiling), 0 when unknown
    pub fn city_latency(&self, city: &ServerCity) -> u32 {
        ceil_mean(city.servers.iter().map(|s| self.latency(&s.public_key)))
    }

    /// Base score adjusted by measured latency.
    ///
    /// A city faster than the global average gains a tier, and another one
    /// when it is also under [`LOW_LATENCY_MS`].
    pub fn connection_score(&self, city: &ServerCity, user_country: Option<&str>) -> ConnectionScore {
        let mut score = self.base_city_score(city, user_country);
        if !score.is_available() {
            return score;
        }

        let latency = self.city_latency(city);
        if latency == 0 {
            return score;
        }

        if latency < self.avg_latency() {
            score = score.upgrade();
            if latency < LOW_LATENCY_MS {
                score = score.upgrade();
            }
        }
        score
    }
}

impl Default for ServerLatencyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Ceiling mean of the non-zero values
fn ceil_mean(values: impl Iterator<Item = u32>) -> u32 {
    let (sum, count) = values
        .filter(|&v| v > 0)
        .fold((0u64, 0u64), |(sum, count), v| (sum + v as u64, count + 1));

    if count == 0 {
        0
    } else {
        sum.div_ceil(count) as u32
    }
}
