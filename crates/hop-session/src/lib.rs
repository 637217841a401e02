//! Hop VPN session core
//!
//! Everything between the user pressing "connect" and packets flowing through
//! a WireGuard tunnel that is owned by a privileged daemon.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Client Process                           │
//! │                                                               │
//! │  UI ──Command──▶ ┌───────────────┐                            │
//! │                  │  Event Loop   │◀── probe / checkup ticks   │
//! │  Transport ────▶ │ (one queue)   │◀── timer expirations       │
//! │                  └──────┬────────┘                            │
//! │                         ▼                                     │
//! │              ┌──────────────────────┐   ┌──────────────────┐  │
//! │              │ ConnectionController │──▶│ HealthMonitor    │  │
//! │              └──────────┬───────────┘   └──────────────────┘  │
//! │                         │ ServerLatencyRegistry (cooldowns)   │
//! └─────────────────────────│─────────────────────────────────────┘
//!                           ▼ newline-delimited JSON (Unix socket)
//!                 ┌───────────────────┐
//!                 │   hop-daemon      │──▶ wg-quick / WireGuard
//!                 └───────────────────┘
//! ```
//!
//! # Ordering
//!
//! All state transitions happen on the event loop, one event at a time.
//! Daemon notifications, timer expirations, probe replies and UI requests
//! share a single queue and are processed strictly in receipt order.

mod allowed_ips;
mod config;
mod controller;
mod health;
mod keys;
mod latency;
mod probe;
mod protocol;
mod runtime;
mod server;
mod settings;
mod sweep;
mod transport;

pub use allowed_ips::{compute_allowed_ips, IPV4_EXCLUDED, IPV6_EXCLUDED};
pub use config::{ConfigError, IpRange, TunnelConfig};
pub use controller::{
    ConnectionController, ConnectionState, ControllerConfig, ControllerError, ControllerEvent,
    DeviceIdentity, Scheduler, TimerKind, TimerToken,
};
pub use health::{HealthConfig, HealthMonitor, Stability, StabilityCounters};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey};
pub use latency::{
    system_epoch_secs, ConnectionScore, EpochClock, ServerLatencyRegistry, LOW_LATENCY_MS,
    REDUNDANCY_GOOD, REDUNDANCY_MINIMUM,
};
pub use probe::{
    dns_probe_packet, parse_dns_probe_reply, DnsProbeSender, ProbeError, ProbePurpose, ProbeReply,
    ProbeSender,
};
pub use protocol::{
    decode_frame, encode_frame, DaemonReply, DaemonRequest, Frame, FrameDecoder, ProtocolError,
    StatusReply, MAX_FRAME_LEN,
};
pub use runtime::{
    score_cities, CityReport, Command, Event, EventLoop, LoopIntervals, Session, SessionContext,
    SessionError, SessionHandle, SessionStatus,
};
pub use server::{CatalogError, CitySelection, Server, ServerCatalog, ServerCity, ServerCountry, ServerData};
pub use settings::{
    DeviceSettings, HealthSettings, SessionSettings, SettingsError, SweepSettings, TimeoutSettings,
};
pub use sweep::{LatencySweep, SweepConfig, SweepTarget};
pub use transport::{Backoff, DaemonEvent, DaemonLink, TransportError};

#[cfg(unix)]
pub use transport::DaemonTransport;
