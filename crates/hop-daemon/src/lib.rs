//! Hop VPN daemon
//!
//! Runs with the privileges needed to bring a WireGuard interface up and
//! serves the newline-delimited JSON protocol of `hop-session` on a Unix
//! socket. One actor owns the tunnel; every connection talks to it through a
//! [`DaemonHandle`].

pub mod access;
pub mod backend;
pub mod daemon;
pub mod logs;
pub mod server;
pub mod settings;

pub use access::AccessControl;
pub use backend::{Backend, BackendError, BackendKind, DummyBackend, PeerStatus, WgQuickBackend};
pub use daemon::{spawn_daemon, DaemonCommand, DaemonHandle};
pub use logs::LogBuffer;
pub use server::{DaemonServer, ServerError};
pub use settings::{DaemonSettings, SettingsError};
