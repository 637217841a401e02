//! Daemon Transport
//!
//! Client side of the daemon socket. A supervisor task owns the connection,
//! reconnects with exponential backoff, and forwards decoded frames to the
//! event loop. The controller only sees the [`DaemonLink`] trait.

use crate::protocol::{DaemonReply, DaemonRequest};
use std::time::Duration;

/// Connection-level notifications delivered to the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    /// Connection (re)established
    Ready,
    /// Connection lost or daemon unreachable; reported once per outage
    Lost,
    /// A decoded frame
    Message(DaemonReply),
}

/// Sending half of the daemon connection as seen by the controller
pub trait DaemonLink: Send {
    /// Queue a request. Fails immediately when the daemon is unreachable.
    fn send(&mut self, request: DaemonRequest) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

/// Reconnect delay: starts at `initial`, doubles, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, current: initial }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(16))
    }
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Daemon not connected")]
    NotConnected,

    #[error("Transport task stopped")]
    Closed,
}

#[cfg(unix)]
pub use unix::DaemonTransport;

#[cfg(unix)]
mod unix {
    use super::*;
    use crate::protocol::{decode_frame, encode_frame, FrameDecoder, ProtocolError};
    use crate::runtime::Event;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tracing::{debug, info, warn};

    /// Unix-socket connection to the daemon
    pub struct DaemonTransport {
        requests: mpsc::UnboundedSender<DaemonRequest>,
        connected: Arc<AtomicBool>,
        supervisor: JoinHandle<()>,
    }

    impl DaemonTransport {
        /// Spawn the supervisor. Events are posted to `events`.
        pub fn spawn(path: PathBuf, events: mpsc::UnboundedSender<Event>, backoff: Backoff) -> Self {
            let (requests, rx) = mpsc::unbounded_channel();
            let connected = Arc::new(AtomicBool::new(false));

            let supervisor = tokio::spawn(supervise(path, rx, events, connected.clone(), backoff));

            Self { requests, connected, supervisor }
        }
    }

    impl DaemonLink for DaemonTransport {
        fn send(&mut self, request: DaemonRequest) -> Result<(), TransportError> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            self.requests.send(request).map_err(|_| TransportError::Closed)
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    impl Drop for DaemonTransport {
        fn drop(&mut self) {
            self.supervisor.abort();
        }
    }

    async fn supervise(
        path: PathBuf,
        mut requests: mpsc::UnboundedReceiver<DaemonRequest>,
        events: mpsc::UnboundedSender<Event>,
        connected: Arc<AtomicBool>,
        mut backoff: Backoff,
    ) {
        let mut loss_reported = false;

        loop {
            match UnixStream::connect(&path).await {
                Ok(stream) => {
                    info!("Connected to daemon at {}", path.display());
                    backoff.reset();
                    loss_reported = false;

                    // Requests queued during the previous session are stale
                    while requests.try_recv().is_ok() {}

                    connected.store(true, Ordering::SeqCst);
                    if events.send(Event::Daemon(DaemonEvent::Ready)).is_err() {
                        return;
                    }

                    let ended = run_session(stream, &mut requests, &events).await;
                    connected.store(false, Ordering::SeqCst);

                    match ended {
                        SessionEnd::Shutdown => return,
                        SessionEnd::Disconnected(reason) => warn!("Daemon connection lost: {}", reason),
                    }
                }
                Err(e) => debug!("Daemon unreachable at {}: {}", path.display(), e),
            }

            if !loss_reported {
                loss_reported = true;
                if events.send(Event::Daemon(DaemonEvent::Lost)).is_err() {
                    return;
                }
            }

            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    enum SessionEnd {
        Disconnected(String),
        Shutdown,
    }

    async fn run_session(
        stream: UnixStream,
        requests: &mut mpsc::UnboundedReceiver<DaemonRequest>,
        events: &mpsc::UnboundedSender<Event>,
    ) -> SessionEnd {
        let (mut reader, mut writer) = stream.into_split();
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];

        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else {
                        return SessionEnd::Shutdown;
                    };
                    debug!("Sending {} to daemon", request.kind());
                    let bytes = match encode_frame(&request) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!("Dropping unencodable request: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = writer.write_all(&bytes).await {
                        return SessionEnd::Disconnected(e.to_string());
                    }
                }
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => return SessionEnd::Disconnected("closed by daemon".to_string()),
                        Ok(n) => n,
                        Err(e) => return SessionEnd::Disconnected(e.to_string()),
                    };
                    decoder.push(&buf[..n]);

                    while let Some(line) = decoder.next_line() {
                        match line.and_then(|line| decode_frame::<DaemonReply>(&line)) {
                            Ok(reply) => {
                                if events.send(Event::Daemon(DaemonEvent::Message(reply))).is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                            Err(ProtocolError::UnknownType(kind)) => {
                                warn!("Ignoring unknown daemon message type: {}", kind);
                            }
                            Err(e) => warn!("Dropping daemon frame: {}", e),
                        }
                    }
                }
            }
        }
    }

}
