//! Latency probes
//!
//! A probe is a minimal DNS query (root `NS`, id = sequence number) sent over
//! UDP. Gateways and most servers answer it without special privileges,
//! unlike ICMP echo.

use crate::runtime::Event;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// DNS port probes are sent to
const DNS_PORT: u16 = 53;

/// Which consumer a probe belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbePurpose {
    /// Health monitoring through the tunnel
    Health,
    /// Latency sweep over the catalog
    Sweep,
}

/// A probe acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReply {
    pub purpose: ProbePurpose,
    pub sequence: u16,
    pub from: IpAddr,
    pub received_at: Instant,
}

/// Sends sequenced probes. Replies arrive asynchronously as [`Event::Probe`].
pub trait ProbeSender: Send {
    fn send_probe(&mut self, target: IpAddr, sequence: u16) -> Result<(), ProbeError>;
}

/// Build a DNS query for the root NS records with `sequence` as the id
pub fn dns_probe_packet(sequence: u16) -> [u8; 17] {
    let id = sequence.to_be_bytes();
    [
        id[0], id[1],
        0x01, 0x00, // standard query, recursion desired
        0x00, 0x01, // one question
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00,       // root name
        0x00, 0x02, // NS
        0x00, 0x01, // IN
    ]
}

/// Extract the sequence number from a DNS response, `None` for anything else
pub fn parse_dns_probe_reply(packet: &[u8]) -> Option<u16> {
    if packet.len() < 12 || packet[2] & 0x80 == 0 {
        return None;
    }
    Some(u16::from_be_bytes([packet[0], packet[1]]))
}

/// UDP DNS probe sender
pub struct DnsProbeSender {
    v4: Arc<UdpSocket>,
    v6: Option<Arc<UdpSocket>>,
    readers: Vec<JoinHandle<()>>,
}

impl DnsProbeSender {
    /// Bind probe sockets and start forwarding replies to the event queue
    pub async fn bind(
        purpose: ProbePurpose,
        events: mpsc::UnboundedSender<Event>,
    ) -> Result<Self, ProbeError> {
        let v4 = Arc::new(
            UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
                .await
                .map_err(|e| ProbeError::Bind(e.to_string()))?,
        );

        let v6 = match UdpSocket::bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)).await {
            Ok(socket) => Some(Arc::new(socket)),
            Err(e) => {
                debug!("IPv6 probe socket unavailable: {}", e);
                None
            }
        };

        let mut readers = vec![tokio::spawn(read_replies(v4.clone(), purpose, events.clone()))];
        if let Some(socket) = &v6 {
            readers.push(tokio::spawn(read_replies(socket.clone(), purpose, events)));
        }

        Ok(Self { v4, v6, readers })
    }
}

impl ProbeSender for DnsProbeSender {
    fn send_probe(&mut self, target: IpAddr, sequence: u16) -> Result<(), ProbeError> {
        let socket = match target {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => self.v6.as_ref().ok_or(ProbeError::NoRoute(target))?,
        };

        socket
            .try_send_to(&dns_probe_packet(sequence), SocketAddr::new(target, DNS_PORT))
            .map(|_| ())
            .map_err(|e| ProbeError::Send(e.to_string()))
    }
}

impl Drop for DnsProbeSender {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

async fn read_replies(
    socket: Arc<UdpSocket>,
    purpose: ProbePurpose,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut buf = [0u8; 512];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("Probe socket error: {}", e);
                continue;
            }
        };

        let Some(sequence) = parse_dns_probe_reply(&buf[..len]) else {
            continue;
        };

        let reply = ProbeReply {
            purpose,
            sequence,
            from: from.ip(),
            received_at: Instant::now(),
        };
        if events.send(Event::Probe(reply)).is_err() {
            break;
        }
    }
}

/// Probe errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("Failed to bind probe socket: {0}")]
    Bind(String),

    #[error("No socket for {0}")]
    NoRoute(IpAddr),

    #[error("Failed to send probe: {0}")]
    Send(String),
}
