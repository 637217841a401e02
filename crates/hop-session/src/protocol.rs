//! Daemon IPC Protocol
//!
//! One UTF-8 JSON object per line, discriminated by a `type` field.
//!
//! | type       | direction        | payload                                   |
//! |------------|------------------|-------------------------------------------|
//! | activate   | client → daemon  | tunnel config fields                      |
//! | deactivate | client → daemon  | none                                      |
//! | status     | both             | reply: connected, counters, activation    |
//! | logs       | both             | reply: log text                           |
//! | cleanlogs  | client → daemon  | none                                      |
//! | connected  | daemon → client  | server public key                         |
//! | disconnected | daemon → client | none                                     |
//! | backendFailure | daemon → client | none                                   |
//!
//! Unknown or malformed frames are reported as [`ProtocolError`] and skipped
//! by the caller; they never close the connection.

use crate::config::TunnelConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Longest line accepted before the buffer is discarded
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Requests sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DaemonRequest {
    Activate(TunnelConfig),
    Deactivate,
    Status,
    Logs,
    #[serde(rename = "cleanlogs")]
    CleanLogs,
}

impl DaemonRequest {
    /// Wire name of the request
    pub fn kind(&self) -> &'static str {
        match self {
            DaemonRequest::Activate(_) => "activate",
            DaemonRequest::Deactivate => "deactivate",
            DaemonRequest::Status => "status",
            DaemonRequest::Logs => "logs",
            DaemonRequest::CleanLogs => "cleanlogs",
        }
    }
}

/// Status reply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReply {
    pub connected: bool,
    #[serde(default)]
    pub server_ipv4_gateway: String,
    #[serde(default)]
    pub device_ipv4_address: String,
    /// Activation time in epoch seconds, 0 when inactive
    #[serde(default)]
    pub date: u64,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default)]
    pub rx_bytes: u64,
}

/// Replies and notifications sent by the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DaemonReply {
    Status(StatusReply),
    Logs { logs: String },
    Connected { pubkey: String },
    Disconnected,
    BackendFailure,
}

/// A message that can travel as one line
pub trait Frame: Serialize + DeserializeOwned {
    /// Accepted values of the `type` field
    const KINDS: &'static [&'static str];
}

impl Frame for DaemonRequest {
    const KINDS: &'static [&'static str] = &["activate", "deactivate", "status", "logs", "cleanlogs"];
}

impl Frame for DaemonReply {
    const KINDS: &'static [&'static str] = &["status", "logs", "connected", "disconnected", "backendFailure"];
}

/// Encode one frame, including the trailing newline
pub fn encode_frame<F: Frame>(frame: &F) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(frame)
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode one line (without its newline)
pub fn decode_frame<F: Frame>(line: &str) -> Result<F, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let object = value.as_object()
        .ok_or_else(|| ProtocolError::Malformed("not a JSON object".to_string()))?;

    let kind = object.get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?;

    if !F::KINDS.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }
    let kind = kind.to_string();

    serde_json::from_value(value)
        .map_err(|e| ProtocolError::InvalidPayload { kind, reason: e.to_string() })
}

/// Splits a byte stream into trimmed, non-empty lines.
///
/// Partial lines persist across pushes.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete line, if any.
    ///
    /// Lines that are not UTF-8 or exceed [`MAX_FRAME_LEN`] are returned as
    /// errors; the decoder stays usable.
    pub fn next_line(&mut self) -> Option<Result<String, ProtocolError>> {
        loop {
            let Some(end) = self.buffer.iter().position(|&b| b == b'\n') else {
                if self.buffer.len() > MAX_FRAME_LEN {
                    self.buffer.clear();
                    return Some(Err(ProtocolError::FrameTooLong));
                }
                return None;
            };

            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            if line.len() > MAX_FRAME_LEN {
                return Some(Err(ProtocolError::FrameTooLong));
            }

            let text = match String::from_utf8(line) {
                Ok(text) => text,
                Err(_) => return Some(Err(ProtocolError::Malformed("invalid UTF-8".to_string()))),
            };

            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Some(Ok(trimmed.to_string()));
        }
    }

    /// Bytes waiting for a newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Protocol errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame has no type field")]
    MissingType,

    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("Frame exceeds maximum length")]
    FrameTooLong,

    #[error("Encode error: {0}")]
    Encode(String),
}
