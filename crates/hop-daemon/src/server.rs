//! Unix socket server
//!
//! Accepts client connections, decodes newline-delimited JSON requests and
//! forwards daemon notifications to every connected client.

use crate::daemon::DaemonHandle;
use hop_session::{decode_frame, encode_frame, DaemonReply, DaemonRequest, FrameDecoder, ProtocolError};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Listening socket of the daemon
pub struct DaemonServer {
    listener: UnixListener,
    path: PathBuf,
}

impl DaemonServer {
    /// Bind `path`, replacing a stale socket, and apply `mode` to it
    pub fn bind(path: &Path, mode: u32) -> Result<Self, ServerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ServerError::Io(e.to_string()))?;
        }
        if path.exists() {
            debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(path).map_err(|e| ServerError::Io(e.to_string()))?;
        }

        let listener = UnixListener::bind(path)
            .map_err(|e| ServerError::Bind(format!("{}: {}", path.display(), e)))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| ServerError::Io(e.to_string()))?;

        info!("Daemon listening on {}", path.display());
        Ok(Self { listener, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the task is dropped
    pub async fn serve(&self, daemon: DaemonHandle) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let daemon = daemon.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, daemon).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Serve one client until it disconnects
pub async fn handle_connection(stream: UnixStream, daemon: DaemonHandle) {
    let uid = match stream.peer_cred() {
        Ok(cred) => Some(cred.uid()),
        Err(e) => {
            warn!("Unable to read peer credentials: {}", e);
            None
        }
    };
    debug!("Connection created (uid {:?})", uid);

    let mut notifications = daemon.subscribe();
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Read error: {}", e);
                        break;
                    }
                };
                decoder.push(&buf[..n]);

                while let Some(line) = decoder.next_line() {
                    let request = match line.and_then(|line| decode_frame::<DaemonRequest>(&line)) {
                        Ok(request) => request,
                        Err(ProtocolError::InvalidPayload { kind, reason }) if kind == "activate" => {
                            daemon.invalid_activation(uid, reason).await;
                            continue;
                        }
                        Err(ProtocolError::UnknownType(kind)) => {
                            warn!("Invalid command: {}", kind);
                            continue;
                        }
                        Err(e) => {
                            warn!("Ignoring request: {}", e);
                            continue;
                        }
                    };

                    if let Some(reply) = daemon.request(uid, request).await {
                        if write_frame(&mut writer, &reply).await.is_err() {
                            return;
                        }
                    }
                }
            }
            notification = notifications.recv() => {
                match notification {
                    Ok(reply) => {
                        if write_frame(&mut writer, &reply).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Client lagging, {} notifications dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    debug!("Connection released");
}

async fn write_frame(writer: &mut OwnedWriteHalf, reply: &DaemonReply) -> std::io::Result<()> {
    let bytes = match encode_frame(reply) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Cannot encode reply: {}", e);
            return Ok(());
        }
    };
    writer.write_all(&bytes).await
}

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Failed to bind {0}")]
    Bind(String),
}
