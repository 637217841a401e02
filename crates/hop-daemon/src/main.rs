//! hop-daemon
//!
//! Owns the WireGuard interface and serves session clients on a Unix socket.

use anyhow::{Context, Result};
use clap::Parser;
use hop_daemon::{spawn_daemon, BackendKind, DaemonServer, DaemonSettings, LogBuffer};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_CONFIG: &str = "/etc/hopvpn/daemon.toml";

#[derive(Parser, Debug)]
#[command(name = "hop-daemon", version, about = "Hop VPN tunnel daemon")]
struct Args {
    /// Settings file; defaults apply when it does not exist
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Override the socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Override the tunnel backend (wg-quick or dummy)
    #[arg(long)]
    backend: Option<BackendKind>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = if args.config.exists() {
        DaemonSettings::from_toml_file(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        DaemonSettings::default()
    };
    if let Some(socket) = args.socket {
        settings.socket_path = socket;
    }
    if let Some(backend) = args.backend {
        settings.backend = backend;
    }

    // Everything logged is also kept for `logs` requests
    let logs = LogBuffer::new(settings.log_lines);
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(logs.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hop_daemon=info,hop_session=info".into()),
        )
        .init();

    info!("hop-daemon starting with {:?} backend on {}", settings.backend, settings.interface);

    let backend = settings.backend.create(&settings.interface, &settings.config_dir);
    let daemon = spawn_daemon(backend, logs);
    let server = DaemonServer::bind(&settings.socket_path, settings.socket_mode)?;

    tokio::select! {
        _ = server.serve(daemon.clone()) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for shutdown signal")?;
            info!("Shutdown requested");
        }
    }

    // Bring the tunnel down before the socket goes away
    daemon.shutdown().await;
    drop(server);

    info!("hop-daemon stopped");
    Ok(())
}
