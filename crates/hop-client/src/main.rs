//! hop
//!
//! Command line front end: runs a session against hop-daemon and drives it
//! from stdin.

mod input;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hop_session::{
    score_cities, CityReport, ControllerEvent, DnsProbeSender, Event, KeyPair, LatencySweep,
    ProbePurpose, ServerCatalog, ServerLatencyRegistry, Session, SessionHandle, SessionSettings,
    SessionStatus, SweepTarget,
};
use input::{parse_line, Input, HELP};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// How long to wait for the daemon log
const LOGS_TIMEOUT: Duration = Duration::from_secs(5);

/// Hop VPN client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (default: <config dir>/hopvpn/settings.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a session and read commands from stdin (default)
    Run,
    /// Write a settings file with a fresh device key
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print a new WireGuard key pair
    Keygen,
    /// Measure every server of the catalog and print the city scores
    Scores,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hop_session=warn,hop=info".into()),
        )
        .init();

    let config = match args.config {
        Some(path) => path,
        None => default_settings_path()?,
    };

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config).await,
        Commands::Init { force } => init(&config, force),
        Commands::Scores => scores(&config).await,
        Commands::Keygen => {
            let pair = KeyPair::generate();
            println!("private: {}", pair.private.to_base64());
            println!("public:  {}", pair.public.to_base64());
            Ok(())
        }
    }
}

fn default_settings_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("no configuration directory on this platform")?;
    Ok(dir.join("hopvpn").join("settings.toml"))
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to replace it)", path.display());
    }
    let settings = SessionSettings::default_config();
    settings.save(path)?;

    let public = KeyPair::from_private(settings.device_identity()?.private_key).public;
    println!("Wrote {}", path.display());
    println!("Device public key: {}", public.to_base64());
    Ok(())
}

fn load(path: &Path) -> Result<(SessionSettings, ServerCatalog)> {
    let settings = SessionSettings::from_toml_file(path)
        .with_context(|| format!("loading {} (create it with `hop init`)", path.display()))?;
    let servers = settings
        .servers_file
        .clone()
        .context("settings do not name a servers_file")?;
    let catalog = ServerCatalog::from_json_file(&servers)
        .with_context(|| format!("loading {}", servers.display()))?;
    Ok((settings, catalog))
}

/// One sweep outside of a session; no daemon needed
async fn scores(path: &Path) -> Result<()> {
    let (settings, catalog) = load(path)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut prober = DnsProbeSender::bind(ProbePurpose::Sweep, tx).await?;
    let mut registry = ServerLatencyRegistry::new();
    let mut sweep = LatencySweep::new(settings.sweep_config());
    sweep.start(SweepTarget::from_catalog(&catalog));

    let mut tick = tokio::time::interval(settings.loop_intervals().sweep);
    while sweep.is_running() {
        tokio::select! {
            _ = tick.tick() => sweep.pump(Instant::now(), &mut prober),
            event = rx.recv() => match event {
                Some(Event::Probe(reply)) => {
                    sweep.on_reply(&reply, &mut registry);
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    println!("{} servers measured", registry.measured_count());
    print_scores(&score_cities(&catalog, &registry, settings.user_country.as_deref()));
    Ok(())
}

async fn run(path: &Path) -> Result<()> {
    let (mut settings, catalog) = load(path)?;

    let (handle, event_loop) = Session::start(&settings, catalog).await?;
    let session = tokio::spawn(event_loop.run());
    let printer = tokio::spawn(print_events(handle.subscribe()));

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Some(line) = lines.next_line().await? else {
            handle.quit()?;
            break;
        };

        match parse_line(&line) {
            Ok(Some(Input::Quit)) => {
                handle.quit()?;
                break;
            }
            Ok(Some(input)) => dispatch(&handle, input).await?,
            Ok(None) => {}
            Err(e) => println!("{}", e),
        }
    }

    let context = session.await.context("session task failed")?;
    printer.abort();

    // Remember the city for the next `on`
    let selection = context.last_selection().cloned();
    if selection.is_some() && selection != settings.last_selection {
        settings.last_selection = selection;
        if let Err(e) = settings.save(path) {
            warn!("Could not save settings: {}", e);
        }
    }

    info!("Session closed");
    Ok(())
}

async fn dispatch(handle: &SessionHandle, input: Input) -> Result<()> {
    match input {
        Input::On(selection) => handle.activate(selection)?,
        Input::Off => handle.deactivate()?,
        Input::Switch(selection) => handle.change_server(selection, false)?,
        Input::Silent => handle.silent_switch()?,
        Input::Status => print_status(&handle.status().await?),
        Input::Scores => print_scores(&handle.city_scores().await?),
        Input::Logs => match tokio::time::timeout(LOGS_TIMEOUT, handle.logs()).await {
            Ok(logs) => print!("{}", logs?),
            Err(_) => println!("daemon did not answer"),
        },
        Input::CleanLogs => handle.clean_logs()?,
        Input::Portal(detected) => handle.captive_portal(detected)?,
        Input::Help => println!("{}", HELP),
        Input::Quit => handle.quit()?,
    }
    Ok(())
}

fn print_scores(cities: &[CityReport]) {
    for city in cities {
        let latency = match city.latency_ms {
            0 => "-".to_string(),
            ms => format!("{} ms", ms),
        };
        println!("{:<4}{:<24}{:<12}{:?}", city.country_code, city.city_name, latency, city.score);
    }
}

fn print_status(status: &SessionStatus) {
    println!("state:     {:?}", status.state);
    if let Some(city) = &status.city {
        println!("city:      {}", city);
    }
    if status.state.is_active() {
        if let Some(server) = &status.server {
            println!("server:    {}", server);
        }
    }
    if status.state.is_on() {
        println!("stability: {:?}", status.stability);
        if let Some(latency) = status.latency_ms {
            println!("latency:   {:.1} ms", latency);
        }
    }
    if let Some(since) = status.connected_since {
        println!("since:     {} (unix time)", since);
    }
    println!("traffic:   {} B up, {} B down", status.tx_bytes, status.rx_bytes);
}

async fn print_events(mut events: broadcast::Receiver<ControllerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match event {
                ControllerEvent::StateChanged(state) => println!("* {:?}", state),
                ControllerEvent::HandshakeFailed { public_key } => {
                    println!("* handshake with {} failed", public_key)
                }
                ControllerEvent::ReadyToServerUnavailable { ping_received } => {
                    println!("* server unavailable (answered pings: {})", ping_received)
                }
                ControllerEvent::ReadyToBackendFailure => println!("* the daemon reported a backend failure"),
                ControllerEvent::ActivationBlockedForCaptivePortal => {
                    println!("* captive portal detected, log in first")
                }
                ControllerEvent::StabilityChanged(stability) => println!("* {:?}", stability),
                ControllerEvent::ReadyToQuit | ControllerEvent::StatusUpdated { .. } => {}
            },
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
