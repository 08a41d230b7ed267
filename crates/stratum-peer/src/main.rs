//! Headless Stratum peer.
//!
//! Hosts or joins a command-sync session over TCP and drives the tick loop
//! against an in-memory colony. With `mode: Loopback` in `config.ron` it runs
//! a host and one client in-process instead.
//!
//! Run with: `cargo run -p stratum-peer -- --host`

mod demo;
mod ledger;
mod session;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use stratum_config::{CliArgs, Config, PeerRole, TransportMode, default_config_dir};
use stratum_net::{
    ConnectError, HOST_PEER_ID, LoopbackHub, PeerId, TcpClientTransport, TcpHostTransport,
};
use stratum_sync::WorldState;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::session::Session;

/// Seconds between status lines.
const STATUS_INTERVAL_SECS: i64 = 10;

#[derive(Debug, thiserror::Error)]
enum PeerError {
    #[error("failed to start host: {0}")]
    Bind(#[source] std::io::Error),

    #[error("could not resolve host address {0}")]
    Resolve(String),

    #[error("failed to join session: {0}")]
    Connect(#[from] ConnectError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    let config = load_config(&args);

    let log_dir = (!config.debug.log_dir.is_empty()).then(|| PathBuf::from(&config.debug.log_dir));
    stratum_log::init_logging(log_dir.as_deref(), cfg!(debug_assertions), Some(&config));

    info!(
        role = ?config.network.role,
        mode = ?config.network.mode,
        endpoint = %config.network.endpoint(),
        tick_rate_hz = config.sync.tick_rate_hz,
        "Stratum peer starting"
    );

    let result = match config.network.mode {
        TransportMode::Relay => run_relay(&config).await,
        TransportMode::Loopback => {
            run_loopback(&config).await;
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Load `config.ron` (creating it on first run) and apply CLI overrides.
fn load_config(args: &CliArgs) -> Config {
    let loaded = match &args.config {
        Some(dir) => Config::load_or_create(dir),
        None => default_config_dir().and_then(|dir| Config::load_or_create(&dir)),
    };
    // Logging is not up yet.
    let mut config = loaded.unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {e}");
        Config::default()
    });
    config.apply_cli_overrides(args);
    config
}

async fn run_relay(config: &Config) -> Result<(), PeerError> {
    match config.network.role {
        PeerRole::Host => {
            let host = Arc::new(
                TcpHostTransport::bind(&config.network)
                    .await
                    .map_err(PeerError::Bind)?,
            );
            let mut sessions = [Session::new(host.clone(), config)];
            run_ticks(config, &mut sessions, false).await;
            host.shutdown();
        }
        PeerRole::Client => {
            let endpoint = config.network.endpoint();
            let addr = tokio::net::lookup_host(&endpoint)
                .await
                .ok()
                .and_then(|mut addrs| addrs.next())
                .ok_or_else(|| PeerError::Resolve(endpoint.clone()))?;
            let client = Arc::new(
                TcpClientTransport::connect(
                    addr,
                    &config.network.peer_name,
                    config.network.max_frame_bytes,
                )
                .await?,
            );
            let mut sessions = [Session::new(client.clone(), config)];
            run_ticks(config, &mut sessions, false).await;
            client.disconnect();
        }
    }
    Ok(())
}

async fn run_loopback(config: &Config) {
    let hub = LoopbackHub::new();
    let host = Session::new(Arc::new(hub.join_host(HOST_PEER_ID)), config);
    let client = Session::new(Arc::new(hub.join_client(PeerId(2))), config);
    let mut sessions = [host, client];
    run_ticks(config, &mut sessions, true).await;
}

/// Step every session at `tick_rate_hz` until Ctrl-C or a lost link.
async fn run_ticks(config: &Config, sessions: &mut [Session], scripted: bool) {
    let rate = config.sync.tick_rate_hz.max(1);
    let mut interval = tokio::time::interval(Duration::from_secs(1) / rate);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let status_every = i64::from(rate) * STATUS_INTERVAL_SECS;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
            _ = interval.tick() => {
                for session in sessions.iter_mut() {
                    let manager = session.manager();
                    if !manager.is_host() && !manager.is_connected() {
                        warn!("Lost connection to host");
                        return;
                    }
                    if scripted && manager.is_host() {
                        if let Some(order) = demo::scripted_order(session.tick()) {
                            session.issue(order);
                        }
                        if demo::is_save_tick(session.tick()) {
                            session.manual_save();
                        }
                    }
                    session.step();
                    if session.tick() % status_every == 0 {
                        log_status(session);
                    }
                }
            }
        }
    }
}

fn log_status(session: &Session) {
    let manager = session.manager();
    let ledger = session.ledger();
    info!(
        peer = %manager.local_peer_id(),
        tick = session.tick(),
        cycle = ledger.cycle(),
        applied = ledger.applied(),
        speed = ledger.speed(),
        paused = ledger.is_paused(),
        chores = ledger.active_chores(),
        history = manager.dispatcher().history_len(),
        pending = manager.pending_len(),
        "Status"
    );
}
