// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Entry point for the `wing` daemon: wires `KeyEngine`, `ConfigState`,
//! `SessionRegistry`, `EggSpawner`, `TunnelDispatcher`, and `RelayClient`
//! together, reaps orphaned sessions from a prior run, and serves until
//! `SIGINT`/`SIGTERM`. `wing attach` instead runs the local interactive
//! client and never touches any of this.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wing::bridge::PTYBridge;
use wing::config::{Cli, Command, DaemonArgs};
use wing::keyengine::KeyEngine;
use wing::passkey::AuthCache;
use wing::registry::SessionRegistry;
use wing::relay::{RelayClient, WingIdentity};
use wing::reload::ConfigState;
use wing::spawner::EggSpawner;
use wing::tunnel::TunnelDispatcher;

/// Uses `try_init` so it's safe to call more than once (tests call it too).
fn init_tracing(args: &DaemonArgs) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    let result = match args.log_format.as_str() {
        "json" => tracing_subscriber::fmt().with_env_filter(filter).json().try_init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok().map(|s| s.trim().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Load this wing's stable id from `{config_dir}/wing_id`, generating and
/// persisting a fresh one on first run — same "load or generate,
/// persisted next to `wing_key`" shape as `KeyEngine`.
fn load_or_generate_wing_id(explicit: Option<&str>, config_dir: &std::path::Path) -> anyhow::Result<String> {
    if let Some(id) = explicit {
        return Ok(id.to_string());
    }
    let path = config_dir.join("wing_id");
    match std::fs::read_to_string(&path) {
        Ok(raw) => Ok(raw.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let id = uuid::Uuid::new_v4().to_string();
            std::fs::write(&path, &id)
                .map_err(|e| anyhow::anyhow!("writing {path:?}: {e}"))?;
            Ok(id)
        }
        Err(e) => Err(anyhow::anyhow!("reading {path:?}: {e}")),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Attach(args)) => {
            std::process::exit(wing::attach::run(args).await.unwrap_or_else(|e| {
                eprintln!("error: {e:#}");
                1
            }));
        }
        None => {
            let args = cli.daemon;
            init_tracing(&args);
            match run_daemon(args).await {
                Ok(()) => std::process::exit(0),
                Err(e) => {
                    error!("fatal: {e:#}");
                    std::process::exit(1);
                }
            }
        }
    }
}

async fn run_daemon(args: DaemonArgs) -> anyhow::Result<()> {
    let config_dir = args.resolved_config_dir()?;
    std::fs::create_dir_all(&config_dir)
        .map_err(|e| anyhow::anyhow!("creating {config_dir:?}: {e}"))?;

    let relay_url = args
        .relay_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--relay-url (or WING_RELAY_URL) is required"))?;

    let key_engine = Arc::new(
        KeyEngine::load_or_generate(&config_dir.join("wing_key"))
            .map_err(|e| anyhow::anyhow!("loading wing_key: {e}"))?,
    );
    let wing_id = load_or_generate_wing_id(args.wing_id.as_deref(), &config_dir)?;

    let config = ConfigState::load(&config_dir)?;
    let registry = Arc::new(SessionRegistry::new(config_dir.clone()));

    // Reap orphaned session directories left behind by a prior
    // wing process before anything else touches the eggs/ tree.
    match registry.reap_and_list_alive() {
        Ok(alive) => info!(count = alive.len(), "reaped stale sessions, found live ones"),
        Err(e) => error!("reaping session directory on startup: {e}"),
    }

    let spawner: Arc<EggSpawner> = Arc::new(EggSpawner::new(config_dir.clone(), args.egg_binary.clone()));
    let auth_cache = Arc::new(AuthCache::new());
    let bridges: Arc<Mutex<HashMap<String, Arc<PTYBridge>>>> = Arc::new(Mutex::new(HashMap::new()));

    let tunnel = Arc::new(TunnelDispatcher::new(
        wing_id.clone(),
        config_dir.clone(),
        key_engine.clone(),
        config.clone(),
        auth_cache.clone(),
        registry.clone(),
        bridges.clone(),
    ));

    let identity = WingIdentity {
        wing_id,
        hostname: hostname(),
        platform: std::env::consts::OS.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        agents: Vec::new(),
        skills: Vec::new(),
        root_dir: std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        org_slug: args.org_slug.clone(),
    };

    let shutdown = CancellationToken::new();

    let relay = RelayClient::new(
        relay_url,
        identity,
        key_engine,
        config.clone(),
        auth_cache,
        spawner,
        registry,
        tunnel,
        bridges,
        shutdown.clone(),
    );

    let (registration_tx, registration_rx) = mpsc::unbounded_channel();
    config.install_sighup(registration_tx);

    let pid_path = config_dir.join("wing.pid");
    let _ = std::fs::write(&pid_path, std::process::id().to_string());

    install_signal_handlers(shutdown.clone());

    info!("wing daemon starting");
    relay.run(registration_rx).await;
    info!("wing daemon shut down");

    let _ = std::fs::remove_file(&pid_path);
    Ok(())
}

/// First SIGINT/SIGTERM requests a graceful shutdown via `shutdown`; a
/// second forces an immediate exit, mirroring this repo's existing
/// daemon signal-handling shape.
fn install_signal_handlers(shutdown: CancellationToken) {
    static SECOND_SIGNAL: AtomicBool = AtomicBool::new(false);

    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        loop {
            tokio::select! {
                _ = async {
                    match sigterm.as_mut() {
                        Some(s) => s.recv().await,
                        None => std::future::pending().await,
                    }
                } => info!("received SIGTERM"),
                _ = async {
                    match sigint.as_mut() {
                        Some(s) => s.recv().await,
                        None => std::future::pending().await,
                    }
                } => info!("received SIGINT"),
            }

            if SECOND_SIGNAL.swap(true, Ordering::SeqCst) {
                info!("received second shutdown signal, forcing exit");
                std::process::exit(130);
            }
            shutdown.cancel();
        }
    });
}
