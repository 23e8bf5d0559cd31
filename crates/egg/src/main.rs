// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Entry point for the per-session `egg` process: reads its `SpawnSpec`
//! from argv, takes ownership of one PTY, and serves the local RPC surface
//! over `egg.sock` until the agent exits, it's killed, or it idles out.

use std::time::Duration;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use egg::audit::AuditWriter;
use egg::pty::spawn::NativePty;
use egg::server::EggServer;
use wire::rpc::egg_server::EggServer as EggRpcServer;
use wire::SpawnSpec;

const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let result = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    drop(result);
}

#[tokio::main]
async fn main() {
    init_tracing();

    let spec_json = match std::env::args().nth(1) {
        Some(arg) => arg,
        None => {
            eprintln!("usage: egg <spawn-spec-json>");
            std::process::exit(2);
        }
    };

    let spec: SpawnSpec = match serde_json::from_str(&spec_json) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("invalid spawn spec: {e}");
            std::process::exit(2);
        }
    };

    match run(spec).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("fatal: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(spec: SpawnSpec) -> anyhow::Result<i32> {
    let dir = spec.session_dir();

    let token = std::fs::read_to_string(dir.token())
        .map_err(|e| anyhow::anyhow!("reading {:?}: {e}", dir.token()))?
        .trim()
        .to_string();

    let pty = NativePty::spawn(&spec.argv(), spec.cols, spec.rows)?;
    let audit = AuditWriter::new(&dir.audit_pty(), &dir.audit_log(), spec.audit)?;
    let (server, mut exit_rx) = EggServer::spawn(
        spec.agent.clone(),
        pty,
        spec.ring_capacity,
        token,
        audit,
    );

    let sock_path = dir.sock();
    let _ = std::fs::remove_file(&sock_path);
    let listener = UnixListener::bind(&sock_path)
        .map_err(|e| anyhow::anyhow!("binding {sock_path:?}: {e}"))?;
    info!(session = %spec.session_id, sock = %sock_path.display(), "egg listening");

    let shutdown = CancellationToken::new();

    // Agent exit closes the RPC server.
    let exit_shutdown = shutdown.clone();
    let exit_watcher = tokio::spawn(async move {
        let _ = exit_rx.changed().await;
        exit_shutdown.cancel();
    });

    // SIGTERM/SIGINT: stop serving so the process can exit cleanly; the
    // PTY backend's own Drop handles SIGHUP/SIGKILL of the child.
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        signal_shutdown.cancel();
    });

    // Idle-exit timer: only armed when the spawn spec requests it.
    if spec.idle_timeout_secs > 0 {
        let idle_shutdown = shutdown.clone();
        let idle_server = server.clone();
        let timeout = Duration::from_secs(spec.idle_timeout_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IDLE_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                if idle_server.idle_for_at_least(timeout).await {
                    info!("idle timeout reached, shutting down");
                    idle_shutdown.cancel();
                    break;
                }
            }
        });
    }

    tonic::transport::Server::builder()
        .add_service(EggRpcServer::new(server))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown.cancelled())
        .await?;

    exit_watcher.abort();
    Ok(0)
}
