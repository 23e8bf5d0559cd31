// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `EggSpawner`: builds a [`SpawnSpec`], launches the sibling `egg` binary
//! for it, and waits for its local socket to come up.

use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tracing::info;
use wire::{SessionMeta, SpawnSpec};

use crate::eggrpc;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SPAWN_TIMEOUT: Duration = Duration::from_secs(5);
const LOG_TAIL_BYTES: usize = 4096;

/// Failure launching an egg. Distinguished from a plain `anyhow::Error` so
/// `PTYBridge` can map [`SpawnError::Timeout`] onto `ErrorCode::EggStartTimeout`
/// specifically.
#[derive(Debug)]
pub enum SpawnError {
    Timeout { log_tail: String },
    Other(anyhow::Error),
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::Timeout { log_tail } => {
                write!(f, "egg did not become ready in time; egg.log tail:\n{log_tail}")
            }
            SpawnError::Other(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for SpawnError {}

impl From<anyhow::Error> for SpawnError {
    fn from(e: anyhow::Error) -> Self {
        SpawnError::Other(e)
    }
}

pub struct EggSpawner {
    egg_binary: PathBuf,
    config_dir: PathBuf,
}

impl EggSpawner {
    /// Resolve the `egg` binary once: an explicit override, else the
    /// sibling of this process's own executable, else bare `"egg"`
    /// (resolved against `PATH` by the OS at spawn time).
    pub fn new(config_dir: PathBuf, egg_binary_override: Option<PathBuf>) -> Self {
        let egg_binary = egg_binary_override.unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|d| d.join("egg")))
                .filter(|p| p.is_file())
                .unwrap_or_else(|| PathBuf::from("egg"))
        });
        Self {
            egg_binary,
            config_dir,
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Create the session directory, spawn the egg child detached, and
    /// block until its socket answers a `Version` call (or the 5-second
    /// timeout elapses).
    pub async fn spawn(
        &self,
        spec: SpawnSpec,
        owner: Option<&str>,
    ) -> Result<(eggrpc::Client, wire::SessionDir), SpawnError> {
        let dir = spec.session_dir();
        std::fs::create_dir_all(dir.root())
            .map_err(|e| anyhow::anyhow!("creating {:?}: {e}", dir.root()))?;
        set_mode(dir.root(), 0o700)?;

        let token = generate_token();
        std::fs::write(dir.token(), &token)
            .map_err(|e| anyhow::anyhow!("writing {:?}: {e}", dir.token()))?;

        let started_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let meta = SessionMeta {
            agent: spec.agent.clone(),
            cwd: spec.cwd.clone(),
            rows: spec.rows,
            cols: spec.cols,
            started_at,
        };
        std::fs::write(dir.meta(), meta.to_bytes())
            .map_err(|e| anyhow::anyhow!("writing {:?}: {e}", dir.meta()))?;

        if let Some(owner) = owner {
            std::fs::write(dir.owner(), owner)
                .map_err(|e| anyhow::anyhow!("writing {:?}: {e}", dir.owner()))?;
        }

        let log_file = std::fs::File::create(dir.log())
            .map_err(|e| anyhow::anyhow!("creating {:?}: {e}", dir.log()))?;
        let log_file_err = log_file
            .try_clone()
            .map_err(|e| anyhow::anyhow!("cloning egg.log handle: {e}"))?;

        let spec_json = serde_json::to_string(&spec)
            .map_err(|e| anyhow::anyhow!("serializing spawn spec: {e}"))?;

        let mut command = std::process::Command::new(&self.egg_binary);
        command
            .arg(&spec_json)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err))
            // New process group: the egg outlives this call and must not
            // receive signals targeted at the wing's own group.
            .process_group(0);

        let child = command
            .spawn()
            .map_err(|e| anyhow::anyhow!("spawning {:?}: {e}", self.egg_binary))?;
        let pid = child.id();
        // We don't retain a `Child` handle: the egg is meant to outlive
        // this process and is supervised entirely through the filesystem
        // (PID liveness + socket dialing). Leaking the handle avoids tokio
        // reaping it as a zombie out from under us.
        std::mem::forget(child);

        std::fs::write(dir.pid(), pid.to_string())
            .map_err(|e| anyhow::anyhow!("writing {:?}: {e}", dir.pid()))?;

        info!(session = %spec.session_id, pid, "spawned egg");

        match self.wait_ready(&dir, &token).await {
            Ok(client) => Ok((client, dir)),
            Err(SpawnError::Timeout { log_tail }) => {
                Err(SpawnError::Timeout { log_tail })
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_ready(
        &self,
        dir: &wire::SessionDir,
        token: &str,
    ) -> Result<eggrpc::Client, SpawnError> {
        let deadline = tokio::time::Instant::now() + SPAWN_TIMEOUT;
        loop {
            if dir.sock().exists() {
                if let Ok(mut client) = eggrpc::connect(dir.sock(), token).await {
                    if client
                        .version(eggrpc::VersionRequest {})
                        .await
                        .is_ok()
                    {
                        return Ok(client);
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SpawnError::Timeout {
                    log_tail: tail_of(&dir.log(), LOG_TAIL_BYTES),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn set_mode(path: &Path, mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| anyhow::anyhow!("setting mode on {path:?}: {e}"))
}

fn generate_token() -> String {
    use rand::RngCore;
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

fn tail_of(path: &Path, max_bytes: usize) -> String {
    let Ok(contents) = std::fs::read(path) else {
        return String::new();
    };
    let start = contents.len().saturating_sub(max_bytes);
    String::from_utf8_lossy(&contents[start..]).into_owned()
}

#[cfg(test)]
#[path = "spawner_tests.rs"]
mod tests;
