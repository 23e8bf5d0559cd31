// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `SessionRegistry`: the wing-side index of sessions, re-derived by
//! walking `{config_dir}/eggs/*` rather than held in a must-survive-crash
//! table — state is re-derived by walking the filesystem instead.

use std::path::PathBuf;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};
use wire::tunnel::SessionSummary;
use wire::SessionMeta;

pub struct SessionRegistry {
    config_dir: PathBuf,
}

impl SessionRegistry {
    pub fn new(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    fn eggs_dir(&self) -> PathBuf {
        self.config_dir.join("eggs")
    }

    fn session_dirs(&self) -> anyhow::Result<Vec<PathBuf>> {
        let eggs_dir = self.eggs_dir();
        match std::fs::read_dir(&eggs_dir) {
            Ok(entries) => Ok(entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .map(|e| e.path())
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(anyhow::anyhow!("reading {eggs_dir:?}: {e}")),
        }
    }

    /// Walk every session directory. Dead sessions (per [`is_alive`]) have
    /// their ephemeral files removed; `egg.meta`, `egg.owner`, and any
    /// audit files are retained. Returns the session ids found alive, so
    /// the caller can instantiate a `PTYBridge` placeholder for each one
    /// that doesn't already have one.
    pub fn reap_and_list_alive(&self) -> anyhow::Result<Vec<String>> {
        let mut alive = Vec::new();
        for dir in self.session_dirs()? {
            let session_id = match dir.file_name().and_then(|n| n.to_str()) {
                Some(id) => id.to_string(),
                None => continue,
            };
            let sd = wire::SessionDir::new(&self.config_dir, &session_id);
            if is_alive(&sd) {
                alive.push(session_id);
            } else {
                self.clean_ephemeral(&sd, &session_id);
            }
        }
        Ok(alive)
    }

    fn clean_ephemeral(&self, sd: &wire::SessionDir, session_id: &str) {
        // PID file first, so a racing liveness probe immediately sees
        // "dead" rather than a half-cleaned directory.
        for path in [sd.pid(), sd.sock(), sd.token(), sd.log()] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(session = session_id, ?path, "failed to remove: {e}");
                }
            }
        }
        info!(session = session_id, "reaped orphaned egg directory");

        let has_remnants = sd.meta().exists() || sd.owner().exists();
        let has_audit = sd.audit_pty().exists() || sd.audit_log().exists();
        if !has_remnants && !has_audit {
            let _ = std::fs::remove_dir(sd.root());
        }
    }

    /// Alive sessions, for `sessions.list`.
    pub fn list_alive(&self) -> anyhow::Result<Vec<SessionSummary>> {
        let mut out = Vec::new();
        for dir in self.session_dirs()? {
            let Some(session_id) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let sd = wire::SessionDir::new(&self.config_dir, session_id);
            if !is_alive(&sd) {
                continue;
            }
            out.push(self.summarize(&sd, session_id));
        }
        Ok(out)
    }

    /// Dead sessions whose `egg.meta` or audit files survived, sorted by
    /// directory modification time, for `sessions.history`.
    pub fn list_history(&self, offset: usize, limit: usize) -> anyhow::Result<Vec<SessionSummary>> {
        let mut entries: Vec<(std::time::SystemTime, SessionSummary)> = Vec::new();
        for dir in self.session_dirs()? {
            let Some(session_id) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let sd = wire::SessionDir::new(&self.config_dir, session_id);
            if is_alive(&sd) {
                continue;
            }
            if !sd.meta().exists() && !sd.audit_pty().exists() && !sd.audit_log().exists() {
                continue;
            }
            let mtime = std::fs::metadata(&dir)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            entries.push((mtime, self.summarize(&sd, session_id)));
        }
        entries.sort_by_key(|(mtime, _)| *mtime);
        Ok(entries
            .into_iter()
            .map(|(_, s)| s)
            .skip(offset)
            .take(limit)
            .collect())
    }

    fn summarize(&self, sd: &wire::SessionDir, session_id: &str) -> SessionSummary {
        let owner = std::fs::read_to_string(sd.owner()).ok();
        match std::fs::read_to_string(sd.meta()).ok().and_then(|raw| SessionMeta::parse(&raw).ok()) {
            Some(meta) => SessionSummary {
                session_id: session_id.to_string(),
                agent: meta.agent,
                owner,
                started_at: meta.started_at,
            },
            None => SessionSummary {
                session_id: session_id.to_string(),
                agent: String::new(),
                owner,
                started_at: 0,
            },
        }
    }
}

/// Live iff `egg.pid` names a live process. (Socket-dialability and
/// token validation are checked by the caller at attach time, not here —
/// this is the cheap filesystem-only check used for reaping.)
fn is_alive(sd: &wire::SessionDir) -> bool {
    let Ok(raw) = std::fs::read_to_string(sd.pid()) else {
        return false;
    };
    let Ok(pid) = raw.trim().parse::<i32>() else {
        return false;
    };
    is_pid_alive(pid)
}

fn is_pid_alive(pid: i32) -> bool {
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Process exists but we lack permission to signal it: still alive.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
