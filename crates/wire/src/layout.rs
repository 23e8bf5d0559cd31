// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Filesystem-as-registry paths: a session directory is the system of
//! record, not a cache — it is fully re-derivable by walking
//! `{config_dir}/eggs/*`, which is exactly what `SessionRegistry` does on
//! every wing startup and relay reconnect.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SessionDir {
    root: PathBuf,
}

impl SessionDir {
    pub fn new(config_dir: &Path, session_id: &str) -> Self {
        Self {
            root: config_dir.join("eggs").join(session_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sock(&self) -> PathBuf {
        self.root.join("egg.sock")
    }

    pub fn token(&self) -> PathBuf {
        self.root.join("egg.token")
    }

    pub fn pid(&self) -> PathBuf {
        self.root.join("egg.pid")
    }

    pub fn owner(&self) -> PathBuf {
        self.root.join("egg.owner")
    }

    pub fn meta(&self) -> PathBuf {
        self.root.join("egg.meta")
    }

    pub fn log(&self) -> PathBuf {
        self.root.join("egg.log")
    }

    pub fn audit_pty(&self) -> PathBuf {
        self.root.join("audit.pty.gz")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.root.join("audit.log")
    }

    /// Ephemeral files removed once the egg process has exited and no
    /// audit files remain — `egg.meta`/`egg.owner`/audit files survive so
    /// `sessions.history` can still describe the session.
    pub fn ephemeral_files(&self) -> [PathBuf; 4] {
        [self.sock(), self.token(), self.pid(), self.log()]
    }
}

#[cfg(test)]
#[path = "layout_tests.rs"]
mod tests;
