// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The spawn spec an egg process is launched with: a single JSON document
//! passed as its one positional argument, built by `EggSpawner` on the
//! wing side and read back by the egg's own `main`. Lives in `wire` (not
//! `egg`) because both processes need the identical shape and `wing`
//! cannot depend on the `egg` binary crate to get it.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::layout::SessionDir;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnSpec {
    pub session_id: String,
    pub agent: String,
    /// Fully resolved argv for the agent command (the wing resolves
    /// `agent` to a concrete command line before spawning).
    pub command: Vec<String>,
    pub cwd: String,
    pub rows: u16,
    pub cols: u16,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Capability: a command prefix the agent command is wrapped in,
    /// e.g. `["bwrap", "--ro-bind", "/", "/", "--"]`. Empty when the host
    /// provides no sandboxing.
    #[serde(default)]
    pub sandbox: Vec<String>,
    #[serde(default)]
    pub audit: bool,
    /// 0 disables the idle-exit timer.
    #[serde(default)]
    pub idle_timeout_secs: u64,
    pub ring_capacity: usize,
    pub config_dir: PathBuf,
}

impl SpawnSpec {
    pub fn argv(&self) -> Vec<String> {
        self.sandbox
            .iter()
            .cloned()
            .chain(self.command.iter().cloned())
            .collect()
    }

    pub fn session_dir(&self) -> SessionDir {
        SessionDir::new(&self.config_dir, &self.session_id)
    }
}

#[cfg(test)]
#[path = "spawn_tests.rs"]
mod tests;
