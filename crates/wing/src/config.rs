// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! CLI configuration (`clap`, same derive+env pattern as the rest of this
//! codebase) plus the declarative `wing.yaml` policy document that
//! [`crate::reload::ConfigReload`] re-reads on `SIGHUP`.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use wire::tunnel::AllowedKey;

/// Top-level CLI: `wing` with no subcommand runs the daemon; `wing attach`
/// runs the local interactive client.
#[derive(Debug, Parser)]
#[command(
    name = "wing",
    version,
    about = "Exposes this machine as a remotely reachable agent-shell endpoint."
)]
pub struct Cli {
    #[command(flatten)]
    pub daemon: DaemonArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Attach an interactive terminal to a session running on this wing.
    Attach(crate::attach::AttachArgs),
}

/// Flags that configure the long-lived daemon. Also flattened into `wing
/// attach`'s invocation so both share `--config-dir`.
#[derive(Debug, Clone, Parser)]
pub struct DaemonArgs {
    /// Directory holding `wing.yaml`, `wing_key`, `wing.pid`/`wing.log`,
    /// and the `eggs/` session registry. Defaults to `$XDG_CONFIG_HOME/wing`
    /// or `~/.config/wing`.
    #[arg(long, env = "WING_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// WebSocket URL of the roost relay to register with.
    #[arg(long, env = "WING_RELAY_URL")]
    pub relay_url: Option<String>,

    /// Organization slug reported at registration, if this wing belongs
    /// to one.
    #[arg(long, env = "WING_ORG_SLUG")]
    pub org_slug: Option<String>,

    /// Stable identifier for this wing. Generated and persisted alongside
    /// `wing_key` on first run if not given.
    #[arg(long, env = "WING_ID")]
    pub wing_id: Option<String>,

    /// Log format: `json` or `text`.
    #[arg(long, env = "WING_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level: `trace`, `debug`, `info`, `warn`, `error`.
    #[arg(long, env = "WING_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Path to the `egg` sibling binary. Defaults to the directory
    /// containing the running `wing` executable, falling back to `PATH`.
    #[arg(long, env = "WING_EGG_BINARY")]
    pub egg_binary: Option<PathBuf>,
}

impl DaemonArgs {
    /// Resolve the configuration directory, applying the documented
    /// default when `--config-dir` wasn't given.
    pub fn resolved_config_dir(&self) -> anyhow::Result<PathBuf> {
        resolve_config_dir(self.config_dir.as_deref())
    }
}

/// Shared by [`DaemonArgs::resolved_config_dir`] and `wing attach`'s own
/// `--config-dir`: `$XDG_CONFIG_HOME/wing`, falling back to
/// `~/.config/wing`.
pub fn resolve_config_dir(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| dirs_home().map(|h| h.join(".config")))
        .ok_or_else(|| anyhow::anyhow!("cannot determine a default config directory"))?;
    Ok(base.join("wing"))
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Declarative wing policy, hot-reloadable via `SIGHUP`. Everything here
/// maps directly onto the `wing.yaml` field list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WingPolicy {
    pub allow_keys: Vec<AllowedKey>,
    pub locked: bool,
    /// Filesystem roots `dir.list` is allowed to enumerate under.
    pub paths: Vec<PathBuf>,
    pub labels: Vec<String>,
    pub audit: bool,
    pub debug: bool,
    /// Seconds; 0 means auth tokens never expire.
    pub auth_ttl_secs: u64,
    /// Seconds; 0 means no egg is ever idle-killed by default.
    pub idle_timeout_secs: u64,
    pub egg: EggDefaults,
}

impl Default for WingPolicy {
    fn default() -> Self {
        Self {
            allow_keys: Vec::new(),
            locked: false,
            paths: Vec::new(),
            labels: Vec::new(),
            audit: false,
            debug: false,
            auth_ttl_secs: 0,
            idle_timeout_secs: 0,
            egg: EggDefaults::default(),
        }
    }
}

/// Wing-level defaults applied to every newly spawned egg, swappable as a
/// unit via `egg.config_update`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EggDefaults {
    pub ring_capacity: usize,
    pub sandbox: Vec<String>,
}

impl Default for EggDefaults {
    fn default() -> Self {
        Self {
            ring_capacity: 64 * 1024,
            sandbox: Vec::new(),
        }
    }
}

impl WingPolicy {
    /// Load from `wing.yaml`, or fall back to defaults if the file doesn't
    /// exist yet (first run).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                serde_yaml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {path:?}: {e}"))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(anyhow::anyhow!("reading {path:?}: {e}")),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
