// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Optional append-only recording of a session's PTY output, gzip
//! compressed as it's written. `audit.pty.gz` and `audit.log` are the only
//! files a cleaned-up session directory retains, so `sessions.history` can
//! still describe it.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

pub struct AuditWriter {
    pty: Option<GzEncoder<File>>,
    keylog: Option<GzEncoder<File>>,
}

impl AuditWriter {
    /// `None` recorders when the spawn spec didn't request auditing —
    /// `write_pty`/`write_keylog` become no-ops rather than every call
    /// site branching on an `Option<AuditWriter>`.
    pub fn new(pty_path: &Path, keylog_path: &Path, enabled: bool) -> anyhow::Result<Self> {
        if !enabled {
            return Ok(Self {
                pty: None,
                keylog: None,
            });
        }
        let pty_file = File::create(pty_path)?;
        let keylog_file = File::create(keylog_path)?;
        Ok(Self {
            pty: Some(GzEncoder::new(pty_file, Compression::default())),
            keylog: Some(GzEncoder::new(keylog_file, Compression::default())),
        })
    }

    /// Record a chunk of PTY output (`audit.pty.gz`).
    pub fn write_pty(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if let Some(enc) = self.pty.as_mut() {
            enc.write_all(data)?;
        }
        Ok(())
    }

    /// Record a chunk of received keystrokes (`audit.log`).
    pub fn write_keylog(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if let Some(enc) = self.keylog.as_mut() {
            enc.write_all(data)?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> anyhow::Result<()> {
        if let Some(enc) = self.pty.take() {
            enc.finish()?;
        }
        if let Some(enc) = self.keylog.take() {
            enc.finish()?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "audit_tests.rs"]
mod tests;
