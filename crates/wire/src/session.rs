// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed view of `egg.meta`: newline-delimited `key=value` pairs written by
//! `EggSpawner` and read back by `SessionRegistry` for session inventory.

use std::collections::HashMap;
use std::fmt::Write as _;

use anyhow::Context;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    pub agent: String,
    pub cwd: String,
    pub rows: u16,
    pub cols: u16,
    pub started_at: i64,
}

impl SessionMeta {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut fields: HashMap<&str, &str> = HashMap::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (k, v) = line
                .split_once('=')
                .with_context(|| format!("malformed egg.meta line: {line:?}"))?;
            fields.insert(k, v);
        }

        let get = |k: &str| -> anyhow::Result<&str> {
            fields
                .get(k)
                .copied()
                .with_context(|| format!("egg.meta missing field {k:?}"))
        };

        Ok(SessionMeta {
            agent: get("agent")?.to_string(),
            cwd: get("cwd")?.to_string(),
            rows: get("rows")?.parse().context("invalid rows")?,
            cols: get("cols")?.parse().context("invalid cols")?,
            started_at: get("started_at")?.parse().context("invalid started_at")?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        let _ = writeln!(out, "agent={}", self.agent);
        let _ = writeln!(out, "cwd={}", self.cwd);
        let _ = writeln!(out, "rows={}", self.rows);
        let _ = writeln!(out, "cols={}", self.cols);
        let _ = writeln!(out, "started_at={}", self.started_at);
        out.into_bytes()
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
