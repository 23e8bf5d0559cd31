// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of error kinds that may cross a process or wire boundary.
///
/// Internal failures (`anyhow::Error`) are classified into one of these
/// only at the point they reach a protocol boundary — a `pty.exited.error`
/// field, a tunnel response, or a process exit code. They never unwind
/// across a bridge boundary themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ConfigInvalid,
    NotAuthorized,
    KeyExchange,
    EggStartTimeout,
    EggCrash,
    AeadFailure,
    Backpressure,
    TransientNetwork,
    Fatal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ConfigInvalid => "config_invalid",
            ErrorCode::NotAuthorized => "not_allowed",
            ErrorCode::KeyExchange => "E2E key exchange failed",
            ErrorCode::EggStartTimeout => "egg_start_timeout",
            ErrorCode::EggCrash => "egg_crash",
            ErrorCode::AeadFailure => "aead_failure",
            ErrorCode::Backpressure => "backpressure",
            ErrorCode::TransientNetwork => "transient_network",
            ErrorCode::Fatal => "fatal",
        }
    }

    /// Whether this kind should abort the whole wing process rather than
    /// just the session or request that surfaced it.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorCode::Fatal)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ErrorCode {}
