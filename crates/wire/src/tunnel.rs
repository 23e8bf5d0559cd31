// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The decrypted inner message carried inside a `tunnel.req` ciphertext,
//! and the allow-list / session-inventory value types it operates on.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedKey {
    #[serde(default)]
    pub passkey_pub_key: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl AllowedKey {
    /// Equality by `user_id` when present on both sides, else by
    /// `passkey_pub_key` — matches the [`AllowedKey`] identity rule in the
    /// session data model.
    pub fn matches(&self, other: &AllowedKey) -> bool {
        match (&self.user_id, &other.user_id) {
            (Some(a), Some(b)) => a == b,
            _ => match (&self.passkey_pub_key, &other.passkey_pub_key) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub agent: String,
    pub owner: Option<String>,
    pub started_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelMessage {
    #[serde(rename = "wing.info")]
    WingInfo {},

    #[serde(rename = "dir.list")]
    DirList { path: String },

    #[serde(rename = "sessions.list")]
    SessionsList {},

    #[serde(rename = "sessions.history")]
    SessionsHistory { offset: usize, limit: usize },

    #[serde(rename = "audit.request")]
    AuditRequest { session_id: String, kind: AuditKind },

    #[serde(rename = "egg.config_update")]
    EggConfigUpdate { yaml: String },

    #[serde(rename = "pty.kill")]
    PtyKill { session_id: String },

    #[serde(rename = "wing.update")]
    WingUpdate {},

    #[serde(rename = "passkey.auth")]
    PasskeyAuth {
        credential_id: String,
        authenticator_data: String,
        client_data_json: String,
        signature: String,
    },

    #[serde(rename = "allow.list")]
    AllowList {},

    #[serde(rename = "allow.add")]
    AllowAdd {
        #[serde(default)]
        key: Option<AllowedKey>,
    },

    #[serde(rename = "allow.remove")]
    AllowRemove {
        #[serde(default)]
        key: Option<AllowedKey>,
        #[serde(default)]
        allow_user_id: Option<String>,
    },

    /// Also present on the wire envelope's `TunnelReq.payload`: an inner
    /// message the dispatcher doesn't recognize still decodes (as this
    /// variant) so the response can be a clean `{error: "unknown_type"}`
    /// rather than a decode failure.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Pty,
    Keylog,
}

#[cfg(test)]
#[path = "tunnel_tests.rs"]
mod tests;
