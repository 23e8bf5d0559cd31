// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The wing<->relay wire envelope: one JSON object per WebSocket text frame,
//! discriminated by `type`. Decoding is a two-pass affair — peek `type` via
//! [`Envelope::peek_type`], then decode the matching variant — because a
//! single `serde(tag = ...)` enum is sufficient here, but callers that only
//! care about routing (RelayClient's per-session demux) want the session id
//! without paying for a full decode of payloads they'll forward untouched.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: String,
    pub path: String,
    pub mod_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Register {
        wing_id: String,
        hostname: String,
        platform: String,
        version: String,
        agents: Vec<String>,
        skills: Vec<String>,
        labels: Vec<String>,
        projects: Vec<ProjectInfo>,
        root_dir: String,
        locked: bool,
        allowed_count: usize,
        org_slug: Option<String>,
    },

    #[serde(rename = "pty.start")]
    PtyStart {
        session_id: String,
        agent: String,
        cwd: String,
        rows: u16,
        cols: u16,
        public_key: String,
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        passkey_credential_id: Option<String>,
        #[serde(default)]
        auth_token: Option<String>,
    },

    #[serde(rename = "pty.started")]
    PtyStarted {
        session_id: String,
        #[serde(default)]
        agent: Option<String>,
        public_key: String,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        auth_token: Option<String>,
    },

    #[serde(rename = "pty.output")]
    PtyOutput {
        session_id: String,
        data: String,
        #[serde(default)]
        compressed: bool,
    },

    #[serde(rename = "pty.input")]
    PtyInput { session_id: String, data: String },

    #[serde(rename = "pty.resize")]
    PtyResize {
        session_id: String,
        rows: u16,
        cols: u16,
    },

    #[serde(rename = "pty.attach")]
    PtyAttach {
        session_id: String,
        public_key: String,
        #[serde(default)]
        auth_token: Option<String>,
    },

    #[serde(rename = "pty.kill")]
    PtyKill { session_id: String },

    #[serde(rename = "pty.exited")]
    PtyExited {
        session_id: String,
        exit_code: i32,
        #[serde(default)]
        error: Option<String>,
    },

    #[serde(rename = "passkey.challenge")]
    PasskeyChallenge {
        session_id: String,
        challenge: String,
    },

    #[serde(rename = "passkey.response")]
    PasskeyResponse {
        session_id: String,
        credential_id: String,
        authenticator_data: String,
        client_data_json: String,
        signature: String,
    },

    #[serde(rename = "session.attention")]
    SessionAttention { session_id: String },

    #[serde(rename = "pty.attention_ack")]
    PtyAttentionAck { session_id: String },

    #[serde(rename = "tunnel.req")]
    TunnelReq {
        request_id: String,
        sender_pub: String,
        #[serde(default)]
        sender_user_id: Option<String>,
        #[serde(default)]
        sender_org_role: Option<String>,
        payload: String,
    },

    #[serde(rename = "tunnel.res")]
    TunnelRes { request_id: String, payload: String },

    #[serde(rename = "tunnel.stream")]
    TunnelStream {
        request_id: String,
        payload: String,
        done: bool,
    },
}

impl Envelope {
    /// The `session_id` carried by variants that are scoped to one session,
    /// if any — used by RelayClient to demux without a full match.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Envelope::PtyStart { session_id, .. }
            | Envelope::PtyStarted { session_id, .. }
            | Envelope::PtyOutput { session_id, .. }
            | Envelope::PtyInput { session_id, .. }
            | Envelope::PtyResize { session_id, .. }
            | Envelope::PtyAttach { session_id, .. }
            | Envelope::PtyKill { session_id }
            | Envelope::PtyExited { session_id, .. }
            | Envelope::PasskeyChallenge { session_id, .. }
            | Envelope::PasskeyResponse { session_id, .. }
            | Envelope::SessionAttention { session_id }
            | Envelope::PtyAttentionAck { session_id } => Some(session_id),
            Envelope::Register { .. }
            | Envelope::TunnelReq { .. }
            | Envelope::TunnelRes { .. }
            | Envelope::TunnelStream { .. } => None,
        }
    }

    /// Peek the `type` discriminant of a raw JSON frame without decoding
    /// the rest of the payload.
    pub fn peek_type(raw: &str) -> Option<String> {
        #[derive(Deserialize)]
        struct Peek {
            #[serde(rename = "type")]
            kind: String,
        }
        serde_json::from_str::<Peek>(raw).ok().map(|p| p.kind)
    }
}

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;
