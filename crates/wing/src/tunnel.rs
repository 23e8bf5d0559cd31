// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `TunnelDispatcher`: the wing-side handler for the control-plane
//! `tunnel.req`/`tunnel.res` envelopes. Every request's `payload` is sealed
//! under a per-sender AES-256-GCM key derived the same way as the PTY
//! channel (`wt-tunnel` instead of `wt-pty`) — decrypting successfully
//! *is* the proof that `sender_pub` is genuine, since only the holder of
//! the matching private key derives the same ECDH shared secret this wing
//! does.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;

use wire::tunnel::{AllowedKey, AuditKind, TunnelMessage};
use wire::ErrorCode;

use crate::bridge::PTYBridge;
use crate::config::EggDefaults;
use crate::keyengine::{Aead, KeyEngine, TUNNEL_INFO};
use crate::passkey::{self, AuthCache};
use crate::registry::SessionRegistry;
use crate::reload::ConfigState;

/// `sender_org_role` values trusted to bypass the allow-list when adding
/// or removing other allow-list entries. Everyone else must already be
/// admitted (or use `passkey.auth` to become admitted) before they can
/// touch the allow-list — an Open Question resolved this way because
/// nothing else in the envelope proves organizational privilege.
fn privileged(role: Option<&str>) -> bool {
    matches!(role, Some("owner") | Some("admin"))
}

fn visible_to(sender_org_role: Option<&str>, sender_user_id: Option<&str>, owner: &Option<String>) -> bool {
    if sender_org_role != Some("member") {
        return true;
    }
    owner.as_deref() == sender_user_id && sender_user_id.is_some()
}

/// Plaintext chunk ceiling for `audit.request` streaming — each chunk is
/// sealed individually, so the ciphertext a single `tunnel.stream` frame
/// carries stays bounded too.
const MAX_AUDIT_CHUNK: usize = 32 * 1024;

/// What [`TunnelDispatcher::dispatch`] produces: most requests answer with
/// one sealed `tunnel.res` payload, but `audit.request` streams the file
/// across one or more sealed `tunnel.stream` payloads, the last of which
/// the caller must mark `done`.
pub enum DispatchResponse {
    Single(String),
    Stream(Vec<String>),
}

pub struct TunnelDispatcher {
    wing_id: String,
    config_dir: PathBuf,
    key_engine: Arc<KeyEngine>,
    config: Arc<ConfigState>,
    auth_cache: Arc<AuthCache>,
    registry: Arc<SessionRegistry>,
    bridges: Arc<Mutex<HashMap<String, Arc<PTYBridge>>>>,
    sender_keys: StdMutex<HashMap<String, Aead>>,
    challenges: StdMutex<HashMap<String, [u8; 32]>>,
}

impl TunnelDispatcher {
    pub fn new(
        wing_id: String,
        config_dir: PathBuf,
        key_engine: Arc<KeyEngine>,
        config: Arc<ConfigState>,
        auth_cache: Arc<AuthCache>,
        registry: Arc<SessionRegistry>,
        bridges: Arc<Mutex<HashMap<String, Arc<PTYBridge>>>>,
    ) -> Self {
        Self {
            wing_id,
            config_dir,
            key_engine,
            config,
            auth_cache,
            registry,
            bridges,
            sender_keys: StdMutex::new(HashMap::new()),
            challenges: StdMutex::new(HashMap::new()),
        }
    }

    fn sender_aead(&self, sender_pub: &str) -> Result<Aead, ErrorCode> {
        if let Some(aead) = self.sender_keys.lock().unwrap_or_else(|e| e.into_inner()).get(sender_pub) {
            return Ok(aead.clone());
        }
        let aead = self.key_engine.derive_shared(sender_pub, TUNNEL_INFO)?;
        self.sender_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sender_pub.to_string(), aead.clone());
        Ok(aead)
    }

    /// Decrypt, admission-check, dispatch, and seal the response. Returns
    /// `Err` only when the request can't even be decrypted — nothing to
    /// seal a response with in that case.
    pub async fn dispatch(
        &self,
        sender_pub: &str,
        sender_user_id: Option<&str>,
        sender_org_role: Option<&str>,
        ciphertext_b64: &str,
    ) -> Result<DispatchResponse, ErrorCode> {
        let aead = self.sender_aead(sender_pub)?;
        let plaintext = aead.decrypt(ciphertext_b64)?;
        let message: TunnelMessage =
            serde_json::from_slice(&plaintext).unwrap_or(TunnelMessage::Unknown);

        let bypass = matches!(message, TunnelMessage::WingInfo {} | TunnelMessage::PasskeyAuth { .. })
            || (matches!(message, TunnelMessage::AllowAdd { .. }) && privileged(sender_org_role));

        let admitted = bypass
            || !self.config.locked().await
            || self
                .config
                .is_admitted(&self.auth_cache, sender_pub, sender_user_id, None)
                .await;

        if !admitted {
            let body = serde_json::to_vec(&json!({ "error": ErrorCode::NotAuthorized.as_str() }))
                .unwrap_or_else(|_| b"{}".to_vec());
            return Ok(DispatchResponse::Single(aead.encrypt(&body)));
        }

        if let TunnelMessage::AuditRequest { session_id, kind } = &message {
            let chunks = self
                .audit_stream(session_id, *kind, sender_user_id, sender_org_role, &aead)
                .await;
            return Ok(DispatchResponse::Stream(chunks));
        }

        let response = self
            .handle(sender_pub, sender_user_id, sender_org_role, message)
            .await;
        let body = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
        Ok(DispatchResponse::Single(aead.encrypt(&body)))
    }

    async fn handle(
        &self,
        sender_pub: &str,
        sender_user_id: Option<&str>,
        sender_org_role: Option<&str>,
        message: TunnelMessage,
    ) -> Value {
        match message {
            TunnelMessage::WingInfo {} => self.wing_info(sender_pub).await,
            TunnelMessage::DirList { path } => self.dir_list(&path).await,
            TunnelMessage::SessionsList {} => {
                self.sessions_list(sender_user_id, sender_org_role).await
            }
            TunnelMessage::SessionsHistory { offset, limit } => {
                self.sessions_history(offset, limit, sender_user_id, sender_org_role)
                    .await
            }
            // `dispatch` special-cases `AuditRequest` before it ever
            // reaches `handle` (it streams, it doesn't return one Value);
            // this arm only exists so the match stays exhaustive.
            TunnelMessage::AuditRequest { .. } => json!({ "error": "unknown_type" }),
            TunnelMessage::EggConfigUpdate { yaml } => self.egg_config_update(&yaml).await,
            TunnelMessage::PtyKill { session_id } => {
                self.pty_kill(&session_id, sender_user_id, sender_org_role).await
            }
            TunnelMessage::WingUpdate {} => json!({ "error": "not_implemented" }),
            TunnelMessage::PasskeyAuth {
                credential_id,
                authenticator_data,
                client_data_json,
                signature,
            } => {
                self.passkey_auth(
                    sender_pub,
                    &credential_id,
                    &authenticator_data,
                    &client_data_json,
                    &signature,
                )
                .await
            }
            TunnelMessage::AllowList {} => {
                json!({ "keys": self.config.allow_keys().await })
            }
            TunnelMessage::AllowAdd { key } => {
                self.allow_add(sender_pub, sender_user_id, sender_org_role, key).await
            }
            TunnelMessage::AllowRemove { key, allow_user_id } => {
                self.allow_remove(sender_pub, sender_user_id, sender_org_role, key, allow_user_id)
                    .await
            }
            TunnelMessage::Unknown => json!({ "error": "unknown_type" }),
        }
    }

    async fn wing_info(&self, sender_pub: &str) -> Value {
        let challenge = passkey::generate_challenge();
        self.challenges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sender_pub.to_string(), challenge);
        json!({
            "wing_id": self.wing_id,
            "version": env!("CARGO_PKG_VERSION"),
            "locked": self.config.locked().await,
            "labels": self.config.labels().await,
            "auth_challenge": B64.encode(challenge),
        })
    }

    async fn dir_list(&self, requested: &str) -> Value {
        let roots = self.config.paths().await;
        let requested_path = PathBuf::from(requested);
        let Ok(canonical) = requested_path.canonicalize() else {
            return json!({ "error": "not_found" });
        };
        let allowed = roots.iter().any(|root| {
            root.canonicalize()
                .map(|r| canonical.starts_with(&r))
                .unwrap_or(false)
        });
        if !allowed {
            return json!({ "error": "not_allowed" });
        }
        let Ok(entries) = std::fs::read_dir(&canonical) else {
            return json!({ "error": "not_found" });
        };
        let listing: Vec<Value> = entries
            .filter_map(|e| e.ok())
            .map(|e| {
                json!({
                    "name": e.file_name().to_string_lossy(),
                    "is_dir": e.path().is_dir(),
                })
            })
            .collect();
        json!({ "entries": listing })
    }

    async fn sessions_list(&self, sender_user_id: Option<&str>, sender_org_role: Option<&str>) -> Value {
        let summaries = self.registry.list_alive().unwrap_or_default();
        let visible: Vec<_> = summaries
            .into_iter()
            .filter(|s| visible_to(sender_org_role, sender_user_id, &s.owner))
            .collect();
        json!({ "sessions": visible })
    }

    async fn sessions_history(
        &self,
        offset: usize,
        limit: usize,
        sender_user_id: Option<&str>,
        sender_org_role: Option<&str>,
    ) -> Value {
        let summaries = self.registry.list_history(offset, limit).unwrap_or_default();
        let visible: Vec<_> = summaries
            .into_iter()
            .filter(|s| visible_to(sender_org_role, sender_user_id, &s.owner))
            .collect();
        json!({ "sessions": visible })
    }

    /// Stream the requested audit file as one or more sealed
    /// `tunnel.stream` payloads, chunked at [`MAX_AUDIT_CHUNK`] plaintext
    /// bytes. `done` is an envelope-level field the caller (`RelayClient`)
    /// sets on the last frame — every `Value` returned here is just that
    /// frame's body, rejection and "not found" included, so the caller
    /// always has exactly one list of frames to send with the last one
    /// marked done regardless of outcome.
    async fn audit_stream(
        &self,
        session_id: &str,
        kind: AuditKind,
        sender_user_id: Option<&str>,
        sender_org_role: Option<&str>,
        aead: &Aead,
    ) -> Vec<String> {
        let seal_one = |body: &Value| aead.encrypt(&serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec()));

        let sd = wire::SessionDir::new(&self.config_dir, session_id);
        let owner = std::fs::read_to_string(sd.owner()).ok();
        if !visible_to(sender_org_role, sender_user_id, &owner) {
            return vec![seal_one(&json!({ "error": ErrorCode::NotAuthorized.as_str() }))];
        }
        let path = match kind {
            AuditKind::Pty => sd.audit_pty(),
            AuditKind::Keylog => sd.audit_log(),
        };
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => return vec![seal_one(&json!({ "error": "not_found" }))],
        };

        if bytes.is_empty() {
            return vec![seal_one(&json!({ "data": "" }))];
        }

        bytes
            .chunks(MAX_AUDIT_CHUNK)
            .map(|chunk| seal_one(&json!({ "data": B64.encode(chunk) })))
            .collect()
    }

    async fn egg_config_update(&self, yaml: &str) -> Value {
        match serde_yaml::from_str::<EggDefaults>(yaml) {
            Ok(defaults) => match self.config.update_egg_defaults(defaults).await {
                Ok(()) => json!({ "ok": true }),
                Err(e) => {
                    warn!("persisting egg config update: {e}");
                    json!({ "error": "fatal" })
                }
            },
            Err(e) => json!({ "error": format!("invalid yaml: {e}") }),
        }
    }

    async fn pty_kill(
        &self,
        session_id: &str,
        sender_user_id: Option<&str>,
        sender_org_role: Option<&str>,
    ) -> Value {
        let sd = wire::SessionDir::new(&self.config_dir, session_id);
        let owner = std::fs::read_to_string(sd.owner()).ok();
        if !visible_to(sender_org_role, sender_user_id, &owner) {
            return json!({ "error": ErrorCode::NotAuthorized.as_str() });
        }
        let bridge = self.bridges.lock().await.get(session_id).cloned();
        match bridge {
            Some(bridge) => match bridge.kill().await {
                Ok(()) => json!({ "ok": true }),
                Err(e) => json!({ "error": e.to_string() }),
            },
            None => json!({ "error": "not_found" }),
        }
    }

    async fn passkey_auth(
        &self,
        sender_pub: &str,
        _credential_id: &str,
        authenticator_data_b64: &str,
        client_data_json_b64: &str,
        signature_b64: &str,
    ) -> Value {
        let Some(challenge) = self
            .challenges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(sender_pub)
        else {
            return json!({ "error": ErrorCode::NotAuthorized.as_str() });
        };

        let (Ok(authenticator_data), Ok(client_data_json), Ok(signature)) = (
            B64.decode(authenticator_data_b64),
            B64.decode(client_data_json_b64),
            B64.decode(signature_b64),
        ) else {
            return json!({ "error": ErrorCode::NotAuthorized.as_str() });
        };

        let allow_keys = self.config.allow_keys().await;
        let verified = allow_keys.iter().any(|k| {
            let Some(pub_b64) = &k.passkey_pub_key else {
                return false;
            };
            let Ok(raw) = B64.decode(pub_b64) else {
                return false;
            };
            let Ok(raw64): Result<[u8; 64], _> = raw.try_into() else {
                return false;
            };
            passkey::verify_assertion(
                &raw64,
                &challenge,
                &client_data_json,
                &authenticator_data,
                &signature,
            )
            .is_ok()
        });

        if !verified {
            return json!({ "error": ErrorCode::NotAuthorized.as_str() });
        }

        // Cached under `sender_pub` itself: decrypting a `tunnel.req`
        // already proves possession of that key, so the tunnel fast path
        // (`ConfigState::is_admitted`) can check straight off `sender_pub`.
        self.auth_cache.put(sender_pub.to_string(), sender_pub.to_string());
        // Also minted and cached as a standalone bearer token, for the
        // session-level flow: a browser presents this back on a later
        // `pty.start`/`pty.attach` that isn't itself an AEAD-proven
        // `tunnel.req`.
        let auth_token = passkey::generate_auth_token();
        self.auth_cache.put(auth_token.clone(), sender_pub.to_string());
        json!({ "authorized": true, "auth_token": auth_token })
    }

    /// Self-service for the caller's own entry; `owner`/`admin` can target
    /// anyone (spec §4.9's `allow.add`/`allow.remove` row). "Own entry"
    /// means the `user_id` being added/removed matches the sender's own
    /// `sender_user_id` — nothing else in the envelope identifies the
    /// caller to a specific allow-list entry.
    fn owns_entry(sender_user_id: Option<&str>, target_user_id: Option<&str>) -> bool {
        matches!((sender_user_id, target_user_id), (Some(a), Some(b)) if a == b)
    }

    async fn allow_add(
        &self,
        _sender_pub: &str,
        sender_user_id: Option<&str>,
        sender_org_role: Option<&str>,
        key: Option<AllowedKey>,
    ) -> Value {
        let Some(key) = key else {
            return json!({ "error": "missing key" });
        };
        if !privileged(sender_org_role) && !Self::owns_entry(sender_user_id, key.user_id.as_deref()) {
            return json!({ "error": ErrorCode::NotAuthorized.as_str() });
        }
        match self.config.allow_add(key).await {
            Ok(()) => json!({ "ok": true }),
            Err(e) => {
                warn!("persisting allow.add: {e}");
                json!({ "error": "fatal" })
            }
        }
    }

    async fn allow_remove(
        &self,
        _sender_pub: &str,
        sender_user_id: Option<&str>,
        sender_org_role: Option<&str>,
        key: Option<AllowedKey>,
        allow_user_id: Option<String>,
    ) -> Value {
        if key.is_none() && allow_user_id.is_none() {
            return json!({ "error": "missing selector" });
        }
        let target_user_id = allow_user_id
            .as_deref()
            .or_else(|| key.as_ref().and_then(|k| k.user_id.as_deref()));
        if !privileged(sender_org_role) && !Self::owns_entry(sender_user_id, target_user_id) {
            return json!({ "error": ErrorCode::NotAuthorized.as_str() });
        }
        match self.config.allow_remove(key, allow_user_id).await {
            Ok(()) => json!({ "ok": true }),
            Err(e) => {
                warn!("persisting allow.remove: {e}");
                json!({ "error": "fatal" })
            }
        }
    }
}

#[cfg(test)]
#[path = "tunnel_tests.rs"]
mod tests;
