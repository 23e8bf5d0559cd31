// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebAuthn `get`-assertion verification against pinned P-256 public keys,
//! challenge/token generation, and the TTL-gated in-memory auth-token
//! cache.
//!
//! This is intentionally narrow: assertion verification only, against
//! keys the wing already trusts via its allow-list. No registration
//! ceremony, no attestation — the wing never enrolls a new credential
//! itself.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use wire::ErrorCode;

#[derive(Deserialize)]
struct ClientData<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    challenge: &'a str,
}

/// A pinned raw P-256 public key: 32-byte X followed by 32-byte Y,
/// uncompressed affine coordinates with no SEC1 tag byte.
pub fn verify_assertion(
    pinned_pub_raw: &[u8; 64],
    challenge: &[u8; 32],
    client_data_json: &[u8],
    authenticator_data: &[u8],
    signature_der: &[u8],
) -> Result<(), ErrorCode> {
    let client_data: ClientData =
        serde_json::from_slice(client_data_json).map_err(|_| ErrorCode::NotAuthorized)?;
    if client_data.kind != "webauthn.get" {
        return Err(ErrorCode::NotAuthorized);
    }
    let presented_challenge = URL_SAFE_NO_PAD
        .decode(client_data.challenge)
        .map_err(|_| ErrorCode::NotAuthorized)?;
    if presented_challenge != challenge {
        return Err(ErrorCode::NotAuthorized);
    }

    let client_data_hash = Sha256::digest(client_data_json);
    let mut signed = Vec::with_capacity(authenticator_data.len() + client_data_hash.len());
    signed.extend_from_slice(authenticator_data);
    signed.extend_from_slice(&client_data_hash);

    // Uncompressed SEC1 point: 0x04 || X(32) || Y(32).
    let mut sec1 = [0u8; 65];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(pinned_pub_raw);
    let verifying_key =
        VerifyingKey::from_sec1_bytes(&sec1).map_err(|_| ErrorCode::NotAuthorized)?;
    let signature = Signature::from_der(signature_der).map_err(|_| ErrorCode::NotAuthorized)?;

    verifying_key
        .verify(&signed, &signature)
        .map_err(|_| ErrorCode::NotAuthorized)
}

/// 32 random bytes for a fresh WebAuthn challenge.
pub fn generate_challenge() -> [u8; 32] {
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// 32 random bytes, hex-encoded, as a fresh bearer auth token.
pub fn generate_auth_token() -> String {
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Render a pinned raw public key as base64, the shape used in
/// [`wire::tunnel::AllowedKey::passkey_pub_key`].
pub fn encode_pub_key(raw: &[u8; 64]) -> String {
    STANDARD.encode(raw)
}

struct CacheEntry {
    pub_key_b64: String,
    created: Instant,
}

/// In-memory TTL-gated cache mapping an auth token to the public key it
/// was issued for. Always boot-scoped — wing restart invalidates every
/// entry, by construction (it's just a `HashMap` living in process
/// memory).
#[derive(Default)]
pub struct AuthCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, token: String, pub_key_b64: String) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            token,
            CacheEntry {
                pub_key_b64,
                created: Instant::now(),
            },
        );
    }

    /// Returns the pubkey for `token` if present and, when `ttl_secs > 0`,
    /// not older than `ttl_secs`. An expired entry is evicted on the spot.
    pub fn check(&self, token: &str, ttl_secs: u64) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(token)?;
        if ttl_secs != 0 && entry.created.elapsed() > Duration::from_secs(ttl_secs) {
            entries.remove(token);
            return None;
        }
        Some(entry.pub_key_b64.clone())
    }
}

#[cfg(test)]
#[path = "passkey_tests.rs"]
mod tests;
