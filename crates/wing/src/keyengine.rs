// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! X25519 keypair persistence, HKDF-SHA256 key derivation per purpose
//! label, and AES-256-GCM encrypt/decrypt.
//!
//! Splitting the derived AEAD by `info` label (`"wt-pty"` vs `"wt-tunnel"`)
//! means a ciphertext captured on one channel cannot be replayed onto the
//! other even though both derive from the same ECDH shared secret with the
//! same peer — that's [`crate::keyengine::PTY_INFO`]/[`TUNNEL_INFO`]'s whole
//! job.

use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use aes_gcm::aead::{Aead as _, AeadCore, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use wire::ErrorCode;

/// Info label for the per-session PTY channel.
pub const PTY_INFO: &[u8] = b"wt-pty";
/// Info label for the control tunnel.
pub const TUNNEL_INFO: &[u8] = b"wt-tunnel";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HKDF_SALT: [u8; 32] = [0u8; 32];

/// A derived AES-256-GCM key, scoped to one peer public key and one
/// purpose label. Never reused across browser attach/reattach cycles
/// — callers derive a fresh one on every `pty.attach`.
#[derive(Clone)]
pub struct Aead {
    key: [u8; 32],
}

impl Drop for Aead {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl Aead {
    /// Encrypt with a fresh random 96-bit nonce, returning
    /// `base64(nonce || ciphertext || tag)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
        // encrypt() only fails on buffer-length mismatches, which cannot
        // happen with aes-gcm's owned-Vec API.
        #[allow(clippy::unwrap_used)]
        let ct = cipher.encrypt(&nonce, plaintext).unwrap();
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ct);
        B64.encode(out)
    }

    /// Decrypt a `base64(nonce || ciphertext || tag)` frame produced by
    /// [`Self::encrypt`] (on either side of the same derivation).
    pub fn decrypt(&self, frame_b64: &str) -> Result<Vec<u8>, ErrorCode> {
        let raw = B64.decode(frame_b64).map_err(|_| ErrorCode::AeadFailure)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(ErrorCode::AeadFailure);
        }
        let (nonce_bytes, ct) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        cipher.decrypt(nonce, ct).map_err(|_| ErrorCode::AeadFailure)
    }
}

/// X25519 identity for this wing, persisted base64-encoded at mode 0600.
pub struct KeyEngine {
    secret: StaticSecret,
    public_b64: String,
}

impl KeyEngine {
    /// Load the private key from `path`, generating and persisting a new
    /// one if it doesn't exist yet.
    pub fn load_or_generate(path: &Path) -> anyhow::Result<Self> {
        let secret = match std::fs::read_to_string(path) {
            Ok(raw) => {
                let bytes = B64
                    .decode(raw.trim())
                    .map_err(|e| anyhow::anyhow!("decoding {path:?}: {e}"))?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("{path:?} is not a 32-byte key"))?;
                StaticSecret::from(arr)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut bytes = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut bytes);
                let secret = StaticSecret::from(bytes);
                let encoded = B64.encode(secret.to_bytes());
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut file = std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(0o600)
                    .open(path)
                    .map_err(|e| anyhow::anyhow!("creating {path:?}: {e}"))?;
                file.write_all(encoded.as_bytes())?;
                secret
            }
            Err(e) => return Err(anyhow::anyhow!("reading {path:?}: {e}")),
        };

        let public_b64 = B64.encode(PublicKey::from(&secret).to_bytes());
        Ok(Self { secret, public_b64 })
    }

    /// This wing's X25519 public key, base64-encoded. Idempotent.
    pub fn public_key(&self) -> &str {
        &self.public_b64
    }

    /// ECDH with `peer_pub_b64`, then HKDF-SHA256 (salt = 32 zero bytes,
    /// info = `info_label`) into an AES-256-GCM key.
    pub fn derive_shared(&self, peer_pub_b64: &str, info_label: &[u8]) -> Result<Aead, ErrorCode> {
        let peer_bytes = B64
            .decode(peer_pub_b64)
            .map_err(|_| ErrorCode::KeyExchange)?;
        let peer_arr: [u8; 32] = peer_bytes.try_into().map_err(|_| ErrorCode::KeyExchange)?;
        let peer_pub = PublicKey::from(peer_arr);
        let shared = self.secret.diffie_hellman(&peer_pub);

        let hk = Hkdf::<Sha256>::new(Some(&HKDF_SALT), shared.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(info_label, &mut key)
            .map_err(|_| ErrorCode::KeyExchange)?;
        Ok(Aead { key })
    }
}

#[cfg(test)]
#[path = "keyengine_tests.rs"]
mod tests;
