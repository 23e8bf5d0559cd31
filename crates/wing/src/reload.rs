// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `ConfigState`: the live, hot-reloadable view of `wing.yaml`. A `SIGHUP`
//! re-reads the file and swaps in new state; `allow.add`/`allow.remove`
//! mutate it in place and persist the result.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use wire::tunnel::AllowedKey;

use crate::config::{EggDefaults, WingPolicy};
use crate::passkey::AuthCache;

struct AllowAndLocked {
    allow_keys: Vec<AllowedKey>,
    locked: bool,
    auth_ttl_secs: u64,
    idle_timeout_secs: u64,
    paths: Vec<PathBuf>,
    labels: Vec<String>,
}

impl From<&WingPolicy> for AllowAndLocked {
    fn from(p: &WingPolicy) -> Self {
        Self {
            allow_keys: p.allow_keys.clone(),
            locked: p.locked,
            auth_ttl_secs: p.auth_ttl_secs,
            idle_timeout_secs: p.idle_timeout_secs,
            paths: p.paths.clone(),
            labels: p.labels.clone(),
        }
    }
}

/// Owns `wing.yaml`'s live state. `audit`/`debug` are plain atomics since
/// they're read on every PTY output frame and egg spawn; everything else
/// sits behind its own lock, swapped as a unit on reload.
pub struct ConfigState {
    policy_path: PathBuf,
    audit: AtomicBool,
    debug: AtomicBool,
    allow_and_locked: RwLock<AllowAndLocked>,
    egg_defaults: RwLock<EggDefaults>,
}

impl ConfigState {
    pub fn load(config_dir: &std::path::Path) -> anyhow::Result<Arc<Self>> {
        let policy_path = config_dir.join("wing.yaml");
        let policy = WingPolicy::load(&policy_path)?;
        Ok(Arc::new(Self {
            policy_path,
            audit: AtomicBool::new(policy.audit),
            debug: AtomicBool::new(policy.debug),
            allow_and_locked: RwLock::new(AllowAndLocked::from(&policy)),
            egg_defaults: RwLock::new(policy.egg),
        }))
    }

    pub fn audit(&self) -> bool {
        self.audit.load(Ordering::Relaxed)
    }

    pub fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub async fn locked(&self) -> bool {
        self.allow_and_locked.read().await.locked
    }

    pub async fn allow_keys(&self) -> Vec<AllowedKey> {
        self.allow_and_locked.read().await.allow_keys.clone()
    }

    pub async fn auth_ttl_secs(&self) -> u64 {
        self.allow_and_locked.read().await.auth_ttl_secs
    }

    pub async fn idle_timeout_secs(&self) -> u64 {
        self.allow_and_locked.read().await.idle_timeout_secs
    }

    pub async fn paths(&self) -> Vec<PathBuf> {
        self.allow_and_locked.read().await.paths.clone()
    }

    pub async fn labels(&self) -> Vec<String> {
        self.allow_and_locked.read().await.labels.clone()
    }

    pub async fn egg_defaults(&self) -> EggDefaults {
        self.egg_defaults.read().await.clone()
    }

    /// Admission check shared by the tunnel dispatcher and the per-session
    /// data plane: admitted either by a standing allow-list entry
    /// (matched by `user_id` when present, else by public key), by
    /// holding a still-valid passkey auth token cached under `sender_pub`
    /// itself (the tunnel fast path — decrypting a `tunnel.req` already
    /// proves possession of `sender_pub`'s private key), or, when the
    /// caller presents one, by a minted `auth_token` that `auth_cache`
    /// still maps back to this `sender_pub`.
    pub async fn is_admitted(
        &self,
        auth_cache: &AuthCache,
        sender_pub: &str,
        sender_user_id: Option<&str>,
        auth_token: Option<&str>,
    ) -> bool {
        let candidate = AllowedKey {
            passkey_pub_key: Some(sender_pub.to_string()),
            user_id: sender_user_id.map(str::to_string),
            email: None,
        };
        if self.allow_keys().await.iter().any(|k| k.matches(&candidate)) {
            return true;
        }
        let ttl = self.auth_ttl_secs().await;
        if auth_cache.check(sender_pub, ttl).is_some() {
            return true;
        }
        match auth_token {
            Some(token) => auth_cache.check(token, ttl).as_deref() == Some(sender_pub),
            None => false,
        }
    }

    pub async fn update_egg_defaults(&self, new: EggDefaults) -> anyhow::Result<()> {
        *self.egg_defaults.write().await = new;
        self.persist().await
    }

    /// Add `key` unless an equivalent one is already present (by
    /// [`AllowedKey::matches`]).
    pub async fn allow_add(&self, key: AllowedKey) -> anyhow::Result<()> {
        let mut guard = self.allow_and_locked.write().await;
        if !guard.allow_keys.iter().any(|k| k.matches(&key)) {
            guard.allow_keys.push(key);
        }
        drop(guard);
        self.persist().await
    }

    /// Remove every allow-list entry matching `key`, or matching
    /// `allow_user_id` by `user_id` — whichever selector is given.
    pub async fn allow_remove(
        &self,
        key: Option<AllowedKey>,
        allow_user_id: Option<String>,
    ) -> anyhow::Result<()> {
        let mut guard = self.allow_and_locked.write().await;
        guard.allow_keys.retain(|existing| {
            if let Some(ref k) = key {
                if existing.matches(k) {
                    return false;
                }
            }
            if let Some(ref uid) = allow_user_id {
                if existing.user_id.as_deref() == Some(uid.as_str()) {
                    return false;
                }
            }
            true
        });
        drop(guard);
        self.persist().await
    }

    async fn snapshot(&self) -> WingPolicy {
        let guard = self.allow_and_locked.read().await;
        WingPolicy {
            allow_keys: guard.allow_keys.clone(),
            locked: guard.locked,
            paths: guard.paths.clone(),
            labels: guard.labels.clone(),
            audit: self.audit(),
            debug: self.debug(),
            auth_ttl_secs: guard.auth_ttl_secs,
            idle_timeout_secs: guard.idle_timeout_secs,
            egg: self.egg_defaults.read().await.clone(),
        }
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let policy = self.snapshot().await;
        let yaml = serde_yaml::to_string(&policy)
            .map_err(|e| anyhow::anyhow!("serializing wing.yaml: {e}"))?;
        std::fs::write(&self.policy_path, yaml)
            .map_err(|e| anyhow::anyhow!("writing {:?}: {e}", self.policy_path))
    }

    /// Re-read `wing.yaml` from disk and swap it in wholesale. Used on
    /// `SIGHUP`, and directly by tests that need to simulate one.
    pub(crate) async fn reload_from_disk(&self) -> anyhow::Result<()> {
        let policy = WingPolicy::load(&self.policy_path)?;
        self.audit.store(policy.audit, Ordering::Relaxed);
        self.debug.store(policy.debug, Ordering::Relaxed);
        *self.allow_and_locked.write().await = AllowAndLocked::from(&policy);
        *self.egg_defaults.write().await = policy.egg;
        Ok(())
    }

    /// Install the `SIGHUP` handler. `registration_tx` is notified after
    /// every successful reload so `RelayClient` can re-send `Register`
    /// with the new `locked`/`allowed_count`/`labels`.
    pub fn install_sighup(self: Arc<Self>, registration_tx: mpsc::UnboundedSender<()>) {
        tokio::spawn(async move {
            let Ok(mut stream) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                warn!("failed to install SIGHUP handler");
                return;
            };
            loop {
                stream.recv().await;
                match self.reload_from_disk().await {
                    Ok(()) => {
                        info!("reloaded wing.yaml");
                        let _ = registration_tx.send(());
                    }
                    Err(e) => warn!("failed to reload wing.yaml: {e}"),
                }
            }
        });
    }
}

#[cfg(test)]
#[path = "reload_tests.rs"]
mod tests;
