// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `RelayClient`: the single authenticated WebSocket to the roost relay.
//! Connects, registers, demuxes inbound envelopes to per-session
//! [`PTYBridge`]s or the [`TunnelDispatcher`], and reconnects with
//! backoff+jitter on disconnect, reclaiming surviving sessions via
//! [`SessionRegistry`] each time.
//!
//! Modeled on this repo's own upstream WS bridge: a single `run_loop` with
//! one `tokio::select!` handling both the read half and a writer-feeding
//! channel, reconnecting with exponential backoff on either side closing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wire::{Envelope, ErrorCode};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use crate::bridge::PTYBridge;
use crate::eggrpc;
use crate::keyengine::KeyEngine;
use crate::passkey::{self, AuthCache};
use crate::registry::SessionRegistry;
use crate::reload::ConfigState;
use crate::spawner::EggSpawner;
use crate::tunnel::{DispatchResponse, TunnelDispatcher};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// If a single outbound frame can't be written within this long, the
/// writer gives up on the connection rather than let the queue pile up
/// behind a stalled relay.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything `Register` needs to describe this wing, fixed for the
/// process lifetime (labels/locked/allowed_count are read live from
/// `ConfigState` at each (re)connect instead).
pub struct WingIdentity {
    pub wing_id: String,
    pub hostname: String,
    pub platform: String,
    pub version: String,
    pub agents: Vec<String>,
    pub skills: Vec<String>,
    pub root_dir: String,
    pub org_slug: Option<String>,
}

/// A `pty.start` deferred behind a `passkey.challenge` because the sender
/// wasn't otherwise admitted but did present a `passkey_credential_id`,
/// inviting a WebAuthn round trip instead of an outright rejection.
/// `pty.attach` has no such field on the wire, so it has no deferred path —
/// it's admitted up front or rejected.
struct PendingStart {
    agent: String,
    cwd: String,
    rows: u16,
    cols: u16,
    public_key: String,
    user_id: Option<String>,
}

pub struct RelayClient {
    url: String,
    identity: WingIdentity,
    key_engine: Arc<KeyEngine>,
    config: Arc<ConfigState>,
    auth_cache: Arc<AuthCache>,
    spawner: Arc<EggSpawner>,
    registry: Arc<SessionRegistry>,
    tunnel: Arc<TunnelDispatcher>,
    bridges: Arc<Mutex<HashMap<String, Arc<PTYBridge>>>>,
    pending_auth: Mutex<HashMap<String, ([u8; 32], PendingStart)>>,
    outbound_tx: mpsc::UnboundedSender<Envelope>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    cancel: CancellationToken,
}

impl RelayClient {
    pub fn new(
        url: String,
        identity: WingIdentity,
        key_engine: Arc<KeyEngine>,
        config: Arc<ConfigState>,
        auth_cache: Arc<AuthCache>,
        spawner: Arc<EggSpawner>,
        registry: Arc<SessionRegistry>,
        tunnel: Arc<TunnelDispatcher>,
        bridges: Arc<Mutex<HashMap<String, Arc<PTYBridge>>>>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            url,
            identity,
            key_engine,
            config,
            auth_cache,
            spawner,
            registry,
            tunnel,
            bridges,
            pending_auth: Mutex::new(HashMap::new()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            cancel,
        })
    }

    /// An outbound handle any `PTYBridge` this client creates should be
    /// given, so its frames feed the one shared WS writer.
    pub fn outbound(&self) -> mpsc::UnboundedSender<Envelope> {
        self.outbound_tx.clone()
    }

    /// Re-send `Register` with the current `locked`/`allowed_count`/
    /// `labels` — called once per connect and again whenever
    /// `ConfigState::install_sighup` signals a reload.
    async fn register_envelope(&self) -> Envelope {
        Envelope::Register {
            wing_id: self.identity.wing_id.clone(),
            hostname: self.identity.hostname.clone(),
            platform: self.identity.platform.clone(),
            version: self.identity.version.clone(),
            agents: self.identity.agents.clone(),
            skills: self.identity.skills.clone(),
            labels: self.config.labels().await,
            projects: Vec::new(),
            root_dir: self.identity.root_dir.clone(),
            locked: self.config.locked().await,
            allowed_count: self.config.allow_keys().await.len(),
            org_slug: self.identity.org_slug.clone(),
        }
    }

    /// Run the connect/register/reconnect loop until `cancel` fires.
    /// `registration_rx` carries a notification each time the wing wants
    /// `Register` re-sent without a full reconnect (a `SIGHUP` reload).
    pub async fn run(self: Arc<Self>, mut registration_rx: mpsc::UnboundedReceiver<()>) {
        let mut backoff = INITIAL_BACKOFF;
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .expect("RelayClient::run called more than once");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match tokio_tungstenite::connect_async(&self.url).await {
                Ok((ws_stream, _)) => {
                    info!(url = %self.url, "connected to roost relay");
                    backoff = INITIAL_BACKOFF;

                    let (mut write, mut read) = ws_stream.split();

                    let register = self.register_envelope().await;
                    if send_one(&mut write, &register).await.is_err() {
                        continue;
                    }

                    self.reclaim().await;

                    loop {
                        tokio::select! {
                            _ = self.cancel.cancelled() => return,

                            _ = registration_rx.recv() => {
                                let register = self.register_envelope().await;
                                if send_one(&mut write, &register).await.is_err() {
                                    break;
                                }
                            }

                            frame = read.next() => {
                                match frame {
                                    Some(Ok(Message::Text(text))) => {
                                        self.handle_inbound(text.as_ref()).await;
                                    }
                                    Some(Ok(Message::Close(_))) | None => {
                                        debug!("relay WS closed");
                                        break;
                                    }
                                    Some(Err(e)) => {
                                        debug!(err = %e, "relay WS read error");
                                        break;
                                    }
                                    _ => {}
                                }
                            }

                            outbound = outbound_rx.recv() => {
                                match outbound {
                                    Some(envelope) => {
                                        if send_one(&mut write, &envelope).await.is_err() {
                                            break;
                                        }
                                    }
                                    None => return, // every sender dropped
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(err = %e, "relay connect failed, retrying");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(jittered(backoff)) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// On every (re)connect: walk the session registry, and for each
    /// session surviving on disk with no in-memory bridge yet, dial its
    /// egg and register a placeholder bridge awaiting a browser attach.
    async fn reclaim(&self) {
        let alive = match self.registry.list_alive() {
            Ok(alive) => alive,
            Err(e) => {
                warn!("listing sessions to reclaim: {e}");
                return;
            }
        };
        for summary in alive {
            let mut bridges = self.bridges.lock().await;
            if bridges.contains_key(&summary.session_id) {
                continue;
            }
            let sd = wire::SessionDir::new(&self.spawner_config_dir(), &summary.session_id);
            let Ok(token) = std::fs::read_to_string(sd.token()) else {
                continue;
            };
            let Ok(client) = eggrpc::connect(sd.sock(), token.trim()).await else {
                continue;
            };
            let bridge = PTYBridge::new(
                summary.session_id.clone(),
                summary.agent.clone(),
                summary.owner.clone(),
                self.outbound(),
                self.key_engine.clone(),
            );
            bridge.adopt_client(client).await;
            info!(session = %summary.session_id, "reclaimed surviving session");
            bridges.insert(summary.session_id, bridge);
        }
    }

    fn spawner_config_dir(&self) -> std::path::PathBuf {
        self.spawner.config_dir().to_path_buf()
    }

    async fn handle_inbound(&self, text: &str) {
        let Some(kind) = Envelope::peek_type(text) else {
            return;
        };
        if kind == "tunnel.req" {
            self.handle_tunnel_req(text).await;
            return;
        }
        let Ok(envelope) = serde_json::from_str::<Envelope>(text) else {
            return;
        };
        self.handle_session_envelope(envelope).await;
    }

    async fn handle_tunnel_req(&self, text: &str) {
        let Ok(Envelope::TunnelReq {
            request_id,
            sender_pub,
            sender_user_id,
            sender_org_role,
            payload,
        }) = serde_json::from_str::<Envelope>(text)
        else {
            return;
        };
        let result = self
            .tunnel
            .dispatch(
                &sender_pub,
                sender_user_id.as_deref(),
                sender_org_role.as_deref(),
                &payload,
            )
            .await;
        match result {
            Ok(DispatchResponse::Single(payload)) => {
                let _ = self.outbound_tx.send(Envelope::TunnelRes { request_id, payload });
            }
            Ok(DispatchResponse::Stream(chunks)) => {
                let last = chunks.len().saturating_sub(1);
                for (i, payload) in chunks.into_iter().enumerate() {
                    let _ = self.outbound_tx.send(Envelope::TunnelStream {
                        request_id: request_id.clone(),
                        payload,
                        done: i == last,
                    });
                }
            }
            Err(e) => {
                warn!(err = %e, "tunnel dispatch failed before a response could be sealed");
            }
        }
    }

    async fn handle_session_envelope(&self, envelope: Envelope) {
        match envelope {
            Envelope::PtyStart {
                session_id,
                agent,
                cwd,
                rows,
                cols,
                public_key,
                user_id,
                passkey_credential_id,
                auth_token,
            } => {
                self.start_session(
                    session_id,
                    agent,
                    cwd,
                    rows,
                    cols,
                    public_key,
                    user_id,
                    passkey_credential_id,
                    auth_token,
                )
                .await;
            }
            Envelope::PtyAttach {
                session_id,
                public_key,
                auth_token,
            } => {
                if self.config.locked().await
                    && !self
                        .config
                        .is_admitted(&self.auth_cache, &public_key, None, auth_token.as_deref())
                        .await
                {
                    self.send_error(&session_id, ErrorCode::NotAuthorized);
                    return;
                }
                if let Some(bridge) = self.bridges.lock().await.get(&session_id).cloned() {
                    if let Err(e) = bridge.reattach(&public_key, auth_token).await {
                        warn!(session = %session_id, ?e, "reattach failed");
                    }
                } else {
                    self.send_error(&session_id, ErrorCode::Fatal);
                }
            }
            Envelope::PtyInput { session_id, data } => {
                if let Some(bridge) = self.bridges.lock().await.get(&session_id).cloned() {
                    if let Err(e) = bridge.input(&data).await {
                        warn!(session = %session_id, ?e, "input rejected");
                    }
                }
            }
            Envelope::PtyResize { session_id, rows, cols } => {
                if let Some(bridge) = self.bridges.lock().await.get(&session_id).cloned() {
                    let _ = bridge.resize(rows, cols).await;
                }
            }
            Envelope::PtyKill { session_id } => {
                if let Some(bridge) = self.bridges.lock().await.get(&session_id).cloned() {
                    if let Err(e) = bridge.kill().await {
                        warn!(session = %session_id, "kill failed: {e}");
                    }
                }
            }
            Envelope::PtyAttentionAck { session_id } => {
                if let Some(bridge) = self.bridges.lock().await.get(&session_id).cloned() {
                    bridge.ack_attention().await;
                }
            }
            Envelope::PasskeyResponse {
                session_id,
                authenticator_data,
                client_data_json,
                signature,
                ..
            } => {
                self.handle_passkey_response(&session_id, &authenticator_data, &client_data_json, &signature)
                    .await;
            }
            // Sent by us, never received from the relay.
            Envelope::Register { .. }
            | Envelope::PtyStarted { .. }
            | Envelope::PtyOutput { .. }
            | Envelope::PtyExited { .. }
            | Envelope::SessionAttention { .. }
            | Envelope::PasskeyChallenge { .. }
            | Envelope::TunnelReq { .. }
            | Envelope::TunnelRes { .. }
            | Envelope::TunnelStream { .. } => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_session(
        &self,
        session_id: String,
        agent: String,
        cwd: String,
        rows: u16,
        cols: u16,
        public_key: String,
        user_id: Option<String>,
        passkey_credential_id: Option<String>,
        auth_token: Option<String>,
    ) {
        let admitted = !self.config.locked().await
            || self
                .config
                .is_admitted(&self.auth_cache, &public_key, user_id.as_deref(), auth_token.as_deref())
                .await;

        if !admitted {
            if passkey_credential_id.is_some() && self.has_passkey_keys().await {
                self.challenge_and_defer(
                    session_id,
                    PendingStart {
                        agent,
                        cwd,
                        rows,
                        cols,
                        public_key,
                        user_id,
                    },
                )
                .await;
                return;
            }
            self.send_error(&session_id, ErrorCode::NotAuthorized);
            return;
        }

        self.spawn_session(session_id, agent, cwd, rows, cols, public_key, user_id, auth_token)
            .await;
    }

    async fn has_passkey_keys(&self) -> bool {
        self.config
            .allow_keys()
            .await
            .iter()
            .any(|k| k.passkey_pub_key.is_some())
    }

    async fn challenge_and_defer(&self, session_id: String, pending: PendingStart) {
        let challenge = passkey::generate_challenge();
        self.pending_auth.lock().await.insert(session_id.clone(), (challenge, pending));
        let _ = self.outbound_tx.send(Envelope::PasskeyChallenge {
            session_id,
            challenge: B64.encode(challenge),
        });
    }

    async fn handle_passkey_response(
        &self,
        session_id: &str,
        authenticator_data_b64: &str,
        client_data_json_b64: &str,
        signature_b64: &str,
    ) {
        let Some((challenge, pending)) = self.pending_auth.lock().await.remove(session_id) else {
            self.send_error(session_id, ErrorCode::NotAuthorized);
            return;
        };

        let (Ok(authenticator_data), Ok(client_data_json), Ok(signature)) = (
            B64.decode(authenticator_data_b64),
            B64.decode(client_data_json_b64),
            B64.decode(signature_b64),
        ) else {
            self.send_error(session_id, ErrorCode::NotAuthorized);
            return;
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
            passkey::verify_assertion(&raw64, &challenge, &client_data_json, &authenticator_data, &signature).is_ok()
        });

        if !verified {
            self.send_error(session_id, ErrorCode::NotAuthorized);
            return;
        }

        let token = passkey::generate_auth_token();
        self.auth_cache.put(token.clone(), pending.public_key.clone());

        let PendingStart {
            agent,
            cwd,
            rows,
            cols,
            public_key,
            user_id,
        } = pending;
        self.spawn_session(
            session_id.to_string(),
            agent,
            cwd,
            rows,
            cols,
            public_key,
            user_id,
            Some(token),
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn spawn_session(
        &self,
        session_id: String,
        agent: String,
        cwd: String,
        rows: u16,
        cols: u16,
        public_key: String,
        user_id: Option<String>,
        auth_token: Option<String>,
    ) {
        let defaults = self.config.egg_defaults().await;
        let spec = wire::SpawnSpec {
            session_id: session_id.clone(),
            command: vec![agent.clone()],
            agent: agent.clone(),
            cwd,
            rows,
            cols,
            env: HashMap::new(),
            sandbox: defaults.sandbox,
            audit: self.config.audit(),
            idle_timeout_secs: self.config.idle_timeout_secs().await,
            ring_capacity: defaults.ring_capacity,
            config_dir: self.spawner_config_dir(),
        };

        let bridge = PTYBridge::new(
            session_id.clone(),
            agent,
            user_id,
            self.outbound(),
            self.key_engine.clone(),
        );
        self.bridges.lock().await.insert(session_id.clone(), bridge.clone());

        if let Err(e) = bridge.start(&self.spawner, spec, &public_key, auth_token).await {
            self.send_error(&session_id, e);
            self.bridges.lock().await.remove(&session_id);
        }
    }

    fn send_error(&self, session_id: &str, code: ErrorCode) {
        warn!(session = session_id, ?code, "session error");
        let _ = self.outbound_tx.send(Envelope::PtyExited {
            session_id: session_id.to_string(),
            exit_code: -1,
            error: Some(code.as_str().to_string()),
        });
    }
}

async fn send_one<S>(write: &mut S, envelope: &Envelope) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let Ok(text) = serde_json::to_string(envelope) else {
        return Ok(());
    };
    match tokio::time::timeout(WRITE_TIMEOUT, write.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

fn jittered(base: Duration) -> Duration {
    let ceiling = base.as_millis() as u64 / 4 + 1;
    let jitter_ms = rand::rng().random_range(0..=ceiling);
    base + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
#[path = "relay_tests.rs"]
mod tests;
