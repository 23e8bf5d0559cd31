// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `PTYBridge`: per-session state machine bridging one egg's PTY stream to
//! one browser's encrypted relay connection.
//!
//! The egg RPC surface is accessed only through [`EggInput`]/[`EggOutput`],
//! not `eggrpc::Client` directly — the same seam this repo's `egg::pty`
//! module draws with its `Backend` trait, so the re-key cutover's ordering
//! contract can be unit-tested against a fake session instead of a real
//! subprocess.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use wire::{Envelope, ErrorCode};

use crate::eggrpc;
use crate::keyengine::{Aead, KeyEngine, PTY_INFO};
use crate::spawner::{EggSpawner, SpawnError};

/// Plaintext chunk ceiling for the gzip-then-seal replay frames sent
/// during a re-key cutover.
const MAX_REPLAY_CHUNK: usize = 128 * 1024;
/// Two bell-bearing output chunks within this window raise
/// `session.attention` (see DESIGN.md for why 750ms).
const BELL_WINDOW: Duration = Duration::from_millis(750);

#[derive(Debug)]
pub enum EggFrame {
    Output { data: Vec<u8>, replay: bool },
    Exit { code: Option<i32>, signal: Option<i32> },
}

/// The sending half of an egg session stream: cheaply cloneable, callable
/// concurrently with the receiving half being read by the forwarder task.
#[tonic::async_trait]
pub trait EggInput: Send + Sync {
    async fn input(&self, data: Vec<u8>) -> anyhow::Result<()>;
    async fn resize(&self, rows: u16, cols: u16) -> anyhow::Result<()>;
}

/// The receiving half, consumed exclusively by one forwarder task at a
/// time.
#[tonic::async_trait]
pub trait EggOutput: Send {
    async fn next_frame(&mut self) -> Option<EggFrame>;
}

/// Tracks the bell heuristic: a lone 0x07 in a chunk is an OSC terminator
/// and ignored, but two bell-bearing chunks in quick succession likely
/// mean the agent is asking for attention.
struct BellTracker {
    last_bell_at: Option<Instant>,
    window: Duration,
}

impl BellTracker {
    fn new(window: Duration) -> Self {
        Self {
            last_bell_at: None,
            window,
        }
    }

    /// Returns `true` the moment attention should be raised.
    fn observe(&mut self, chunk: &[u8], now: Instant) -> bool {
        if !chunk.contains(&0x07) {
            return false;
        }
        let raise = self
            .last_bell_at
            .map(|prev| now.saturating_duration_since(prev) <= self.window)
            .unwrap_or(false);
        self.last_bell_at = Some(now);
        raise
    }
}

struct Inner {
    aead: Option<Aead>,
    egg_client: Option<eggrpc::Client>,
    egg_input: Option<Arc<dyn EggInput>>,
    forwarder_cancel: Option<CancellationToken>,
    attention_pending: bool,
    bell: BellTracker,
}

pub struct PTYBridge {
    session_id: String,
    agent: String,
    owner: Option<String>,
    relay_tx: mpsc::UnboundedSender<Envelope>,
    key_engine: Arc<KeyEngine>,
    inner: Mutex<Inner>,
}

impl PTYBridge {
    pub fn new(
        session_id: String,
        agent: String,
        owner: Option<String>,
        relay_tx: mpsc::UnboundedSender<Envelope>,
        key_engine: Arc<KeyEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            agent,
            owner,
            relay_tx,
            key_engine,
            inner: Mutex::new(Inner {
                aead: None,
                egg_client: None,
                egg_input: None,
                forwarder_cancel: None,
                attention_pending: false,
                bell: BellTracker::new(BELL_WINDOW),
            }),
        })
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Reclaim path (startup reap / relay reconnect): the egg process
    /// already exists, so wire up its client directly instead of calling
    /// [`Self::start`], which would spawn a new one. No key is derived
    /// until a browser actually attaches via `reattach`.
    pub async fn adopt_client(self: &Arc<Self>, client: eggrpc::Client) {
        self.inner.lock().await.egg_client = Some(client);
    }

    /// Created -> Attached: spawn a fresh egg and perform the first key
    /// derivation.
    pub async fn start(
        self: &Arc<Self>,
        spawner: &EggSpawner,
        spec: wire::SpawnSpec,
        browser_pub: &str,
        auth_token: Option<String>,
    ) -> Result<(), ErrorCode> {
        let (client, _dir) = spawner
            .spawn(spec, self.owner.as_deref())
            .await
            .map_err(classify_spawn_error)?;

        {
            let mut inner = self.inner.lock().await;
            inner.egg_client = Some(client.clone());
        }

        let (input, output) = eggrpc::open_session(client)
            .await
            .map_err(|_| ErrorCode::EggCrash)?;
        self.attach_session(input, output, browser_pub, auth_token).await
    }

    /// Attached + `pty.attach` (reattach): the atomic re-key cutover.
    /// Follows a fixed six-step ordering; the mutex is acquired only to
    /// swap state, never held across the network calls in between.
    pub async fn reattach(
        self: &Arc<Self>,
        browser_pub: &str,
        auth_token: Option<String>,
    ) -> Result<(), ErrorCode> {
        let client = {
            // Step 1: clear the key and cancel the old forwarder before
            // anything else — from this point until step 6 reinstalls a
            // key, `input()` sees `aead == None` and refuses.
            let mut inner = self.inner.lock().await;
            if let Some(cancel) = inner.forwarder_cancel.take() {
                cancel.cancel();
            }
            inner.aead = None;
            inner.egg_client.clone().ok_or(ErrorCode::Fatal)?
        };

        let (input, output) = eggrpc::open_session(client)
            .await
            .map_err(|_| ErrorCode::EggCrash)?;
        self.attach_session(input, output, browser_pub, auth_token).await
    }

    /// Steps 2-6 common to both first attach and reattach: derive the new
    /// key, announce it, relay the replay snapshot under the new key, then
    /// install the new state and start forwarding live output.
    async fn attach_session(
        self: &Arc<Self>,
        input: Arc<dyn EggInput>,
        mut output: Box<dyn EggOutput>,
        browser_pub: &str,
        auth_token: Option<String>,
    ) -> Result<(), ErrorCode> {
        let new_aead = self.key_engine.derive_shared(browser_pub, PTY_INFO)?;

        self.send_envelope(Envelope::PtyStarted {
            session_id: self.session_id.clone(),
            agent: Some(self.agent.clone()),
            public_key: self.key_engine.public_key().to_string(),
            cwd: None,
            auth_token,
        });

        let replay = match output.next_frame().await {
            Some(EggFrame::Output { data, .. }) => data,
            Some(EggFrame::Exit { .. }) | None => Vec::new(),
        };

        for chunk in replay.chunks(MAX_REPLAY_CHUNK) {
            let compressed = gzip_compress(chunk);
            let frame = new_aead.encrypt(&compressed);
            self.send_envelope(Envelope::PtyOutput {
                session_id: self.session_id.clone(),
                data: frame,
                compressed: true,
            });
        }

        let cancel = CancellationToken::new();
        {
            let mut inner = self.inner.lock().await;
            inner.aead = Some(new_aead);
            inner.egg_input = Some(input);
            inner.forwarder_cancel = Some(cancel.clone());
        }

        self.spawn_forwarder(output, cancel);
        Ok(())
    }

    /// Attached + `pty.input`.
    pub async fn input(&self, ciphertext_b64: &str) -> Result<(), ErrorCode> {
        let (aead, egg_input) = {
            let mut inner = self.inner.lock().await;
            inner.attention_pending = false;
            let aead = inner.aead.clone().ok_or(ErrorCode::NotAuthorized)?;
            let egg_input = inner.egg_input.clone().ok_or(ErrorCode::Fatal)?;
            (aead, egg_input)
        };
        let plaintext = aead.decrypt(ciphertext_b64)?;
        egg_input
            .input(plaintext)
            .await
            .map_err(|_| ErrorCode::EggCrash)
    }

    /// Attached + `pty.resize` — forwarded unencrypted.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), ErrorCode> {
        let egg_input = {
            let inner = self.inner.lock().await;
            inner.egg_input.clone().ok_or(ErrorCode::Fatal)?
        };
        egg_input
            .resize(rows, cols)
            .await
            .map_err(|_| ErrorCode::EggCrash)
    }

    /// Attached + `pty.kill`.
    pub async fn kill(&self) -> anyhow::Result<()> {
        let mut client = {
            let inner = self.inner.lock().await;
            inner
                .egg_client
                .clone()
                .ok_or_else(|| anyhow::anyhow!("no egg client for session {}", self.session_id))?
        };
        client
            .kill(eggrpc::KillRequest {})
            .await
            .map_err(|e| anyhow::anyhow!("kill rpc: {e}"))?;
        Ok(())
    }

    /// `pty.attention_ack` or any subsequent input clears the flag.
    pub async fn ack_attention(&self) {
        self.inner.lock().await.attention_pending = false;
    }

    pub async fn attention_pending(&self) -> bool {
        self.inner.lock().await.attention_pending
    }

    /// Tear down the active forwarder without touching the egg process —
    /// used once an `ExitCode` or explicit kill has already been handled.
    pub async fn close(&self) {
        if let Some(cancel) = self.inner.lock().await.forwarder_cancel.take() {
            cancel.cancel();
        }
    }

    fn spawn_forwarder(self: &Arc<Self>, mut output: Box<dyn EggOutput>, cancel: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = output.next_frame() => frame,
                };
                match frame {
                    Some(EggFrame::Output { data, replay: true }) => {
                        // The replay snapshot is only sent explicitly
                        // during `attach_session`; a live stream
                        // re-sending one (e.g. a second subscriber on the
                        // same egg elsewhere) isn't this bridge's replay.
                        let _ = data;
                    }
                    Some(EggFrame::Output { data, replay: false }) => {
                        this.forward_output(&data).await;
                    }
                    Some(EggFrame::Exit { code, signal }) => {
                        this.send_envelope(Envelope::PtyExited {
                            session_id: this.session_id.clone(),
                            exit_code: code.unwrap_or(-1),
                            error: signal.map(|s| format!("terminated by signal {s}")),
                        });
                        break;
                    }
                    None => break,
                }
            }
        });
    }

    async fn forward_output(&self, data: &[u8]) {
        let raise_attention = {
            let mut inner = self.inner.lock().await;
            let raise = inner.bell.observe(data, Instant::now()) && !inner.attention_pending;
            if raise {
                inner.attention_pending = true;
            }
            raise
        };
        if raise_attention {
            self.send_envelope(Envelope::SessionAttention {
                session_id: self.session_id.clone(),
            });
        }

        let aead = self.inner.lock().await.aead.clone();
        let Some(aead) = aead else {
            // Key cleared mid-cutover; this frame belongs to the old
            // subscription and the forwarder should already be cancelled,
            // but drop defensively rather than ever emit under no key.
            return;
        };
        let frame = aead.encrypt(data);
        self.send_envelope(Envelope::PtyOutput {
            session_id: self.session_id.clone(),
            data: frame,
            compressed: false,
        });
    }

    fn send_envelope(&self, envelope: Envelope) {
        if self.relay_tx.send(envelope).is_err() {
            warn!(session = %self.session_id, "relay channel closed, dropping frame");
        }
    }
}

fn classify_spawn_error(e: SpawnError) -> ErrorCode {
    match e {
        SpawnError::Timeout { .. } => ErrorCode::EggStartTimeout,
        SpawnError::Other(_) => ErrorCode::EggCrash,
    }
}

fn gzip_compress(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write as _;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing to an in-memory Vec cannot fail.
    #[allow(clippy::unwrap_used)]
    encoder.write_all(data).unwrap();
    #[allow(clippy::unwrap_used)]
    encoder.finish().unwrap()
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
