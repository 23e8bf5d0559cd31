// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `wing` daemon as a subprocess, acting as the roost relay
//! it connects out to (a single Unix-world-facing WebSocket server this
//! harness controls) and as the browser peer that holds the other end of
//! each session's AEAD key.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use wing::keyengine::{Aead, KeyEngine};
use wire::Envelope;

/// Resolve the path to a compiled sibling binary (`wing` or `egg`).
fn sibling_binary(name: &str) -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs -> tests -> workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join(name)
}

pub fn wing_binary() -> PathBuf {
    sibling_binary("wing")
}

pub fn egg_binary() -> PathBuf {
    sibling_binary("egg")
}

/// A relay server this harness controls: the `wing` under test dials out to
/// it exactly the way it would dial a real roost relay.
pub struct RelayHarness {
    listener: TcpListener,
    port: u16,
}

impl RelayHarness {
    pub async fn bind() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Accept the next inbound connection — the wing under test making its
    /// one outbound WebSocket.
    pub async fn accept(&self) -> anyhow::Result<RelayConn> {
        let (stream, _) = self.listener.accept().await?;
        let ws = tokio_tungstenite::accept_async(stream).await?;
        Ok(RelayConn { ws })
    }
}

pub struct RelayConn {
    ws: WebSocketStream<TcpStream>,
}

impl RelayConn {
    pub async fn send(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
        let text = serde_json::to_string(envelope)?;
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Read the next envelope, skipping any frame that fails to parse as
    /// one (there shouldn't be any, but a stray ping/pong is harmless).
    pub async fn recv(&mut self) -> anyhow::Result<Envelope> {
        loop {
            let msg = self
                .ws
                .next()
                .await
                .ok_or_else(|| anyhow::anyhow!("relay connection closed"))??;
            if let Message::Text(text) = msg {
                if let Ok(env) = serde_json::from_str::<Envelope>(&text) {
                    return Ok(env);
                }
            }
        }
    }

    /// Read envelopes until `pred` matches one, discarding the rest
    /// (session.attention and similar best-effort frames may interleave).
    pub async fn recv_matching(
        &mut self,
        timeout: Duration,
        pred: impl Fn(&Envelope) -> bool,
    ) -> anyhow::Result<Envelope> {
        tokio::time::timeout(timeout, async {
            loop {
                let env = self.recv().await?;
                if pred(&env) {
                    return Ok(env);
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for a matching envelope"))?
    }
}

/// A running `wing` process, killed on drop.
pub struct WingProcess {
    child: Child,
    config_dir: Option<tempfile::TempDir>,
    config_dir_path: PathBuf,
}

impl WingProcess {
    /// Spawn `wing` pointed at a fresh temp config dir and the given relay
    /// URL. `policy_yaml`, if given, is written to `wing.yaml` before the
    /// process starts.
    pub fn spawn(relay_url: &str, policy_yaml: Option<&str>) -> anyhow::Result<Self> {
        let config_dir = tempfile::tempdir()?;
        if let Some(yaml) = policy_yaml {
            std::fs::write(config_dir.path().join("wing.yaml"), yaml)?;
        }

        let binary = wing_binary();
        anyhow::ensure!(binary.exists(), "wing binary not found at {}", binary.display());
        let egg = egg_binary();
        anyhow::ensure!(egg.exists(), "egg binary not found at {}", egg.display());

        let child = Command::new(&binary)
            .arg("--config-dir")
            .arg(config_dir.path())
            .arg("--relay-url")
            .arg(relay_url)
            .arg("--egg-binary")
            .arg(&egg)
            .arg("--log-format")
            .arg("text")
            .arg("--log-level")
            .arg("warn")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Self {
            child,
            config_dir_path: config_dir.path().to_path_buf(),
            config_dir: Some(config_dir),
        })
    }

    /// Spawn `wing` again against the same config directory — used to
    /// exercise the startup reap against state a prior process left behind.
    pub fn respawn(mut self, relay_url: &str) -> anyhow::Result<Self> {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let config_dir = self.config_dir.take();
        let config_dir_path = self.config_dir_path.clone();

        let binary = wing_binary();
        let egg = egg_binary();
        let child = Command::new(&binary)
            .arg("--config-dir")
            .arg(&config_dir_path)
            .arg("--relay-url")
            .arg(relay_url)
            .arg("--egg-binary")
            .arg(&egg)
            .arg("--log-format")
            .arg("text")
            .arg("--log-level")
            .arg("warn")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Self {
            child,
            config_dir_path,
            config_dir,
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir_path
    }

    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for WingProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A test-side "browser": owns an X25519 identity and can derive the same
/// per-purpose AEAD a real browser client would, so tests can decrypt
/// `pty.output`/`tunnel.res` and encrypt `pty.input`/`tunnel.req`.
pub struct BrowserIdentity {
    engine: KeyEngine,
}

impl BrowserIdentity {
    pub fn generate(tmp_dir: &Path, name: &str) -> anyhow::Result<Self> {
        Ok(Self {
            engine: KeyEngine::load_or_generate(&tmp_dir.join(name))?,
        })
    }

    pub fn public_key(&self) -> &str {
        self.engine.public_key()
    }

    pub fn derive_pty(&self, wing_pub: &str) -> anyhow::Result<Aead> {
        self.engine
            .derive_shared(wing_pub, wing::keyengine::PTY_INFO)
            .map_err(|e| anyhow::anyhow!("{e:?}"))
    }

    pub fn derive_tunnel(&self, wing_pub: &str) -> anyhow::Result<Aead> {
        self.engine
            .derive_shared(wing_pub, wing::keyengine::TUNNEL_INFO)
            .map_err(|e| anyhow::anyhow!("{e:?}"))
    }
}

/// Gunzip a replay chunk, as sealed by `PTYBridge::attach_session`.
pub fn gunzip(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    use std::io::Read;
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

pub fn fresh_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Poll for `path` to exist. Used to wait out the startup race between a
/// spawned `wing` writing `wing_key` and a test harness reading it.
pub async fn wait_for_file(path: &Path, timeout: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if path.exists() {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("{path:?} never appeared");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// The wing-under-test's own identity, read from the key file it persists
/// on first run — the filesystem-provisioning equivalent of a real
/// browser learning a wing's public key out of band (e.g. QR pairing).
pub async fn read_wing_identity(config_dir: &Path) -> anyhow::Result<KeyEngine> {
    let path = config_dir.join("wing_key");
    wait_for_file(&path, Duration::from_secs(10)).await?;
    KeyEngine::load_or_generate(&path)
}
