// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios that spawn the real `wing`+`egg` binaries, playing
//! the roost relay and a browser peer against them over the actual wire
//! protocol.

use std::time::Duration;

use wing_specs::{fresh_session_id, gunzip, read_wing_identity, BrowserIdentity, RelayHarness, WingProcess};
use wire::tunnel::TunnelMessage;
use wire::Envelope;

const TIMEOUT: Duration = Duration::from_secs(10);

/// Start a session running `cat`, send one line of input, and confirm it
/// comes back decrypted under the key the `pty.started` envelope announced
/// (tty echo plus `cat`'s own copy both land in the output stream).
#[tokio::test]
async fn start_session_and_roundtrip_input() -> anyhow::Result<()> {
    let relay = RelayHarness::bind().await?;
    let _wing = WingProcess::spawn(&relay.url(), None)?;
    let mut conn = relay.accept().await?;

    let _register = conn.recv_matching(TIMEOUT, |e| matches!(e, Envelope::Register { .. })).await?;

    let tmp = tempfile::tempdir()?;
    let browser = BrowserIdentity::generate(tmp.path(), "browser.key")?;
    let session_id = fresh_session_id();

    conn.send(&Envelope::PtyStart {
        session_id: session_id.clone(),
        agent: "cat".into(),
        cwd: "/".into(),
        rows: 24,
        cols: 80,
        public_key: browser.public_key().to_string(),
        user_id: Some("u1".into()),
        passkey_credential_id: None,
        auth_token: None,
    })
    .await?;

    let started = conn
        .recv_matching(TIMEOUT, |e| matches!(e, Envelope::PtyStarted { session_id: s, .. } if s == &session_id))
        .await?;
    let Envelope::PtyStarted { public_key: wing_pub, .. } = started else {
        unreachable!()
    };
    let aead = browser.derive_pty(&wing_pub)?;

    let sealed = aead.encrypt(b"marker123\n");
    conn.send(&Envelope::PtyInput { session_id: session_id.clone(), data: sealed }).await?;

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("never observed the echoed marker in pty output");
        }
        let Envelope::PtyOutput { data, compressed, .. } = conn
            .recv_matching(TIMEOUT, |e| matches!(e, Envelope::PtyOutput { session_id: s, .. } if s == &session_id))
            .await?
        else {
            unreachable!()
        };
        let plaintext = aead.decrypt(&data)?;
        let plaintext = if compressed { gunzip(&plaintext)? } else { plaintext };
        if String::from_utf8_lossy(&plaintext).contains("marker123") {
            return Ok(());
        }
    }
}

/// A second browser attaching to the same session gets a fresh key; frames
/// sealed under the first browser's key no longer decrypt once the cutover
/// has happened.
#[tokio::test]
async fn reattach_performs_an_atomic_rekey() -> anyhow::Result<()> {
    let relay = RelayHarness::bind().await?;
    let _wing = WingProcess::spawn(&relay.url(), None)?;
    let mut conn = relay.accept().await?;
    let _register = conn.recv_matching(TIMEOUT, |e| matches!(e, Envelope::Register { .. })).await?;

    let tmp = tempfile::tempdir()?;
    let browser_a = BrowserIdentity::generate(tmp.path(), "browser_a.key")?;
    let browser_b = BrowserIdentity::generate(tmp.path(), "browser_b.key")?;
    let session_id = fresh_session_id();

    conn.send(&Envelope::PtyStart {
        session_id: session_id.clone(),
        agent: "cat".into(),
        cwd: "/".into(),
        rows: 24,
        cols: 80,
        public_key: browser_a.public_key().to_string(),
        user_id: None,
        passkey_credential_id: None,
        auth_token: None,
    })
    .await?;
    let started_a = conn
        .recv_matching(TIMEOUT, |e| matches!(e, Envelope::PtyStarted { session_id: s, .. } if s == &session_id))
        .await?;
    let Envelope::PtyStarted { public_key: wing_pub_a, .. } = started_a else {
        unreachable!()
    };
    let aead_a = browser_a.derive_pty(&wing_pub_a)?;

    conn.send(&Envelope::PtyAttach {
        session_id: session_id.clone(),
        public_key: browser_b.public_key().to_string(),
        auth_token: None,
    })
    .await?;
    let started_b = conn
        .recv_matching(TIMEOUT, |e| matches!(e, Envelope::PtyStarted { session_id: s, .. } if s == &session_id))
        .await?;
    let Envelope::PtyStarted { public_key: wing_pub_b, .. } = started_b else {
        unreachable!()
    };
    let aead_b = browser_b.derive_pty(&wing_pub_b)?;

    let stale = aead_a.encrypt(b"sealed before the cutover");
    assert!(aead_b.decrypt(&stale).is_err());

    // The new key does work for genuinely new traffic.
    let fresh = aead_b.encrypt(b"sealed after the cutover");
    assert!(aead_b.decrypt(&fresh).is_ok());

    Ok(())
}

/// A locked wing with a non-empty allow-list rejects a `sessions.list`
/// request from a sender who isn't on it.
#[tokio::test]
async fn locked_wing_rejects_requests_outside_the_allow_list() -> anyhow::Result<()> {
    let relay = RelayHarness::bind().await?;
    let policy = "locked: true\nallow_keys:\n  - user_id: allowed-user\n";
    let wing = WingProcess::spawn(&relay.url(), Some(policy))?;
    let mut conn = relay.accept().await?;
    let register = conn.recv_matching(TIMEOUT, |e| matches!(e, Envelope::Register { .. })).await?;
    let Envelope::Register { locked, .. } = register else {
        unreachable!()
    };
    assert!(locked);

    let wing_identity = read_wing_identity(wing.config_dir()).await?;
    let wing_pub = wing_identity.public_key().to_string();

    let tmp = tempfile::tempdir()?;
    let sender = BrowserIdentity::generate(tmp.path(), "sender.key")?;
    let aead = sender.derive_tunnel(&wing_pub)?;

    let payload = serde_json::to_vec(&TunnelMessage::SessionsList {})?;
    let request_id = fresh_session_id();
    conn.send(&Envelope::TunnelReq {
        request_id: request_id.clone(),
        sender_pub: sender.public_key().to_string(),
        sender_user_id: Some("denied-user".into()),
        sender_org_role: None,
        payload: aead.encrypt(&payload),
    })
    .await?;

    let res = conn
        .recv_matching(TIMEOUT, |e| matches!(e, Envelope::TunnelRes { request_id: r, .. } if r == &request_id))
        .await?;
    let Envelope::TunnelRes { payload, .. } = res else {
        unreachable!()
    };
    let plaintext = aead.decrypt(&payload)?;
    let body: serde_json::Value = serde_json::from_slice(&plaintext)?;
    assert_eq!(body["error"], "not_allowed");

    Ok(())
}

/// Adding `denied-user` to the allow-list and sending `SIGHUP` lets a
/// previously rejected request through without restarting the wing.
#[tokio::test]
async fn sighup_reload_admits_a_newly_allow_listed_user() -> anyhow::Result<()> {
    let relay = RelayHarness::bind().await?;
    let policy = "locked: true\nallow_keys: []\n";
    let wing = WingProcess::spawn(&relay.url(), Some(policy))?;
    let mut conn = relay.accept().await?;
    let _register = conn.recv_matching(TIMEOUT, |e| matches!(e, Envelope::Register { .. })).await?;

    let wing_identity = read_wing_identity(wing.config_dir()).await?;
    let wing_pub = wing_identity.public_key().to_string();
    let tmp = tempfile::tempdir()?;
    let sender = BrowserIdentity::generate(tmp.path(), "sender.key")?;
    let aead = sender.derive_tunnel(&wing_pub)?;

    let ask = |request_id: String| Envelope::TunnelReq {
        request_id,
        sender_pub: sender.public_key().to_string(),
        sender_user_id: Some("now-allowed".into()),
        sender_org_role: None,
        payload: aead.encrypt(&serde_json::to_vec(&TunnelMessage::SessionsList {}).unwrap()),
    };

    let first_id = fresh_session_id();
    conn.send(&ask(first_id.clone())).await?;
    let res = conn
        .recv_matching(TIMEOUT, |e| matches!(e, Envelope::TunnelRes { request_id: r, .. } if r == &first_id))
        .await?;
    let Envelope::TunnelRes { payload, .. } = res else {
        unreachable!()
    };
    let body: serde_json::Value = serde_json::from_slice(&aead.decrypt(&payload)?)?;
    assert_eq!(body["error"], "not_allowed");

    std::fs::write(
        wing.config_dir().join("wing.yaml"),
        "locked: true\nallow_keys:\n  - user_id: now-allowed\n",
    )?;
    let pid = std::fs::read_to_string(wing.config_dir().join("wing.pid"))?;
    let pid: i32 = pid.trim().parse()?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGHUP)?;

    // A re-sent `Register` confirms the reload has landed before we retry.
    let _reregistered = conn
        .recv_matching(TIMEOUT, |e| matches!(e, Envelope::Register { .. }))
        .await?;

    let second_id = fresh_session_id();
    conn.send(&ask(second_id.clone())).await?;
    let res = conn
        .recv_matching(TIMEOUT, |e| matches!(e, Envelope::TunnelRes { request_id: r, .. } if r == &second_id))
        .await?;
    let Envelope::TunnelRes { payload, .. } = res else {
        unreachable!()
    };
    let body: serde_json::Value = serde_json::from_slice(&aead.decrypt(&payload)?)?;
    assert!(body.get("sessions").is_some(), "expected a sessions list, got {body}");

    Ok(())
}

/// Killing an egg out from under a wing, then restarting the wing against
/// the same config directory, reaps the dead session's ephemeral files but
/// keeps it (and its audit log) visible via `sessions.history`.
#[tokio::test]
async fn restart_reaps_dead_sessions_but_keeps_audit_history() -> anyhow::Result<()> {
    let relay = RelayHarness::bind().await?;
    let policy = "audit: true\n";
    let wing = WingProcess::spawn(&relay.url(), Some(policy))?;
    let mut conn = relay.accept().await?;
    let _register = conn.recv_matching(TIMEOUT, |e| matches!(e, Envelope::Register { .. })).await?;

    let wing_identity = read_wing_identity(wing.config_dir()).await?;
    let wing_pub = wing_identity.public_key().to_string();

    let tmp = tempfile::tempdir()?;
    let browser = BrowserIdentity::generate(tmp.path(), "browser.key")?;
    let session_id = fresh_session_id();

    conn.send(&Envelope::PtyStart {
        session_id: session_id.clone(),
        agent: "cat".into(),
        cwd: "/".into(),
        rows: 24,
        cols: 80,
        public_key: browser.public_key().to_string(),
        user_id: None,
        passkey_credential_id: None,
        auth_token: None,
    })
    .await?;
    let _started = conn
        .recv_matching(TIMEOUT, |e| matches!(e, Envelope::PtyStarted { session_id: s, .. } if s == &session_id))
        .await?;

    let egg_dir = wing.config_dir().join("eggs").join(&session_id);
    wing_specs::wait_for_file(&egg_dir.join("egg.pid"), TIMEOUT).await?;
    let egg_pid: i32 = std::fs::read_to_string(egg_dir.join("egg.pid"))?.trim().parse()?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(egg_pid), nix::sys::signal::Signal::SIGKILL)?;

    let mut wing = wing;
    wing.kill();
    let relay2 = RelayHarness::bind().await?;
    let wing = wing.respawn(&relay2.url())?;
    let mut conn2 = relay2.accept().await?;
    let _register2 = conn2.recv_matching(TIMEOUT, |e| matches!(e, Envelope::Register { .. })).await?;

    // The reaped directory's ephemeral files are gone...
    assert!(!egg_dir.join("egg.pid").exists());
    assert!(!egg_dir.join("egg.sock").exists());
    // ...but the audit log and history entry survive.
    assert!(egg_dir.join("audit.pty.gz").exists());

    let wing_identity2 = read_wing_identity(wing.config_dir()).await?;
    assert_eq!(wing_identity2.public_key(), wing_pub);

    let sender = BrowserIdentity::generate(tmp.path(), "sender2.key")?;
    let aead = sender.derive_tunnel(&wing_pub)?;
    let request_id = fresh_session_id();
    conn2
        .send(&Envelope::TunnelReq {
            request_id: request_id.clone(),
            sender_pub: sender.public_key().to_string(),
            sender_user_id: None,
            sender_org_role: None,
            payload: aead.encrypt(&serde_json::to_vec(&TunnelMessage::SessionsHistory {
                offset: 0,
                limit: 50,
            })?),
        })
        .await?;
    let res = conn2
        .recv_matching(TIMEOUT, |e| matches!(e, Envelope::TunnelRes { request_id: r, .. } if r == &request_id))
        .await?;
    let Envelope::TunnelRes { payload, .. } = res else {
        unreachable!()
    };
    let body: serde_json::Value = serde_json::from_slice(&aead.decrypt(&payload)?)?;
    let sessions = body["sessions"].as_array().expect("sessions array");
    assert!(sessions.iter().any(|s| s["session_id"] == session_id));

    Ok(())
}
