use std::collections::HashMap;

use tokio::sync::Mutex;

use super::*;
use crate::reload::ConfigState;

fn fresh_engine(dir: &std::path::Path, name: &str) -> Arc<KeyEngine> {
    Arc::new(KeyEngine::load_or_generate(&dir.join(name)).unwrap())
}

async fn fresh_dispatcher(dir: &std::path::Path) -> (TunnelDispatcher, Arc<KeyEngine>) {
    let wing_key = fresh_engine(dir, "wing.key");
    let config = ConfigState::load(dir).unwrap();
    let dispatcher = TunnelDispatcher::new(
        "wing-test".into(),
        dir.to_path_buf(),
        wing_key.clone(),
        config,
        Arc::new(AuthCache::new()),
        Arc::new(SessionRegistry::new(dir.to_path_buf())),
        Arc::new(Mutex::new(HashMap::new())),
    );
    (dispatcher, wing_key)
}

fn seal(wing_key: &KeyEngine, browser_key: &KeyEngine, body: &Value) -> String {
    let aead = browser_key
        .derive_shared(wing_key.public_key(), TUNNEL_INFO)
        .unwrap();
    aead.encrypt(&serde_json::to_vec(body).unwrap())
}

fn unseal(wing_key: &KeyEngine, browser_key: &KeyEngine, ciphertext_b64: &str) -> Value {
    let aead = browser_key
        .derive_shared(wing_key.public_key(), TUNNEL_INFO)
        .unwrap();
    let plain = aead.decrypt(ciphertext_b64).unwrap();
    serde_json::from_slice(&plain).unwrap()
}

fn expect_single(response: DispatchResponse) -> String {
    match response {
        DispatchResponse::Single(payload) => payload,
        DispatchResponse::Stream(_) => panic!("expected a single tunnel.res payload, got a stream"),
    }
}

fn expect_stream(response: DispatchResponse) -> Vec<String> {
    match response {
        DispatchResponse::Stream(chunks) => chunks,
        DispatchResponse::Single(_) => panic!("expected a tunnel.stream sequence, got a single payload"),
    }
}

#[tokio::test]
async fn wing_info_bypasses_the_locked_gate_and_returns_a_challenge() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, wing_key) = fresh_dispatcher(dir.path()).await;
    // lock the wing directly via a reload so wing_info still bypasses it.
    std::fs::write(
        dir.path().join("wing.yaml"),
        serde_yaml::to_string(&crate::config::WingPolicy {
            locked: true,
            ..crate::config::WingPolicy::default()
        })
        .unwrap(),
    )
    .unwrap();
    dispatcher.config.reload_from_disk().await.unwrap();

    let browser_key = fresh_engine(dir.path(), "browser.key");
    let req = seal(&wing_key, &browser_key, &json!({"type": "wing.info"}));
    let res = dispatcher
        .dispatch(browser_key.public_key(), None, None, &req)
        .await
        .unwrap();
    let res = expect_single(res);
    let body = unseal(&wing_key, &browser_key, &res);
    assert_eq!(body["wing_id"], "wing-test");
    assert!(body["auth_challenge"].is_string());
}

#[tokio::test]
async fn locked_wing_rejects_an_unrecognized_sender() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, wing_key) = fresh_dispatcher(dir.path()).await;
    std::fs::write(
        dir.path().join("wing.yaml"),
        serde_yaml::to_string(&crate::config::WingPolicy {
            locked: true,
            ..crate::config::WingPolicy::default()
        })
        .unwrap(),
    )
    .unwrap();
    dispatcher.config.reload_from_disk().await.unwrap();

    let browser_key = fresh_engine(dir.path(), "browser.key");
    let req = seal(&wing_key, &browser_key, &json!({"type": "sessions.list"}));
    let res = dispatcher
        .dispatch(browser_key.public_key(), None, None, &req)
        .await
        .unwrap();
    let res = expect_single(res);
    let body = unseal(&wing_key, &browser_key, &res);
    assert_eq!(body["error"], ErrorCode::NotAuthorized.as_str());
}

#[tokio::test]
async fn allow_listed_sender_passes_the_gate() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, wing_key) = fresh_dispatcher(dir.path()).await;
    let browser_key = fresh_engine(dir.path(), "browser.key");

    dispatcher
        .config
        .allow_add(AllowedKey {
            passkey_pub_key: Some(browser_key.public_key().to_string()),
            user_id: None,
            email: None,
        })
        .await
        .unwrap();
    std::fs::write(
        dir.path().join("wing.yaml"),
        serde_yaml::to_string(&crate::config::WingPolicy {
            locked: true,
            allow_keys: dispatcher.config.allow_keys().await,
            ..crate::config::WingPolicy::default()
        })
        .unwrap(),
    )
    .unwrap();
    dispatcher.config.reload_from_disk().await.unwrap();

    let req = seal(&wing_key, &browser_key, &json!({"type": "sessions.list"}));
    let res = dispatcher
        .dispatch(browser_key.public_key(), None, None, &req)
        .await
        .unwrap();
    let res = expect_single(res);
    let body = unseal(&wing_key, &browser_key, &res);
    assert!(body.get("sessions").is_some());
}

#[tokio::test]
async fn allow_add_bypasses_the_gate_for_a_privileged_org_role() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, wing_key) = fresh_dispatcher(dir.path()).await;
    std::fs::write(
        dir.path().join("wing.yaml"),
        serde_yaml::to_string(&crate::config::WingPolicy {
            locked: true,
            ..crate::config::WingPolicy::default()
        })
        .unwrap(),
    )
    .unwrap();
    dispatcher.config.reload_from_disk().await.unwrap();

    let browser_key = fresh_engine(dir.path(), "browser.key");
    let req = seal(
        &wing_key,
        &browser_key,
        &json!({"type": "allow.add", "key": {"user_id": "user-2"}}),
    );
    let res = dispatcher
        .dispatch(browser_key.public_key(), Some("user-1"), Some("owner"), &req)
        .await
        .unwrap();
    let res = expect_single(res);
    let body = unseal(&wing_key, &browser_key, &res);
    assert_eq!(body["ok"], true);
    assert_eq!(dispatcher.config.allow_keys().await.len(), 1);
}

#[tokio::test]
async fn allow_add_rejects_a_member_targeting_someone_elses_entry() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, wing_key) = fresh_dispatcher(dir.path()).await;
    let browser_key = fresh_engine(dir.path(), "browser.key");

    let req = seal(
        &wing_key,
        &browser_key,
        &json!({"type": "allow.add", "key": {"user_id": "user-2"}}),
    );
    let res = dispatcher
        .dispatch(browser_key.public_key(), Some("user-1"), Some("member"), &req)
        .await
        .unwrap();
    let res = expect_single(res);
    let body = unseal(&wing_key, &browser_key, &res);
    assert_eq!(body["error"], ErrorCode::NotAuthorized.as_str());
    assert!(dispatcher.config.allow_keys().await.is_empty());
}

#[tokio::test]
async fn allow_add_permits_a_member_adding_their_own_entry() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, wing_key) = fresh_dispatcher(dir.path()).await;
    let browser_key = fresh_engine(dir.path(), "browser.key");

    let req = seal(
        &wing_key,
        &browser_key,
        &json!({"type": "allow.add", "key": {"user_id": "user-1"}}),
    );
    let res = dispatcher
        .dispatch(browser_key.public_key(), Some("user-1"), Some("member"), &req)
        .await
        .unwrap();
    let res = expect_single(res);
    let body = unseal(&wing_key, &browser_key, &res);
    assert_eq!(body["ok"], true);
    assert_eq!(dispatcher.config.allow_keys().await.len(), 1);
}

#[tokio::test]
async fn allow_remove_rejects_a_member_targeting_someone_elses_entry() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, wing_key) = fresh_dispatcher(dir.path()).await;
    let browser_key = fresh_engine(dir.path(), "browser.key");

    dispatcher
        .config
        .allow_add(AllowedKey {
            passkey_pub_key: None,
            user_id: Some("user-2".into()),
            email: None,
        })
        .await
        .unwrap();

    let req = seal(
        &wing_key,
        &browser_key,
        &json!({"type": "allow.remove", "allow_user_id": "user-2"}),
    );
    let res = dispatcher
        .dispatch(browser_key.public_key(), Some("user-1"), Some("member"), &req)
        .await
        .unwrap();
    let res = expect_single(res);
    let body = unseal(&wing_key, &browser_key, &res);
    assert_eq!(body["error"], ErrorCode::NotAuthorized.as_str());
    assert_eq!(dispatcher.config.allow_keys().await.len(), 1);
}

#[tokio::test]
async fn allow_remove_does_not_bypass_the_locked_gate() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, wing_key) = fresh_dispatcher(dir.path()).await;
    std::fs::write(
        dir.path().join("wing.yaml"),
        serde_yaml::to_string(&crate::config::WingPolicy {
            locked: true,
            ..crate::config::WingPolicy::default()
        })
        .unwrap(),
    )
    .unwrap();
    dispatcher.config.reload_from_disk().await.unwrap();

    let browser_key = fresh_engine(dir.path(), "browser.key");
    let req = seal(
        &wing_key,
        &browser_key,
        &json!({"type": "allow.remove", "allow_user_id": "user-1"}),
    );
    // Sender is not on the allow-list and presents no cached auth token, so
    // even "owner" never reaches the handler — the locked gate itself
    // rejects it (unlike `allow.add`, which is exempt from the gate).
    let res = dispatcher
        .dispatch(browser_key.public_key(), Some("user-1"), Some("owner"), &req)
        .await
        .unwrap();
    let res = expect_single(res);
    let body = unseal(&wing_key, &browser_key, &res);
    assert_eq!(body["error"], ErrorCode::NotAuthorized.as_str());
}

#[tokio::test]
async fn unknown_message_type_gets_a_clean_error_not_a_decode_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, wing_key) = fresh_dispatcher(dir.path()).await;
    let browser_key = fresh_engine(dir.path(), "browser.key");

    let req = seal(&wing_key, &browser_key, &json!({"type": "something.new"}));
    let res = dispatcher
        .dispatch(browser_key.public_key(), None, None, &req)
        .await
        .unwrap();
    let res = expect_single(res);
    let body = unseal(&wing_key, &browser_key, &res);
    assert_eq!(body["error"], "unknown_type");
}

#[tokio::test]
async fn sessions_list_filters_to_own_sessions_for_a_member() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, wing_key) = fresh_dispatcher(dir.path()).await;
    let browser_key = fresh_engine(dir.path(), "browser.key");

    let mine = wire::SessionDir::new(dir.path(), "sess-mine");
    std::fs::create_dir_all(mine.root()).unwrap();
    std::fs::write(mine.pid(), std::process::id().to_string()).unwrap();
    std::fs::write(mine.meta(), b"agent=x\ncwd=/\nrows=1\ncols=1\nstarted_at=1\n").unwrap();
    std::fs::write(mine.owner(), "user-1").unwrap();

    let theirs = wire::SessionDir::new(dir.path(), "sess-theirs");
    std::fs::create_dir_all(theirs.root()).unwrap();
    std::fs::write(theirs.pid(), std::process::id().to_string()).unwrap();
    std::fs::write(theirs.meta(), b"agent=x\ncwd=/\nrows=1\ncols=1\nstarted_at=1\n").unwrap();
    std::fs::write(theirs.owner(), "user-2").unwrap();

    let req = seal(&wing_key, &browser_key, &json!({"type": "sessions.list"}));
    let res = dispatcher
        .dispatch(browser_key.public_key(), Some("user-1"), Some("member"), &req)
        .await
        .unwrap();
    let res = expect_single(res);
    let body = unseal(&wing_key, &browser_key, &res);
    let sessions = body["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["session_id"], "sess-mine");
}

#[tokio::test]
async fn pty_kill_is_rejected_for_a_member_who_does_not_own_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, wing_key) = fresh_dispatcher(dir.path()).await;
    let browser_key = fresh_engine(dir.path(), "browser.key");

    let theirs = wire::SessionDir::new(dir.path(), "sess-theirs");
    std::fs::create_dir_all(theirs.root()).unwrap();
    std::fs::write(theirs.owner(), "user-2").unwrap();

    let req = seal(
        &wing_key,
        &browser_key,
        &json!({"type": "pty.kill", "session_id": "sess-theirs"}),
    );
    let res = dispatcher
        .dispatch(browser_key.public_key(), Some("user-1"), Some("member"), &req)
        .await
        .unwrap();
    let res = expect_single(res);
    let body = unseal(&wing_key, &browser_key, &res);
    assert_eq!(body["error"], ErrorCode::NotAuthorized.as_str());
}

#[tokio::test]
async fn pty_kill_is_allowed_for_the_owning_member() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, wing_key) = fresh_dispatcher(dir.path()).await;
    let browser_key = fresh_engine(dir.path(), "browser.key");

    let mine = wire::SessionDir::new(dir.path(), "sess-mine");
    std::fs::create_dir_all(mine.root()).unwrap();
    std::fs::write(mine.owner(), "user-1").unwrap();

    let req = seal(
        &wing_key,
        &browser_key,
        &json!({"type": "pty.kill", "session_id": "sess-mine"}),
    );
    let res = dispatcher
        .dispatch(browser_key.public_key(), Some("user-1"), Some("member"), &req)
        .await
        .unwrap();
    let res = expect_single(res);
    let body = unseal(&wing_key, &browser_key, &res);
    // No bridge is registered for this session in this test, so the
    // ownership check passes and it falls through to "not_found" rather
    // than "not_authorized" — proof the ACL gate let it through.
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn pty_kill_is_unrestricted_for_a_non_member_role() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, wing_key) = fresh_dispatcher(dir.path()).await;
    let browser_key = fresh_engine(dir.path(), "browser.key");

    let theirs = wire::SessionDir::new(dir.path(), "sess-theirs");
    std::fs::create_dir_all(theirs.root()).unwrap();
    std::fs::write(theirs.owner(), "user-2").unwrap();

    let req = seal(
        &wing_key,
        &browser_key,
        &json!({"type": "pty.kill", "session_id": "sess-theirs"}),
    );
    let res = dispatcher
        .dispatch(browser_key.public_key(), Some("user-1"), Some("owner"), &req)
        .await
        .unwrap();
    let res = expect_single(res);
    let body = unseal(&wing_key, &browser_key, &res);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn audit_request_streams_a_large_pty_log_across_chunks_marked_done_on_the_last() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, wing_key) = fresh_dispatcher(dir.path()).await;
    let browser_key = fresh_engine(dir.path(), "browser.key");

    let sd = wire::SessionDir::new(dir.path(), "sess-big");
    std::fs::create_dir_all(sd.root()).unwrap();
    std::fs::write(sd.owner(), "user-1").unwrap();
    let big = vec![b'x'; MAX_AUDIT_CHUNK * 2 + 17];
    std::fs::write(sd.audit_pty(), &big).unwrap();

    let req = seal(
        &wing_key,
        &browser_key,
        &json!({"type": "audit.request", "session_id": "sess-big", "kind": "pty"}),
    );
    let res = dispatcher
        .dispatch(browser_key.public_key(), Some("user-1"), Some("member"), &req)
        .await
        .unwrap();
    let chunks = expect_stream(res);
    assert_eq!(chunks.len(), 3);

    let mut recovered = Vec::new();
    for chunk in &chunks {
        let body = unseal(&wing_key, &browser_key, chunk);
        let piece = B64.decode(body["data"].as_str().unwrap()).unwrap();
        recovered.extend(piece);
    }
    assert_eq!(recovered, big);
}

#[tokio::test]
async fn audit_request_is_rejected_for_a_member_who_does_not_own_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, wing_key) = fresh_dispatcher(dir.path()).await;
    let browser_key = fresh_engine(dir.path(), "browser.key");

    let theirs = wire::SessionDir::new(dir.path(), "sess-theirs");
    std::fs::create_dir_all(theirs.root()).unwrap();
    std::fs::write(theirs.owner(), "user-2").unwrap();
    std::fs::write(theirs.audit_pty(), b"secret output").unwrap();

    let req = seal(
        &wing_key,
        &browser_key,
        &json!({"type": "audit.request", "session_id": "sess-theirs", "kind": "pty"}),
    );
    let res = dispatcher
        .dispatch(browser_key.public_key(), Some("user-1"), Some("member"), &req)
        .await
        .unwrap();
    let chunks = expect_stream(res);
    assert_eq!(chunks.len(), 1);
    let body = unseal(&wing_key, &browser_key, &chunks[0]);
    assert_eq!(body["error"], ErrorCode::NotAuthorized.as_str());
}

#[tokio::test]
async fn audit_request_for_keylog_reads_audit_log_not_audit_pty() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, wing_key) = fresh_dispatcher(dir.path()).await;
    let browser_key = fresh_engine(dir.path(), "browser.key");

    let sd = wire::SessionDir::new(dir.path(), "sess-keys");
    std::fs::create_dir_all(sd.root()).unwrap();
    std::fs::write(sd.owner(), "user-1").unwrap();
    std::fs::write(sd.audit_pty(), b"pty transcript").unwrap();
    std::fs::write(sd.audit_log(), b"ls -la\n").unwrap();

    let req = seal(
        &wing_key,
        &browser_key,
        &json!({"type": "audit.request", "session_id": "sess-keys", "kind": "keylog"}),
    );
    let res = dispatcher
        .dispatch(browser_key.public_key(), Some("user-1"), Some("member"), &req)
        .await
        .unwrap();
    let chunks = expect_stream(res);
    assert_eq!(chunks.len(), 1);
    let body = unseal(&wing_key, &browser_key, &chunks[0]);
    let data = B64.decode(body["data"].as_str().unwrap()).unwrap();
    assert_eq!(data, b"ls -la\n");
}
