use super::*;

#[test]
fn allowed_key_matches_by_user_id_first() {
    let a = AllowedKey {
        passkey_pub_key: Some("pkA".into()),
        user_id: Some("u1".into()),
        email: None,
    };
    let b = AllowedKey {
        passkey_pub_key: Some("pkB".into()),
        user_id: Some("u1".into()),
        email: None,
    };
    assert!(a.matches(&b));
}

#[test]
fn allowed_key_falls_back_to_pub_key() {
    let a = AllowedKey {
        passkey_pub_key: Some("pk1".into()),
        user_id: None,
        email: None,
    };
    let b = AllowedKey {
        passkey_pub_key: Some("pk1".into()),
        user_id: None,
        email: None,
    };
    assert!(a.matches(&b));
}

#[test]
fn decodes_pty_kill() {
    let raw = r#"{"type":"pty.kill","session_id":"sess-aaaa"}"#;
    let msg: TunnelMessage = serde_json::from_str(raw).unwrap();
    match msg {
        TunnelMessage::PtyKill { session_id } => assert_eq!(session_id, "sess-aaaa"),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn unknown_type_decodes_to_unknown_variant() {
    let raw = r#"{"type":"something.new","foo":1}"#;
    let msg: TunnelMessage = serde_json::from_str(raw).unwrap();
    assert!(matches!(msg, TunnelMessage::Unknown));
}
