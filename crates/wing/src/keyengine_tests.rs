use super::*;

#[test]
fn encrypt_then_decrypt_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let a = KeyEngine::load_or_generate(&dir.path().join("a.key")).unwrap();
    let b = KeyEngine::load_or_generate(&dir.path().join("b.key")).unwrap();

    let aead_a = a.derive_shared(b.public_key(), PTY_INFO).unwrap();
    let aead_b = b.derive_shared(a.public_key(), PTY_INFO).unwrap();

    let frame = aead_a.encrypt(b"hello from a");
    assert_eq!(aead_b.decrypt(&frame).unwrap(), b"hello from a");
}

/// A ciphertext under `"wt-pty"` must not decrypt under `"wt-tunnel"`
/// even though both derive from the same ECDH shared secret.
#[test]
fn key_separation_across_purpose_labels() {
    let dir = tempfile::tempdir().unwrap();
    let a = KeyEngine::load_or_generate(&dir.path().join("a.key")).unwrap();
    let b = KeyEngine::load_or_generate(&dir.path().join("b.key")).unwrap();

    let pty_key = a.derive_shared(b.public_key(), PTY_INFO).unwrap();
    let tunnel_key = b.derive_shared(a.public_key(), TUNNEL_INFO).unwrap();

    let frame = pty_key.encrypt(b"secret");
    assert_eq!(tunnel_key.decrypt(&frame), Err(ErrorCode::AeadFailure));
}

#[test]
fn derive_shared_rejects_malformed_peer_key() {
    let dir = tempfile::tempdir().unwrap();
    let a = KeyEngine::load_or_generate(&dir.path().join("a.key")).unwrap();
    assert_eq!(
        a.derive_shared("not valid base64!!", PTY_INFO).unwrap_err(),
        ErrorCode::KeyExchange
    );
    assert_eq!(
        a.derive_shared(&B64.encode([0u8; 4]), PTY_INFO).unwrap_err(),
        ErrorCode::KeyExchange
    );
}

#[test]
fn decrypt_rejects_tampered_ciphertext() {
    let dir = tempfile::tempdir().unwrap();
    let a = KeyEngine::load_or_generate(&dir.path().join("a.key")).unwrap();
    let b = KeyEngine::load_or_generate(&dir.path().join("b.key")).unwrap();
    let aead_a = a.derive_shared(b.public_key(), PTY_INFO).unwrap();
    let aead_b = b.derive_shared(a.public_key(), PTY_INFO).unwrap();

    let mut raw = B64.decode(aead_a.encrypt(b"payload")).unwrap();
    let last = raw.len() - 1;
    raw[last] ^= 0xff;
    let tampered = B64.encode(raw);

    assert_eq!(aead_b.decrypt(&tampered), Err(ErrorCode::AeadFailure));
}

#[test]
fn load_or_generate_persists_across_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wing_key");
    let first = KeyEngine::load_or_generate(&path).unwrap();
    let second = KeyEngine::load_or_generate(&path).unwrap();
    assert_eq!(first.public_key(), second.public_key());
}

#[test]
fn key_file_is_mode_0600() {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wing_key");
    let _ = KeyEngine::load_or_generate(&path).unwrap();
    let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
}
