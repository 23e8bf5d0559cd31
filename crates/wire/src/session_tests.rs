use super::*;

#[test]
fn round_trips() {
    let meta = SessionMeta {
        agent: "claude".into(),
        cwd: "/home/dev/project".into(),
        rows: 24,
        cols: 80,
        started_at: 1_700_000_000,
    };
    let bytes = meta.to_bytes();
    let raw = String::from_utf8(bytes).unwrap();
    let parsed = SessionMeta::parse(&raw).unwrap();
    assert_eq!(parsed, meta);
}

#[test]
fn rejects_missing_field() {
    let raw = "agent=claude\ncwd=/tmp\nrows=24\n";
    assert!(SessionMeta::parse(raw).is_err());
}
