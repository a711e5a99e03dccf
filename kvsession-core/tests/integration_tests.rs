//! Integration tests for kvsession-core

use kvsession_core::{
    expiry_from_now, now_epoch, CoreError, JsonCodec, RecordLookup, SessionRecord, SessionValues,
    StoreConfig, ValueCodec,
};
use serde_json::json;

#[test]
fn test_stored_value_round_trips_through_lookup() {
    let codec = JsonCodec;
    let mut values = SessionValues::new();
    values.insert("cart".to_string(), json!(["apple", "pear"]));

    let record = SessionRecord::new("sid-1", codec.encode(&values).unwrap(), expiry_from_now(60));

    match RecordLookup::from_row(Some(record), now_epoch()) {
        RecordLookup::Present(record) => {
            let decoded = codec.decode(&record.value).unwrap();
            assert_eq!(decoded.get("cart"), Some(&json!(["apple", "pear"])));
        }
        other => panic!("expected present record, got {other:?}"),
    }
}

#[test]
fn test_flushed_session_stays_distinguishable_from_missing() {
    let codec = JsonCodec;
    let flushed = SessionRecord::new("sid-2", codec.encode(&SessionValues::new()).unwrap(), expiry_from_now(60));

    let lookup = RecordLookup::from_row(Some(flushed), now_epoch());
    assert!(lookup.is_present());
    assert_ne!(lookup, RecordLookup::Absent);
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.toml");

    StoreConfig::new("sqlite://sessions.db?mode=rwc")
        .with_handle_pool_capacity(8)
        .save_to_file(&path)
        .unwrap();

    let config = StoreConfig::from_file(&path).unwrap();
    assert_eq!(config.handle_pool_capacity, 8);
    assert_eq!(config.effective_table_name(), "go_session");
}

#[test]
fn test_missing_config_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = StoreConfig::from_file(dir.path().join("nope.toml"));
    assert!(matches!(result, Err(CoreError::Config { .. })));
}
