use super::*;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_store_then_retrieve() {
    let memory = MemoryStore::short_term(10);

    memory.store("greeting", json!("Hello, Alice!"), None).await;
    assert_eq!(memory.retrieve("greeting"), Some(json!("Hello, Alice!")));

    memory.store("greeting", json!("Goodbye, Bob!"), None).await;
    assert_eq!(memory.retrieve("greeting"), Some(json!("Goodbye, Bob!")));
    assert_eq!(memory.len(), 1);
}

#[tokio::test]
async fn test_expired_entry_is_absent() {
    let memory = MemoryStore::long_term();
    let past = Utc::now() - TimeDelta::seconds(5);

    memory.store_until("stale", json!(1), past).await;
    memory.store("fresh", json!(2), Some(Duration::from_secs(3600))).await;

    assert_eq!(memory.retrieve("stale"), None);
    assert!(!memory.contains_key("stale"));
    assert_eq!(memory.retrieve("fresh"), Some(json!(2)));

    // Still held until purged, but never readable
    assert_eq!(memory.len(), 2);
    assert_eq!(memory.purge_expired(), 1);
    assert_eq!(memory.len(), 1);
}

#[tokio::test]
async fn test_short_ttl_expires() {
    let memory = MemoryStore::short_term(10);
    memory
        .store("blink", json!(true), Some(Duration::from_millis(20)))
        .await;
    assert!(memory.contains_key("blink"));

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(memory.retrieve("blink"), None);
}

#[tokio::test]
async fn test_short_term_evicts_oldest_stored() {
    let memory = MemoryStore::short_term(3);

    memory.store("a", json!(1), None).await;
    memory.store("b", json!(2), None).await;
    memory.store("c", json!(3), None).await;

    // Reading does not refresh position
    assert!(memory.retrieve("a").is_some());

    memory.store("d", json!(4), None).await;
    assert_eq!(memory.len(), 3);
    assert_eq!(memory.retrieve("a"), None);
    assert_eq!(memory.retrieve("d"), Some(json!(4)));

    // Overwriting refreshes position, so "c" is now the oldest
    memory.store("b", json!(20), None).await;
    memory.store("e", json!(5), None).await;
    assert_eq!(memory.retrieve("c"), None);
    assert_eq!(memory.retrieve("b"), Some(json!(20)));
}

#[tokio::test]
async fn test_eviction_prefers_expired_entries() {
    let memory = MemoryStore::short_term(2);
    memory.store("keep", json!(1), None).await;
    memory
        .store_until("gone", json!(2), Utc::now() - TimeDelta::seconds(1))
        .await;

    memory.store("new", json!(3), None).await;
    assert_eq!(memory.retrieve("keep"), Some(json!(1)));
    assert_eq!(memory.retrieve("new"), Some(json!(3)));
    assert_eq!(memory.len(), 2);
}

#[tokio::test]
async fn test_delete() {
    let memory = MemoryStore::short_term(10);
    memory.store("k", json!("v"), None).await;

    assert!(memory.delete("k").await);
    assert_eq!(memory.retrieve("k"), None);
    assert!(!memory.delete("k").await);
}

#[tokio::test]
async fn test_items_are_restartable_and_skip_expired() {
    let memory = MemoryStore::short_term(10);
    memory.store("first", json!(1), None).await;
    memory
        .store_until("expired", json!(2), Utc::now() - TimeDelta::seconds(1))
        .await;
    memory.store("second", json!(3), None).await;

    let items = memory.items();
    let keys: Vec<&str> = items.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["first", "second"]);

    // Iterating again yields the same sequence
    let again: Vec<&str> = (&items).into_iter().map(|(k, _)| k).collect();
    assert_eq!(again, keys);
}

#[tokio::test]
async fn test_default_ttl_applies() {
    let memory = MemoryStore::short_term(10).with_default_ttl(Duration::from_secs(60));
    memory.store("k", json!(1), None).await;

    let entry = memory.entry("k").unwrap();
    assert!(entry.expires_at.is_some());
}

#[tokio::test]
async fn test_long_term_loads_from_sink() {
    let sink = Arc::new(InMemorySink::with_entries(vec![
        MemoryEntry::new("fact", json!("water boils at 100C"), None),
        MemoryEntry::new("old", json!("x"), Some(Utc::now() - TimeDelta::seconds(1))),
    ]));

    let memory = MemoryStore::long_term_with_sink(sink.clone()).await;
    assert_eq!(memory.retrieve("fact"), Some(json!("water boils at 100C")));
    assert_eq!(memory.retrieve("old"), None);
    assert_eq!(memory.len(), 1);
    assert!(memory.warnings().is_empty());

    memory.store("new_fact", json!(42), None).await;
    assert!(sink.entries().iter().any(|e| e.key == "new_fact"));

    memory.delete("fact").await;
    assert!(!sink.entries().iter().any(|e| e.key == "fact"));
}

#[tokio::test]
async fn test_failing_load_is_non_fatal() {
    let sink = Arc::new(InMemorySink::new());
    sink.fail_loads(true);

    let memory = MemoryStore::long_term_with_sink(sink).await;
    assert!(memory.is_empty());

    let warnings = memory.take_warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].op, PersistenceOp::Load);
    assert!(memory.warnings().is_empty());
}

#[tokio::test]
async fn test_failing_save_keeps_value_in_memory() {
    let sink = Arc::new(InMemorySink::new());
    let memory = MemoryStore::long_term_with_sink(sink.clone()).await;
    sink.fail_saves(true);

    memory.store("k", json!("v"), None).await;
    assert_eq!(memory.retrieve("k"), Some(json!("v")));

    let warnings = memory.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].op, PersistenceOp::Save);
    assert_eq!(warnings[0].key.as_deref(), Some("k"));
}

#[tokio::test]
async fn test_json_file_sink_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("long_term.json");

    {
        let sink = Arc::new(JsonFileSink::new(&path));
        let memory = MemoryStore::long_term_with_sink(sink).await;
        memory.store("research_1", json!({"topic": "graphs"}), None).await;
        memory.store("research_2", json!({"topic": "agents"}), None).await;
        memory.delete("research_1").await;
    }

    let reopened = MemoryStore::long_term_with_sink(Arc::new(JsonFileSink::new(&path))).await;
    assert_eq!(reopened.retrieve("research_1"), None);
    assert_eq!(
        reopened.retrieve("research_2"),
        Some(json!({"topic": "agents"}))
    );
    assert!(reopened.warnings().is_empty());
}

#[tokio::test]
async fn test_json_file_sink_corrupt_file_warns() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, b"{ not json").unwrap();

    let memory = MemoryStore::long_term_with_sink(Arc::new(JsonFileSink::new(&path))).await;
    assert!(memory.is_empty());
    assert_eq!(memory.warnings().len(), 1);
}
