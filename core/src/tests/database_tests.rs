use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::backend::MemoryBackend;
use crate::config::{BackendConfig, DatabaseConfig, ShardConfig};
use crate::document::{Document, Patch, UpdateOptions, set_fields};
use crate::error::MemDbError;
use crate::server::Database;
use crate::storage::ShardState;

fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => panic!("not an object"),
    }
}

fn rain() -> Document {
    doc(json!({"name": "rain", "age": 30}))
}

fn snow() -> Document {
    doc(json!({"name": "snow", "age": 25}))
}

fn stored(id: &str, fields: Document) -> Document {
    let mut doc = fields;
    doc.insert("_id".into(), json!(id));
    doc
}

fn shard_config(persistent_delay_ms: u64, idle_timeout_ms: i64) -> ShardConfig {
    ShardConfig {
        persistent_delay_ms,
        idle_timeout_ms,
        gc_interval_ms: 20,
        ..ShardConfig::new("s1")
    }
}

fn player_config(shard: ShardConfig) -> DatabaseConfig {
    DatabaseConfig::single_shard(shard).with_collection("player", &["name"])
}

async fn started(config: DatabaseConfig, backend: Arc<MemoryBackend>) -> Arc<Database> {
    let db = Database::new(config, backend).unwrap();
    db.start().await.unwrap();
    Arc::new(db)
}

fn ids(docs: &[Document]) -> Vec<&str> {
    docs.iter()
        .filter_map(|d| d.get("_id").and_then(Value::as_str))
        .collect()
}

#[tokio::test]
async fn test_find_before_and_after_flush() {
    let backend = Arc::new(MemoryBackend::new());
    let db = started(player_config(shard_config(100, 0)), backend.clone()).await;
    let conn = db.connect();

    db.insert(conn, "player", "p1", rain()).await.unwrap();
    db.commit(conn).unwrap();

    assert_eq!(
        db.find(conn, "player", "p1", None).await.unwrap(),
        Some(stored("p1", rain()))
    );
    assert_eq!(backend.snapshot("player:p1"), None);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(backend.snapshot("player:p1"), Some(stored("p1", rain())));
    assert_eq!(
        db.find(conn, "player", "p1", None).await.unwrap(),
        Some(stored("p1", rain()))
    );

    db.stop(false).await.unwrap();
}

#[tokio::test]
async fn test_projection_keeps_id() {
    let db = started(
        player_config(shard_config(0, 0)),
        Arc::new(MemoryBackend::new()),
    )
    .await;
    let conn = db.connect();

    db.insert(conn, "player", "p1", rain()).await.unwrap();
    let fields = vec!["age".to_string()];
    assert_eq!(
        db.find(conn, "player", "p1", Some(fields.as_slice())).await.unwrap(),
        Some(doc(json!({"_id": "p1", "age": 30})))
    );
}

#[tokio::test]
async fn test_index_follows_update() {
    let db = started(
        player_config(shard_config(0, 0)),
        Arc::new(MemoryBackend::new()),
    )
    .await;
    let conn = db.connect();

    db.insert(conn, "player", "p1", rain()).await.unwrap();
    db.commit(conn).unwrap();

    let mut patch = Patch::new();
    patch.insert("name".into(), Some(json!("snow")));
    db.update(conn, "player", "p1", patch, UpdateOptions::default())
        .await
        .unwrap();
    db.commit(conn).unwrap();

    let by_rain = db
        .find_by_index(conn, "player", "name", &json!("rain"), None)
        .await
        .unwrap();
    let by_snow = db
        .find_by_index(conn, "player", "name", &json!("snow"), None)
        .await
        .unwrap();

    assert!(by_rain.is_empty());
    assert_eq!(ids(&by_snow), vec!["p1"]);
}

#[tokio::test]
async fn test_rollback_restores_document_and_index() {
    let db = started(
        player_config(shard_config(0, 0)),
        Arc::new(MemoryBackend::new()),
    )
    .await;
    let conn = db.connect();

    db.insert(conn, "player", "p1", rain()).await.unwrap();
    db.commit(conn).unwrap();

    let mut patch = Patch::new();
    patch.insert("name".into(), Some(json!("snow")));
    patch.insert("age".into(), None);
    db.update(conn, "player", "p1", patch, UpdateOptions::default())
        .await
        .unwrap();
    assert_eq!(
        db.find(conn, "player", "p1", None).await.unwrap(),
        Some(doc(json!({"_id": "p1", "name": "snow"})))
    );

    db.rollback(conn).unwrap();

    assert_eq!(
        db.find(conn, "player", "p1", None).await.unwrap(),
        Some(stored("p1", rain()))
    );
    let by_rain = db
        .find_by_index(conn, "player", "name", &json!("rain"), None)
        .await
        .unwrap();
    assert_eq!(ids(&by_rain), vec!["p1"]);
    assert!(
        db.find_by_index(conn, "player", "name", &json!("snow"), None)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_second_connection_waits_for_commit() {
    let db = started(
        player_config(shard_config(0, 0)),
        Arc::new(MemoryBackend::new()),
    )
    .await;
    let first = db.connect();
    let second = db.connect();

    db.insert(first, "player", "p1", rain()).await.unwrap();
    db.commit(first).unwrap();

    db.find_for_update(first, "player", "p1", None).await.unwrap();

    let waiter = {
        let db = Arc::clone(&db);
        tokio::spawn(async move {
            let doc = db.find_for_update(second, "player", "p1", None).await?;
            db.commit(second)?;
            Ok::<_, MemDbError>(doc)
        })
    };

    sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    let mut patch = Patch::new();
    patch.insert("age".into(), Some(json!(31)));
    db.update(first, "player", "p1", patch, UpdateOptions::default())
        .await
        .unwrap();
    db.commit(first).unwrap();

    // The waiter observes the first connection's committed write
    let seen = waiter.await.unwrap().unwrap().unwrap();
    assert_eq!(seen.get("age"), Some(&json!(31)));
}

#[tokio::test]
async fn test_lock_timeout() {
    let config = player_config(ShardConfig {
        lock_timeout_ms: 50,
        ..shard_config(0, 0)
    });
    let db = started(config, Arc::new(MemoryBackend::new())).await;
    let first = db.connect();
    let second = db.connect();

    db.lock(first, "player", "p1").await.unwrap();

    let err = db.lock(second, "player", "p1").await.unwrap_err();
    assert!(matches!(err, MemDbError::LockTimeout(_)));
    assert!(err.is_transient());

    db.rollback(first).unwrap();
    db.lock(second, "player", "p1").await.unwrap();
}

#[tokio::test]
async fn test_find_cached_hides_uncommitted_writes() {
    let db = started(
        player_config(shard_config(0, 0)),
        Arc::new(MemoryBackend::new()),
    )
    .await;
    let writer = db.connect();
    let reader = db.connect();

    db.insert(writer, "player", "p1", rain()).await.unwrap();
    assert_eq!(db.find_cached(reader, "player", "p1").await.unwrap(), None);

    db.commit(writer).unwrap();
    assert_eq!(
        db.find_cached(reader, "player", "p1").await.unwrap(),
        Some(stored("p1", rain()))
    );

    db.update(writer, "player", "p1", set_fields(&snow()), UpdateOptions::default())
        .await
        .unwrap();
    assert_eq!(
        db.find_cached(reader, "player", "p1").await.unwrap(),
        Some(stored("p1", rain()))
    );
    assert_eq!(
        db.find(reader, "player", "p1", None).await.unwrap(),
        Some(stored("p1", snow()))
    );

    db.commit(writer).unwrap();
    assert_eq!(
        db.find_cached(reader, "player", "p1").await.unwrap(),
        Some(stored("p1", snow()))
    );
}

#[tokio::test]
async fn test_idle_documents_evicted_and_reloaded() {
    let backend = Arc::new(MemoryBackend::new());
    let db = started(player_config(shard_config(0, 100)), backend.clone()).await;
    let conn = db.connect();

    db.insert(conn, "player", "p1", rain()).await.unwrap();
    db.commit(conn).unwrap();

    let shard = db.shard("s1").unwrap();
    assert!(shard.is_cached("player:p1"));

    sleep(Duration::from_millis(400)).await;
    assert!(!shard.is_cached("player:p1"));

    assert_eq!(
        db.find(conn, "player", "p1", None).await.unwrap(),
        Some(stored("p1", rain()))
    );
    assert!(shard.is_cached("player:p1"));
}

#[tokio::test]
async fn test_crash_after_flush_recovers_from_backend() {
    let backend = Arc::new(MemoryBackend::new());
    let config = player_config(shard_config(0, 0));
    let db = started(config.clone(), backend.clone()).await;
    let conn = db.connect();

    db.insert(conn, "player", "p1", rain()).await.unwrap();
    db.insert(conn, "player", "p2", snow()).await.unwrap();
    db.commit(conn).unwrap();
    sleep(Duration::from_millis(200)).await;

    let shard = db.shard("s1").unwrap();
    shard.force_crash().await.unwrap();
    assert_eq!(shard.state(), ShardState::Crashed);
    assert!(matches!(
        db.find(conn, "player", "p1", None).await,
        Err(MemDbError::NotReady { .. })
    ));
    db.stop(false).await.unwrap();

    let restarted = started(config, backend).await;
    let conn = restarted.connect();
    assert_eq!(
        restarted.find(conn, "player", "p1", None).await.unwrap(),
        Some(stored("p1", rain()))
    );
    assert_eq!(
        restarted.find(conn, "player", "p2", None).await.unwrap(),
        Some(stored("p2", snow()))
    );
    let by_snow = restarted
        .find_by_index(conn, "player", "name", &json!("snow"), None)
        .await
        .unwrap();
    assert_eq!(ids(&by_snow), vec!["p2"]);
}

#[tokio::test]
async fn test_crash_before_flush_loses_writes() {
    let backend = Arc::new(MemoryBackend::new());
    let config = player_config(shard_config(60_000, 0));
    let db = started(config.clone(), backend.clone()).await;
    let conn = db.connect();

    db.insert(conn, "player", "p1", rain()).await.unwrap();
    db.commit(conn).unwrap();
    db.shard("s1").unwrap().force_crash().await.unwrap();
    db.stop(false).await.unwrap();

    let restarted = started(config, backend.clone()).await;
    let conn = restarted.connect();
    assert_eq!(restarted.find(conn, "player", "p1", None).await.unwrap(), None);
    assert_eq!(backend.write_count(), 0);
}

#[tokio::test]
async fn test_graceful_stop_flushes_pending_writes() {
    let backend = Arc::new(MemoryBackend::new());
    let db = started(player_config(shard_config(60_000, 0)), backend.clone()).await;
    let conn = db.connect();

    db.insert(conn, "player", "p1", rain()).await.unwrap();
    db.commit(conn).unwrap();
    assert_eq!(backend.snapshot("player:p1"), None);

    db.stop(false).await.unwrap();
    assert_eq!(backend.snapshot("player:p1"), Some(stored("p1", rain())));
    assert!(matches!(
        db.find(conn, "player", "p1", None).await,
        Err(MemDbError::NotReady { .. })
    ));
}

#[tokio::test]
async fn test_shared_backend_idle_and_persistence() {
    let backend = Arc::new(MemoryBackend::new());
    let config = player_config(shard_config(100, 200));
    let first = started(config.clone(), backend.clone()).await;
    let second = started(config, backend.clone()).await;

    let conn = first.connect();
    first.insert(conn, "player", "p1", rain()).await.unwrap();
    first.commit(conn).unwrap();
    sleep(Duration::from_millis(500)).await;

    let other = second.connect();
    let shard = second.shard("s1").unwrap();
    assert!(!shard.is_cached("player:p1"));
    let loaded = second.find_cached(other, "player", "p1").await.unwrap();
    assert_eq!(loaded, Some(stored("p1", rain())));
    assert!(shard.is_cached("player:p1"));
    assert_eq!(second.find_cached(other, "player", "p1").await.unwrap(), loaded);

    second.remove(other, "player", "p1").await.unwrap();
    second.commit(other).unwrap();
    sleep(Duration::from_millis(500)).await;

    assert_eq!(backend.snapshot("player:p1"), None);
    assert_eq!(first.find_cached(conn, "player", "p1").await.unwrap(), None);
}

#[tokio::test]
async fn test_disconnect_rolls_back() {
    let db = started(
        player_config(shard_config(0, 0)),
        Arc::new(MemoryBackend::new()),
    )
    .await;
    let conn = db.connect();
    let other = db.connect();

    db.insert(conn, "player", "p1", rain()).await.unwrap();
    db.disconnect(conn).unwrap();

    assert_eq!(db.find(other, "player", "p1", None).await.unwrap(), None);
    // Lock was released by the rollback
    db.lock(other, "player", "p1").await.unwrap();

    assert!(matches!(
        db.find(conn, "player", "p1", None).await,
        Err(MemDbError::ConnectionNotFound(_))
    ));
    assert!(db.disconnect(conn).is_err());
}

#[tokio::test]
async fn test_unconfigured_collection_is_created() {
    let db = started(
        player_config(shard_config(0, 0)),
        Arc::new(MemoryBackend::new()),
    )
    .await;
    let conn = db.connect();

    db.insert(conn, "item", "sword", doc(json!({"name": "sword"})))
        .await
        .unwrap();
    db.commit(conn).unwrap();

    assert!(db.find(conn, "item", "sword", None).await.unwrap().is_some());
    assert!(matches!(
        db.find_by_index(conn, "item", "name", &json!("sword"), None)
            .await,
        Err(MemDbError::IndexNotFound { .. })
    ));
    assert!(matches!(
        db.find(conn, "bad:name", "x", None).await,
        Err(MemDbError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_insert_update_remove_errors() {
    let db = started(
        player_config(shard_config(0, 0)),
        Arc::new(MemoryBackend::new()),
    )
    .await;
    let conn = db.connect();

    let missing = db
        .update(conn, "player", "p1", set_fields(&rain()), UpdateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(missing, MemDbError::DocumentNotFound(_)));

    db.update(conn, "player", "p1", set_fields(&rain()), UpdateOptions::upsert())
        .await
        .unwrap();
    let duplicate = db.insert(conn, "player", "p1", rain()).await.unwrap_err();
    assert!(matches!(duplicate, MemDbError::AlreadyExists(_)));
    db.commit(conn).unwrap();

    let by_rain = db
        .find_by_index(conn, "player", "name", &json!("rain"), None)
        .await
        .unwrap();
    assert_eq!(ids(&by_rain), vec!["p1"]);

    // Removing twice is a no-op the second time
    db.remove(conn, "player", "p1").await.unwrap();
    db.remove(conn, "player", "p1").await.unwrap();
    db.commit(conn).unwrap();
    assert_eq!(db.find(conn, "player", "p1", None).await.unwrap(), None);
}

#[tokio::test]
async fn test_reserved_id_is_not_indexable() {
    let db = started(
        player_config(shard_config(0, 0)),
        Arc::new(MemoryBackend::new()),
    )
    .await;
    let conn = db.connect();

    let err = db.insert(conn, "player", "_id", rain()).await.unwrap_err();
    assert!(matches!(err, MemDbError::UnsupportedIndexKey(_)));

    // Nothing reaches the commit
    db.commit(conn).unwrap();
    assert_eq!(db.find(conn, "player", "_id", None).await.unwrap(), None);
    assert!(
        db.find_by_index(conn, "player", "name", &json!("rain"), None)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_failed_insert_is_undone() {
    let config = player_config(ShardConfig {
        lock_timeout_ms: 50,
        ..shard_config(0, 0)
    });
    let db = started(config, Arc::new(MemoryBackend::new())).await;
    let first = db.connect();
    let second = db.connect();

    db.insert(first, "player", "p1", rain()).await.unwrap();

    // The "rain" index entry is held by `first`
    let err = db.insert(second, "player", "p2", rain()).await.unwrap_err();
    assert!(matches!(err, MemDbError::LockTimeout(_)));
    assert_eq!(db.find(second, "player", "p2", None).await.unwrap(), None);

    db.commit(first).unwrap();
    db.insert(second, "player", "p2", rain()).await.unwrap();
    db.commit(second).unwrap();

    let conn = db.connect();
    assert_eq!(
        db.find(conn, "player", "p2", None).await.unwrap(),
        Some(stored("p2", rain()))
    );
    let found = db
        .find_by_index(conn, "player", "name", &json!("rain"), None)
        .await
        .unwrap();
    assert_eq!(ids(&found), vec!["p1", "p2"]);
}

#[tokio::test]
async fn test_failed_update_keeps_index_consistent() {
    let config = player_config(ShardConfig {
        lock_timeout_ms: 50,
        ..shard_config(0, 0)
    });
    let db = started(config, Arc::new(MemoryBackend::new())).await;
    let first = db.connect();
    let second = db.connect();

    db.insert(second, "player", "p2", snow()).await.unwrap();
    db.commit(second).unwrap();
    db.insert(first, "player", "p1", rain()).await.unwrap();

    let err = db
        .update(
            second,
            "player",
            "p2",
            set_fields(&doc(json!({"name": "rain"}))),
            UpdateOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MemDbError::LockTimeout(_)));

    assert_eq!(
        db.find(second, "player", "p2", None).await.unwrap(),
        Some(stored("p2", snow()))
    );
    let found = db
        .find_by_index(second, "player", "name", &json!("snow"), None)
        .await
        .unwrap();
    assert_eq!(ids(&found), vec!["p2"]);

    // A retry after the entry is free commits a consistent index
    db.commit(first).unwrap();
    db.update(
        second,
        "player",
        "p2",
        set_fields(&doc(json!({"name": "rain"}))),
        UpdateOptions::default(),
    )
    .await
    .unwrap();
    db.commit(second).unwrap();

    let conn = db.connect();
    let rain = db
        .find_by_index(conn, "player", "name", &json!("rain"), None)
        .await
        .unwrap();
    assert_eq!(ids(&rain), vec!["p1", "p2"]);
    assert!(
        db.find_by_index(conn, "player", "name", &json!("snow"), None)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_index_collections_are_not_addressable() {
    let db = started(
        player_config(shard_config(0, 0)),
        Arc::new(MemoryBackend::new()),
    )
    .await;
    let conn = db.connect();

    let err = db
        .find(conn, "__index_player_name", "\"rain\"", None)
        .await
        .unwrap_err();
    assert!(matches!(err, MemDbError::InvalidInput(_)));
    let err = db
        .insert(conn, "__index_player_name", "x", rain())
        .await
        .unwrap_err();
    assert!(matches!(err, MemDbError::InvalidInput(_)));
}

#[tokio::test]
async fn test_file_backend_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        backend: BackendConfig::File {
            data_dir: dir.path().to_string_lossy().into_owned(),
        },
        ..player_config(shard_config(60_000, 0))
    };

    let db = Database::open(config.clone()).unwrap();
    db.start().await.unwrap();
    let conn = db.connect();
    db.insert(conn, "player", "p1", rain()).await.unwrap();
    db.commit(conn).unwrap();
    db.stop(false).await.unwrap();

    let reopened = Database::open(config).unwrap();
    reopened.start().await.unwrap();
    let conn = reopened.connect();
    assert_eq!(
        reopened.find(conn, "player", "p1", None).await.unwrap(),
        Some(stored("p1", rain()))
    );
    let by_rain = reopened
        .find_by_index(conn, "player", "name", &json!("rain"), None)
        .await
        .unwrap();
    assert_eq!(ids(&by_rain), vec!["p1"]);
}

#[tokio::test]
async fn test_flush_retried_while_backend_unavailable() {
    let backend = Arc::new(MemoryBackend::new());
    let db = started(player_config(shard_config(0, 0)), backend.clone()).await;
    let conn = db.connect();

    db.insert(conn, "player", "p1", rain()).await.unwrap();
    backend.set_available(false);
    db.commit(conn).unwrap();
    sleep(Duration::from_millis(50)).await;

    let shard = db.shard("s1").unwrap();
    assert!(shard.is_dirty("player:p1"));

    backend.set_available(true);
    sleep(Duration::from_millis(300)).await;
    assert!(!shard.is_dirty("player:p1"));
    assert_eq!(backend.snapshot("player:p1"), Some(stored("p1", rain())));
}
