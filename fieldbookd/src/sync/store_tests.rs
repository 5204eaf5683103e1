use super::*;
use serde_json::json;
use tempfile::tempdir;

async fn make_store() -> LocalStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    LocalStore::from_pool(pool).await.unwrap()
}

fn session(key: &str, client_id: &str, started_at: i64) -> Record {
    Record {
        key: key.into(),
        data: json!({ "id": key, "client_id": client_id, "started_at": started_at }),
        provenance: Provenance::Confirmed,
        watermark: 0,
        updated_at: started_at,
    }
}

#[tokio::test]
async fn put_get_and_delete_record() {
    let store = make_store().await;
    let record = Record {
        key: "cl_1".into(),
        data: json!({ "id": "cl_1", "name": "Smith" }),
        provenance: Provenance::Pending,
        watermark: 3,
        updated_at: 100,
    };

    store.put(Table::Clients, &record).await.unwrap();
    assert_eq!(
        store.get(Table::Clients, "cl_1").await.unwrap(),
        Some(record)
    );

    assert!(store.delete(Table::Clients, "cl_1").await.unwrap());
    assert!(store.get(Table::Clients, "cl_1").await.unwrap().is_none());
    assert!(!store.delete(Table::Clients, "cl_1").await.unwrap());
}

#[tokio::test]
async fn put_overwrites_existing_key() {
    let store = make_store().await;
    store
        .put(Table::Sessions, &session("se_1", "cl_1", 10))
        .await
        .unwrap();
    store
        .put(Table::Sessions, &session("se_1", "cl_2", 20))
        .await
        .unwrap();

    assert!(
        store
            .query_by_index(Table::Sessions, IndexKey::ClientId("cl_1"))
            .await
            .unwrap()
            .is_empty()
    );
    let moved = store
        .query_by_index(Table::Sessions, IndexKey::ClientId("cl_2"))
        .await
        .unwrap();
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].data["started_at"], 20);
}

#[tokio::test]
async fn query_sessions_by_client_newest_first() {
    let store = make_store().await;
    store
        .put_batch(&[
            (Table::Sessions, session("se_1", "cl_1", 100)),
            (Table::Sessions, session("se_2", "cl_2", 200)),
            (Table::Sessions, session("se_3", "cl_1", 300)),
        ])
        .await
        .unwrap();

    let sessions = store
        .query_by_index(Table::Sessions, IndexKey::ClientId("cl_1"))
        .await
        .unwrap();
    let keys: Vec<_> = sessions.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["se_3", "se_1"]);

    let at = store
        .query_by_index(Table::Sessions, IndexKey::StartedAt(200))
        .await
        .unwrap();
    assert_eq!(at.len(), 1);
    assert_eq!(at[0].key, "se_2");
}

#[tokio::test]
async fn query_rejects_undeclared_index() {
    let store = make_store().await;
    let err = store
        .query_by_index(Table::Clients, IndexKey::ClientId("cl_1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::UnsupportedIndex {
            table: Table::Clients,
            index: Index::ClientId
        }
    ));
}

#[tokio::test]
async fn batch_is_all_or_nothing() {
    let dir = tempdir().unwrap();
    let store = LocalStore::open(&StoreLocation::File(dir.path().join("fieldbook.db")))
        .await
        .unwrap();
    let mut bad = session("se_2", "cl_1", 2);
    bad.key = "not-current".into();

    let result = store
        .put_batch(&[
            (Table::Sessions, session("se_1", "cl_1", 1)),
            (Table::ActiveSession, bad),
        ])
        .await;

    assert!(result.is_err());
    assert!(store.get(Table::Sessions, "se_1").await.unwrap().is_none());
}

#[tokio::test]
async fn actions_are_listed_in_id_order() {
    let store = make_store().await;
    let first = store
        .append_action(ActionKind::CreateClient, &json!({ "id": "local-a" }), 10)
        .await
        .unwrap();
    let second = store
        .append_action(ActionKind::StartSession, &json!({ "id": "local-b" }), 5)
        .await
        .unwrap();
    assert!(second > first);

    let head = store.head_unsynced_action().await.unwrap().unwrap();
    assert_eq!(head.id, first);
    assert_eq!(head.kind, ActionKind::CreateClient);
    assert_eq!(head.status, ActionStatus::Pending);
    assert_eq!(head.attempt, 0);

    let mut tx = store.begin().await.unwrap();
    tx.mark_action_synced(first).await.unwrap();
    tx.commit().await.unwrap();

    let unsynced = store.list_actions(false).await.unwrap();
    assert_eq!(unsynced.len(), 1);
    assert_eq!(unsynced[0].id, second);
    let synced = store.list_actions(true).await.unwrap();
    assert_eq!(synced[0].id, first);
    assert_eq!(store.count_unsynced_actions().await.unwrap(), 1);
}

#[tokio::test]
async fn action_ids_are_not_reused_after_delete() {
    let store = make_store().await;
    let first = store
        .append_action(ActionKind::CreateClient, &json!({}), 1)
        .await
        .unwrap();
    store.delete_action(first).await.unwrap();
    let second = store
        .append_action(ActionKind::CreateClient, &json!({}), 2)
        .await
        .unwrap();
    assert!(second > first);
    assert_eq!(store.last_action_id().await.unwrap(), second);
}

#[tokio::test]
async fn failure_bookkeeping_and_reset() {
    let store = make_store().await;
    let id = store
        .append_action(ActionKind::CreateInvoice, &json!({ "total": 1 }), 1)
        .await
        .unwrap();
    store
        .record_action_failure(id, ActionStatus::Failed, 1, None, "422: total too low")
        .await
        .unwrap();
    assert_eq!(store.count_blocked_actions().await.unwrap(), 1);

    let action = store.get_action(id).await.unwrap().unwrap();
    assert_eq!(action.status, ActionStatus::Failed);
    assert_eq!(action.last_error.as_deref(), Some("422: total too low"));

    assert!(
        store
            .reset_action(id, Some(&json!({ "total": 50 })))
            .await
            .unwrap()
    );
    let action = store.get_action(id).await.unwrap().unwrap();
    assert_eq!(action.status, ActionStatus::Pending);
    assert_eq!(action.payload, json!({ "total": 50 }));
    assert!(action.last_error.is_none());
    assert_eq!(store.count_blocked_actions().await.unwrap(), 0);
}

#[tokio::test]
async fn prunes_only_old_synced_actions() {
    let store = make_store().await;
    let old = store
        .append_action(ActionKind::CreateClient, &json!({}), 10)
        .await
        .unwrap();
    let unsynced = store
        .append_action(ActionKind::CreateClient, &json!({}), 10)
        .await
        .unwrap();
    let mut tx = store.begin().await.unwrap();
    tx.mark_action_synced(old).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(store.prune_synced_actions(20).await.unwrap(), 1);
    assert!(store.get_action(old).await.unwrap().is_none());
    assert!(store.get_action(unsynced).await.unwrap().is_some());
}

#[tokio::test]
async fn confirmed_through_stops_below_first_unsynced_action() {
    let store = make_store().await;
    assert_eq!(store.confirmed_through().await.unwrap(), 0);

    let first = store
        .append_action(ActionKind::CreateClient, &json!({}), 10)
        .await
        .unwrap();
    let second = store
        .append_action(ActionKind::UpdateClient, &json!({}), 10)
        .await
        .unwrap();
    assert_eq!(store.confirmed_through().await.unwrap(), first - 1);

    let mut tx = store.begin().await.unwrap();
    tx.mark_action_synced(first).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(store.confirmed_through().await.unwrap(), first);

    let mut tx = store.begin().await.unwrap();
    tx.mark_action_synced(second).await.unwrap();
    tx.commit().await.unwrap();
    store.prune_synced_actions(20).await.unwrap();
    assert_eq!(store.confirmed_through().await.unwrap(), second);
}

#[tokio::test]
async fn id_mappings_are_upserted() {
    let store = make_store().await;
    let mut tx = store.begin().await.unwrap();
    tx.record_id_mapping("local-1", "cl_1", 1).await.unwrap();
    tx.record_id_mapping("local-1", "cl_9", 2).await.unwrap();
    tx.commit().await.unwrap();

    let map = store.id_map().await.unwrap();
    assert_eq!(map.get("local-1").map(String::as_str), Some("cl_9"));
}

#[tokio::test]
async fn reopening_current_store_is_a_no_op() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sync").join("fieldbook.db");
    let location = StoreLocation::File(path.clone());

    let store = LocalStore::open(&location).await.unwrap();
    assert!(store.is_persistent());
    assert_eq!(
        store.schema_version().await.unwrap(),
        expected_schema_version()
    );
    let id = store
        .append_action(ActionKind::CreateClient, &json!({ "name": "Smith" }), 1)
        .await
        .unwrap();
    let device_id = store.device_id().to_string();
    store.close().await;

    let reopened = LocalStore::open(&location).await.unwrap();
    assert_eq!(
        reopened.schema_version().await.unwrap(),
        expected_schema_version()
    );
    assert_eq!(reopened.device_id(), device_id);
    let action = reopened.get_action(id).await.unwrap().unwrap();
    assert_eq!(action.payload["name"], "Smith");
}

#[tokio::test]
async fn open_upgrades_older_store_without_data_loss() {
    let dir = tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    std::fs::create_dir_all(&migrations).unwrap();
    std::fs::copy(
        concat!(env!("CARGO_MANIFEST_DIR"), "/migrations/0001_initial.sql"),
        migrations.join("0001_initial.sql"),
    )
    .unwrap();

    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    Migrator::new(migrations.as_path())
        .await
        .unwrap()
        .run(&pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO pending_actions (kind, payload, created_at, synced)
         VALUES ('start-session', '{\"client_id\":\"cl_1\"}', 42, 0)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let store = LocalStore::from_pool(pool).await.unwrap();
    assert_eq!(
        store.schema_version().await.unwrap(),
        expected_schema_version()
    );

    let action = store.head_unsynced_action().await.unwrap().unwrap();
    assert_eq!(action.kind, ActionKind::StartSession);
    assert_eq!(action.status, ActionStatus::Pending);
    assert_eq!(action.attempt, 0);
    assert_eq!(action.created_at, 42);
    assert!(store.id_map().await.unwrap().is_empty());
}

#[tokio::test]
async fn store_from_newer_version_is_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fieldbook.db");
    let location = StoreLocation::File(path.clone());
    let store = LocalStore::open(&location).await.unwrap();
    sqlx::query(
        "INSERT INTO _sqlx_migrations (version, description, success, checksum, execution_time)
         VALUES (9999, 'from the future', 1, X'00', 0)",
    )
    .execute(&store.pool)
    .await
    .unwrap();
    store.close().await;

    let err = LocalStore::open(&location).await.err().unwrap();
    assert!(matches!(err, StoreError::StoreCorrupt(_)), "{err:?}");
}

#[tokio::test]
async fn garbage_file_is_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fieldbook.db");
    std::fs::write(&path, "this is not a database ".repeat(256)).unwrap();

    let err = LocalStore::open(&StoreLocation::File(path)).await.err().unwrap();
    assert!(matches!(err, StoreError::StoreCorrupt(_)), "{err:?}");
}

#[tokio::test]
async fn unwritable_location_is_unavailable_and_falls_back_to_memory() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"file, not a directory").unwrap();
    let path = blocker.join("fieldbook.db");

    let err = LocalStore::open(&StoreLocation::File(path.clone()))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::StorageUnavailable(_)), "{err:?}");

    let (store, warning) = LocalStore::open_or_fallback(&path).await.unwrap();
    assert!(!store.is_persistent());
    assert!(warning.is_some());
    store
        .append_action(ActionKind::CreateClient, &json!({}), 1)
        .await
        .unwrap();
    assert_eq!(store.count_unsynced_actions().await.unwrap(), 1);
}

#[tokio::test]
async fn reset_replaces_corrupt_store_with_empty_one() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fieldbook.db");
    std::fs::write(&path, "this is not a database ".repeat(256)).unwrap();

    let store = LocalStore::reset(&path).await.unwrap();
    assert_eq!(store.count_unsynced_actions().await.unwrap(), 0);
    assert_eq!(
        store.schema_version().await.unwrap(),
        expected_schema_version()
    );
}
