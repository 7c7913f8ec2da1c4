use serde_json::json;
use tether_ir::{NullNavigationPolicy, Symbol};
use tether_runtime::entities::sample_model;
use tether_runtime::store::{DataStore, Record, WriteOp};
use tether_runtime::{RuntimeError, Store, StoreConfig};

async fn store() -> Store {
    Store::in_memory(sample_model(NullNavigationPolicy::default()).unwrap())
        .await
        .expect("Failed to open store")
}

fn insert(table: &str, value: serde_json::Value) -> WriteOp {
    WriteOp::Insert {
        table: Symbol::from(table),
        key_field: Symbol::from("id"),
        record: value.as_object().cloned().unwrap_or_else(Record::new),
    }
}

#[tokio::test]
async fn ensure_created_is_idempotent() {
    let store = store().await;

    assert!(store.ensure_created().await.unwrap());
    assert!(!store.ensure_created().await.unwrap());

    let datastore = store.datastore();
    assert!(datastore.table_exists("child").await.unwrap());
    assert!(datastore.table_exists("parent").await.unwrap());
    assert_eq!(store.count("Parent").await.unwrap(), 0);
}

#[tokio::test]
async fn ensure_deleted_drops_every_table() {
    let store = store().await;
    store.ensure_created().await.unwrap();
    store.schema_manager().ensure_deleted().await.unwrap();

    assert!(!store.datastore().table_exists("parent").await.unwrap());
    assert!(!store.datastore().table_exists("child").await.unwrap());
}

#[tokio::test]
async fn in_memory_database_survives_between_calls() {
    let store = store().await;
    store.ensure_created().await.unwrap();
    store.datastore().apply(&[insert("child", json!({ "id": 1 }))]).await.unwrap();

    // Same single connection, so the rows are still there.
    let cloned = store.clone();
    assert_eq!(cloned.count("Child").await.unwrap(), 1);
}

#[tokio::test]
async fn foreign_keys_are_enforced() {
    let store = store().await;
    store.ensure_created().await.unwrap();
    let datastore = store.datastore();

    let err = datastore
        .apply(&[insert("parent", json!({ "id": 1, "child_id": 5 }))])
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Database(_)));

    datastore
        .apply(&[
            insert("child", json!({ "id": 5 })),
            insert("parent", json!({ "id": 1, "child_id": 5 })),
        ])
        .await
        .unwrap();

    // Restrict: a referenced child cannot go away underneath its parent.
    let err = datastore
        .apply(&[WriteOp::Delete {
            table: Symbol::from("child"),
            key_field: Symbol::from("id"),
            key: 5,
        }])
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Database(_)));
    assert_eq!(store.count("Child").await.unwrap(), 1);
}

#[tokio::test]
async fn required_columns_reject_null() {
    let store = store().await;
    store.ensure_created().await.unwrap();

    let err = store
        .datastore()
        .apply(&[
            insert("child", json!({ "id": 1 })),
            insert("parent", json!({ "id": 1, "child_id": null })),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Database(_)));
    assert_eq!(store.count("Child").await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_entities_are_reported() {
    let store = store().await;
    let err = store.count("Nope").await.unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownEntity(name) if name == "Nope"));
}

#[tokio::test]
async fn file_database_is_created_on_demand() {
    let dir = std::env::temp_dir().join(format!("tether-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("store.db");
    let config = StoreConfig::default().with_url(format!("sqlite://{}", path.display()));

    let store = Store::connect(&config, sample_model(NullNavigationPolicy::default()).unwrap())
        .await
        .unwrap();
    store.ensure_created().await.unwrap();
    store.close().await;
    assert!(path.exists());

    let reopened = Store::connect(&config, sample_model(NullNavigationPolicy::default()).unwrap())
        .await
        .unwrap();
    assert!(!reopened.ensure_created().await.unwrap());
    reopened.close().await;

    std::fs::remove_dir_all(&dir).unwrap();
}
