//! Building factories from configuration

use idbkit::{
    open_factory, BackendConfig, Config, CoreError, ObjectStoreParameters, TransactionMode, Value,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

async fn write_greeting(config: &Config) {
    let factory = open_factory(config).unwrap();
    let db = factory
        .open("greetings", 1, |change| async move {
            change.transaction.create_object_store(
                "greetings",
                ObjectStoreParameters::default().auto_increment(),
            )?;
            Ok::<_, CoreError>(())
        })
        .await
        .unwrap();
    let tx = db
        .transaction(&["greetings"], TransactionMode::ReadWrite)
        .unwrap();
    let key = tx
        .object_store("greetings")
        .unwrap()
        .add(&Value::from("hello"))
        .await
        .unwrap();
    assert_eq!(key, idbkit::Key::from(1));
    tx.done().await.unwrap();
    db.close();
}

async fn greeting_count(config: &Config) -> u64 {
    let factory = open_factory(config).unwrap();
    let db = factory.open_latest("greetings").await.unwrap();
    if db.version() == 1 && db.object_store_names().is_empty() {
        return 0;
    }
    let tx = db
        .transaction(&["greetings"], TransactionMode::ReadOnly)
        .unwrap();
    let count = tx
        .object_store("greetings")
        .unwrap()
        .count(idbkit::Query::All)
        .await
        .unwrap();
    count
}

#[tokio::test]
async fn test_sqlite_config_persists_across_factories() {
    let dir = TempDir::new().unwrap();
    let config = Config::sqlite(dir.path().join("idb"));
    write_greeting(&config).await;
    assert_eq!(greeting_count(&config).await, 1);
    assert!(dir.path().join("idb").is_dir());
}

#[tokio::test]
async fn test_memory_config_starts_empty() {
    let config = Config::memory();
    write_greeting(&config).await;
    // A fresh memory factory shares nothing with the previous one.
    assert_eq!(greeting_count(&config).await, 0);
}

#[tokio::test]
async fn test_config_loaded_from_file() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    let file = dir.path().join("idbkit.json");
    let json = serde_json::json!({
        "backend": { "kind": "sqlite", "path": data },
        "log_filter": "idbkit=debug",
    });
    std::fs::write(&file, json.to_string()).unwrap();

    let config = Config::from_file(&file).unwrap();
    assert_eq!(config.backend, BackendConfig::Sqlite { path: data });
    // Another test may already have installed a subscriber.
    let _ = idbkit::tracing::try_init_with_filter(&config.log_filter);
    write_greeting(&config).await;
    assert_eq!(greeting_count(&config).await, 1);
}

#[test]
fn test_missing_config_file_is_io_error() {
    let err = Config::from_file("/nonexistent/idbkit.json").unwrap_err();
    assert!(matches!(err, idbkit::Error::Io(_)));
}
