//! Factory-level tests for the SQLite backend, including reopening files

use std::path::Path;
use std::sync::Arc;

use idbkit_core::{
    Database, Direction, Error, Factory, IndexParameters, Key, ObjectStoreParameters, Query,
    TransactionMode, Value,
};
use idbkit_sqlite::SqliteBackend;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

fn file_factory(dir: &Path) -> Factory {
    Factory::new(Arc::new(SqliteBackend::open_dir(dir).unwrap()))
}

fn note(title: &str, tag: &str) -> Value {
    Value::from(json!({ "title": title, "tag": tag }))
}

/// `notes` with generated keys and a `byTag` index.
async fn open_notes(factory: &Factory) -> Database {
    factory
        .open("notes", 1, |change| async move {
            let notes = change.transaction.create_object_store(
                "notes",
                ObjectStoreParameters::default().auto_increment(),
            )?;
            notes.create_index("byTag", "tag", IndexParameters::default())?;
            Ok::<_, Error>(())
        })
        .await
        .unwrap()
}

async fn add_notes(db: &Database, rows: &[(&str, &str)]) -> Vec<Key> {
    let tx = db.transaction(&["notes"], TransactionMode::ReadWrite).unwrap();
    let mut keys = Vec::new();
    {
        let notes = tx.object_store("notes").unwrap();
        for (title, tag) in rows {
            keys.push(notes.add(&note(title, tag)).await.unwrap());
        }
    }
    tx.done().await.unwrap();
    keys
}

#[tokio::test]
async fn test_records_indexes_and_counter_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let factory = file_factory(dir.path());
        let db = open_notes(&factory).await;
        let keys = add_notes(&db, &[("milk", "shopping"), ("rust", "work")]).await;
        assert_eq!(keys, vec![Key::from(1), Key::from(2)]);
        db.close();
    }

    let factory = file_factory(dir.path());
    let db = factory.open_latest("notes").await.unwrap();
    assert_eq!(db.version(), 1);
    assert_eq!(db.object_store_names(), vec!["notes".to_string()]);

    let keys = add_notes(&db, &[("eggs", "shopping")]).await;
    assert_eq!(keys, vec![Key::from(3)]);

    let tx = db.transaction(&["notes"], TransactionMode::ReadOnly).unwrap();
    let notes = tx.object_store("notes").unwrap();
    assert_eq!(notes.count(Query::All).await.unwrap(), 3);
    let shopping = notes
        .index("byTag")
        .unwrap()
        .get_all_keys("shopping", None)
        .await
        .unwrap();
    assert_eq!(shopping, vec![Key::from(1), Key::from(3)]);
    let first = notes.get(1).await.unwrap().unwrap();
    assert_eq!(first.get("title"), Some(Value::from("milk")));
}

#[tokio::test]
async fn test_aborted_writes_never_reach_disk() {
    let dir = TempDir::new().unwrap();
    {
        let factory = file_factory(dir.path());
        let db = open_notes(&factory).await;
        add_notes(&db, &[("milk", "shopping")]).await;

        let tx = db.transaction(&["notes"], TransactionMode::ReadWrite).unwrap();
        {
            let notes = tx.object_store("notes").unwrap();
            notes.add(&note("draft", "work")).await.unwrap();
            notes.delete(1).await.unwrap();
        }
        tx.abort().unwrap();
        assert!(matches!(tx.done().await, Err(Error::Abort(_))));
        db.close();
    }

    let factory = file_factory(dir.path());
    let db = factory.open_latest("notes").await.unwrap();
    let tx = db.transaction(&["notes"], TransactionMode::ReadOnly).unwrap();
    let notes = tx.object_store("notes").unwrap();
    assert_eq!(notes.get_all_keys(Query::All, None).await.unwrap(), vec![Key::from(1)]);
    // The aborted add does not advance the key generator.
    drop(notes);
    drop(tx);
    assert_eq!(add_notes(&db, &[("eggs", "shopping")]).await, vec![Key::from(2)]);
}

#[tokio::test]
async fn test_failed_upgrade_keeps_previous_schema_on_disk() {
    let dir = TempDir::new().unwrap();
    {
        let factory = file_factory(dir.path());
        let db = open_notes(&factory).await;
        add_notes(&db, &[("milk", "shopping")]).await;
        db.close();

        let err = factory
            .open("notes", 2, |change| async move {
                change.transaction.delete_object_store("notes")?;
                change
                    .transaction
                    .create_object_store("archive", ObjectStoreParameters::default())?;
                Err::<(), _>(Error::Abort("upgrade cancelled".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Abort(_)));
    }

    let factory = file_factory(dir.path());
    let db = factory.open_latest("notes").await.unwrap();
    assert_eq!(db.version(), 1);
    assert_eq!(db.object_store_names(), vec!["notes".to_string()]);
    let tx = db.transaction(&["notes"], TransactionMode::ReadOnly).unwrap();
    assert_eq!(tx.object_store("notes").unwrap().count(Query::All).await.unwrap(), 1);
}

#[tokio::test]
async fn test_upgrade_renames_and_backfills() {
    let dir = TempDir::new().unwrap();
    let factory = file_factory(dir.path());
    let db = open_notes(&factory).await;
    add_notes(&db, &[("milk", "shopping"), ("rust", "work")]).await;
    db.close();

    let db = factory
        .open("notes", 2, |change| async move {
            let store = change.transaction.object_store("notes")?;
            store.rename("memos")?;
            store.create_index("byTitle", "title", IndexParameters::unique())?;
            Ok::<_, Error>(())
        })
        .await
        .unwrap();
    db.close();

    let factory = file_factory(dir.path());
    let db = factory.open_latest("notes").await.unwrap();
    assert_eq!(db.version(), 2);
    let tx = db.transaction(&["memos"], TransactionMode::ReadOnly).unwrap();
    let memos = tx.object_store("memos").unwrap();
    assert_eq!(memos.index_names(), vec!["byTag".to_string(), "byTitle".to_string()]);
    let by_title = memos.index("byTitle").unwrap();
    assert_eq!(by_title.get_key("rust").await.unwrap(), Some(Key::from(2)));
}

#[tokio::test]
async fn test_cursor_sees_uncommitted_writes() {
    let dir = TempDir::new().unwrap();
    let factory = file_factory(dir.path());
    let db = open_notes(&factory).await;
    add_notes(&db, &[("a", "x"), ("b", "y"), ("c", "x")]).await;

    let tx = db.transaction(&["notes"], TransactionMode::ReadWrite).unwrap();
    {
        let notes = tx.object_store("notes").unwrap();
        notes.delete(2).await.unwrap();
        notes.put_with_key(&note("z", "x"), 10).await.unwrap();

        let by_tag = notes.index("byTag").unwrap();
        let cursor = by_tag
            .open_cursor("x", Direction::Prev)
            .await
            .unwrap()
            .unwrap();
        let mut seen = Vec::new();
        loop {
            seen.push(cursor.primary_key().unwrap().unwrap());
            if !cursor.next().await.unwrap() {
                break;
            }
        }
        assert_eq!(seen, vec![Key::from(10), Key::from(3), Key::from(1)]);
    }
    tx.done().await.unwrap();
}

#[tokio::test]
async fn test_clear_then_rewrite_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let factory = file_factory(dir.path());
        let db = open_notes(&factory).await;
        add_notes(&db, &[("a", "x"), ("b", "y")]).await;

        let tx = db.transaction(&["notes"], TransactionMode::ReadWrite).unwrap();
        {
            let notes = tx.object_store("notes").unwrap();
            notes.clear().await.unwrap();
            notes.put_with_key(&note("c", "x"), 1).await.unwrap();
            notes.put_with_key(&note("d", "z"), 5).await.unwrap();
            notes.delete(5).await.unwrap();

            let by_tag = notes.index("byTag").unwrap();
            assert_eq!(by_tag.count("x").await.unwrap(), 1);
            assert_eq!(by_tag.count("y").await.unwrap(), 0);
            assert_eq!(by_tag.count("z").await.unwrap(), 0);
        }
        tx.done().await.unwrap();
        db.close();
    }

    let factory = file_factory(dir.path());
    let db = factory.open_latest("notes").await.unwrap();
    let tx = db.transaction(&["notes"], TransactionMode::ReadOnly).unwrap();
    let notes = tx.object_store("notes").unwrap();
    assert_eq!(notes.count(Query::All).await.unwrap(), 1);
    let by_tag = notes.index("byTag").unwrap();
    assert_eq!(by_tag.count("x").await.unwrap(), 1);
    assert_eq!(by_tag.count("y").await.unwrap(), 0);
    assert_eq!(by_tag.count("z").await.unwrap(), 0);
    assert_eq!(by_tag.get_all_keys("x", None).await.unwrap(), vec![Key::from(1)]);
    let first = notes.get(1).await.unwrap().unwrap();
    assert_eq!(first.get("title"), Some(Value::from("c")));
}

#[tokio::test]
async fn test_delete_database_removes_file() {
    let dir = TempDir::new().unwrap();
    let factory = file_factory(dir.path());
    let db = open_notes(&factory).await;
    db.close();
    assert_eq!(factory.databases().unwrap().len(), 1);

    factory.delete_database("notes").unwrap();
    assert!(factory.databases().unwrap().is_empty());
    let files = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(files, 0);

    let db = factory.open_latest("notes").await.unwrap();
    assert_eq!(db.version(), 1);
    assert!(db.object_store_names().is_empty());
}

#[tokio::test]
async fn test_databases_lists_files_from_previous_runs() {
    let dir = TempDir::new().unwrap();
    {
        let factory = file_factory(dir.path());
        open_notes(&factory).await.close();
        factory
            .open("empty", 3, |_| async { Ok::<_, Error>(()) })
            .await
            .unwrap()
            .close();
    }

    let factory = file_factory(dir.path());
    let names: Vec<(String, u64)> = factory
        .databases()
        .unwrap()
        .into_iter()
        .map(|info| (info.name, info.version))
        .collect();
    assert_eq!(names, vec![("empty".to_string(), 3), ("notes".to_string(), 1)]);
}
