//! End-to-end tests for the Factory/Database/Transaction API on the memory backend

use std::sync::Arc;
use std::time::Duration;

use idbkit_core::value::MAX_DEPTH;
use idbkit_core::{
    Database, Error, Factory, IndexParameters, Key, KeyRange, MemoryBackend,
    ObjectStoreParameters, Query, TransactionMode, TransactionState, Value,
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn factory() -> Factory {
    Factory::new(Arc::new(MemoryBackend::new()))
}

fn customer(id: i32, name: &str) -> Value {
    Value::from(json!({ "id": id, "name": name }))
}

/// "shop" database: `customers` keyed by `id` with a `byName` index.
async fn open_shop(factory: &Factory) -> Database {
    factory
        .open("shop", 1, |change| async move {
            let customers = change
                .transaction
                .create_object_store("customers", ObjectStoreParameters::key_path("id"))?;
            customers.create_index("byName", "name", IndexParameters::default())?;
            Ok::<_, Error>(())
        })
        .await
        .unwrap()
}

async fn seed(db: &Database, rows: &[(i32, &str)]) {
    let tx = db
        .transaction(&["customers"], TransactionMode::ReadWrite)
        .unwrap();
    {
        let customers = tx.object_store("customers").unwrap();
        for (id, name) in rows {
            customers.put(&customer(*id, name)).await.unwrap();
        }
    }
    tx.done().await.unwrap();
}

#[tokio::test]
async fn test_shop_index_lookups() {
    let factory = factory();
    let db = open_shop(&factory).await;
    seed(&db, &[(1, "Alice"), (2, "Bob"), (3, "Alice")]).await;

    let tx = db
        .transaction(&["customers"], TransactionMode::ReadOnly)
        .unwrap();
    let index = tx.object_store("customers").unwrap().index("byName").unwrap();

    let first = index.get("Alice").await.unwrap().unwrap();
    assert_eq!(first.get("id"), Some(Value::Number(1.0)));

    let all = index.get_all("Alice", None).await.unwrap();
    assert_eq!(all, vec![customer(1, "Alice"), customer(3, "Alice")]);
    assert_eq!(index.count("Alice").await.unwrap(), 2);
    assert_eq!(
        index.get_all_keys("Alice", None).await.unwrap(),
        vec![Key::from(1), Key::from(3)]
    );
    assert_eq!(index.get_key("Bob").await.unwrap(), Some(Key::from(2)));
    assert_eq!(index.get("Carol").await.unwrap(), None);
}

#[tokio::test]
async fn test_auto_increment_generates_sequential_keys() {
    let factory = factory();
    let db = factory
        .open("log", 1, |change| async move {
            change.transaction.create_object_store(
                "entries",
                ObjectStoreParameters::default().auto_increment(),
            )?;
            change.transaction.create_object_store(
                "events",
                ObjectStoreParameters::key_path("id").auto_increment(),
            )?;
            Ok::<_, Error>(())
        })
        .await
        .unwrap();

    let tx = db
        .transaction(&["entries", "events"], TransactionMode::ReadWrite)
        .unwrap();
    {
        let entries = tx.object_store("entries").unwrap();
        assert_eq!(entries.add(&Value::from("first")).await.unwrap(), Key::from(1));
        assert_eq!(entries.add(&Value::from("second")).await.unwrap(), Key::from(2));
        // An explicit key past the generator moves it forward.
        entries.put_with_key(&Value::from("tenth"), 10).await.unwrap();
        assert_eq!(entries.add(&Value::from("next")).await.unwrap(), Key::from(11));

        let events = tx.object_store("events").unwrap();
        let key = events.add(&Value::from(json!({ "kind": "boot" }))).await.unwrap();
        assert_eq!(key, Key::from(1));
        let stored = events.get(1).await.unwrap().unwrap();
        assert_eq!(stored.get("id"), Some(Value::Number(1.0)));
        assert_eq!(stored.get("kind"), Some(Value::from("boot")));
    }
    tx.done().await.unwrap();
}

#[tokio::test]
async fn test_overlapping_readwrite_waits_for_first() {
    let factory = factory();
    let db = open_shop(&factory).await;

    let first = db
        .transaction(&["customers"], TransactionMode::ReadWrite)
        .unwrap();
    let first_store = first.object_store("customers").unwrap();
    first_store.put(&customer(1, "Alice")).await.unwrap();

    let second = db
        .transaction(&["customers"], TransactionMode::ReadWrite)
        .unwrap();
    let second_store = second.object_store("customers").unwrap();
    let pending = second_store.get(1);
    assert_eq!(first.state(), TransactionState::Active);
    assert_eq!(second.state(), TransactionState::Pending);

    drop(first_store);
    first.done().await.unwrap();

    // Queued while pending, run after the first committed.
    assert_eq!(pending.await.unwrap(), Some(customer(1, "Alice")));
    assert_eq!(second.state(), TransactionState::Active);
    drop(second_store);
    second.done().await.unwrap();
}

#[tokio::test]
async fn test_readonly_transactions_run_together() {
    let factory = factory();
    let db = open_shop(&factory).await;
    seed(&db, &[(1, "Alice")]).await;

    let a = db.transaction(&["customers"], TransactionMode::ReadOnly).unwrap();
    let b = db.transaction(&["customers"], TransactionMode::ReadOnly).unwrap();
    let count_a = a.object_store("customers").unwrap().count(Query::All);
    let count_b = b.object_store("customers").unwrap().count(Query::All);

    // `a` holds an untaken result, so it is still open when `b` answers.
    assert_eq!(count_b.await.unwrap(), 1);
    assert_eq!(a.state(), TransactionState::Active);
    assert_eq!(b.state(), TransactionState::Active);
    assert_eq!(count_a.await.unwrap(), 1);
}

#[tokio::test]
async fn test_idle_transaction_commits_while_handles_live() {
    let factory = factory();
    let db = open_shop(&factory).await;

    let writer = db
        .transaction(&["customers"], TransactionMode::ReadWrite)
        .unwrap();
    let customers = writer.object_store("customers").unwrap();
    customers.put(&customer(1, "Alice")).await.unwrap();

    // Nothing more is queued, so the writer commits and releases its scope
    // even though `writer` and `customers` are still alive.
    let reader = db
        .transaction(&["customers"], TransactionMode::ReadOnly)
        .unwrap();
    let read = reader.object_store("customers").unwrap().get(1);
    let found = tokio::time::timeout(Duration::from_secs(2), read)
        .await
        .expect("reader waited on an idle writer")
        .unwrap();
    assert_eq!(found, Some(customer(1, "Alice")));

    assert_eq!(writer.state(), TransactionState::Finished);
    assert!(matches!(
        customers.put(&customer(2, "Bob")).await,
        Err(Error::TransactionInactive(_))
    ));
    writer.done().await.unwrap();
}

#[tokio::test]
async fn test_untaken_result_keeps_transaction_open() {
    let factory = factory();
    let db = open_shop(&factory).await;

    let tx = db
        .transaction(&["customers"], TransactionMode::ReadWrite)
        .unwrap();
    let customers = tx.object_store("customers").unwrap();
    let first = customers.put(&customer(1, "Alice"));
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert_eq!(tx.state(), TransactionState::Active);

    first.await.unwrap();
    let second = customers.put(&customer(2, "Bob")).await;
    assert_eq!(second.unwrap(), Key::from(2));
    drop(customers);
    tx.done().await.unwrap();
}

#[tokio::test]
async fn test_put_then_delete_leaves_nothing() {
    let factory = factory();
    let db = open_shop(&factory).await;

    let tx = db
        .transaction(&["customers"], TransactionMode::ReadWrite)
        .unwrap();
    {
        let customers = tx.object_store("customers").unwrap();
        customers.put(&customer(7, "Dana")).await.unwrap();
        customers.delete(7).await.unwrap();
    }
    tx.done().await.unwrap();

    let tx = db
        .transaction(&["customers"], TransactionMode::ReadOnly)
        .unwrap();
    let customers = tx.object_store("customers").unwrap();
    assert_eq!(customers.get(7).await.unwrap(), None);
    assert_eq!(customers.count(Query::All).await.unwrap(), 0);
    let by_name = customers.index("byName").unwrap();
    assert_eq!(by_name.count("Dana").await.unwrap(), 0);
}

#[tokio::test]
async fn test_index_follows_updates() {
    let factory = factory();
    let db = open_shop(&factory).await;
    seed(&db, &[(1, "Alice"), (2, "Bob")]).await;
    seed(&db, &[(1, "Carol")]).await;

    let tx = db
        .transaction(&["customers"], TransactionMode::ReadOnly)
        .unwrap();
    let by_name = tx.object_store("customers").unwrap().index("byName").unwrap();
    assert_eq!(by_name.count("Alice").await.unwrap(), 0);
    assert_eq!(by_name.get_key("Carol").await.unwrap(), Some(Key::from(1)));
    assert_eq!(by_name.count(Query::All).await.unwrap(), 2);
}

#[tokio::test]
async fn test_explicit_abort_rolls_back_writes_and_counter() {
    let factory = factory();
    let db = factory
        .open("log", 1, |change| async move {
            change.transaction.create_object_store(
                "entries",
                ObjectStoreParameters::default().auto_increment(),
            )?;
            Ok::<_, Error>(())
        })
        .await
        .unwrap();

    let tx = db.transaction(&["entries"], TransactionMode::ReadWrite).unwrap();
    {
        let entries = tx.object_store("entries").unwrap();
        entries.add(&Value::from("lost")).await.unwrap();
        entries.add(&Value::from("also lost")).await.unwrap();
    }
    tx.abort().unwrap();
    assert!(matches!(tx.error(), Some(Error::Abort(_))));
    assert!(matches!(tx.clone().done().await, Err(Error::Abort(_))));
    assert_eq!(tx.state(), TransactionState::Finished);

    let tx = db.transaction(&["entries"], TransactionMode::ReadWrite).unwrap();
    {
        let entries = tx.object_store("entries").unwrap();
        assert_eq!(entries.count(Query::All).await.unwrap(), 0);
        assert_eq!(entries.add(&Value::from("kept")).await.unwrap(), Key::from(1));
    }
    tx.done().await.unwrap();
}

#[tokio::test]
async fn test_failed_request_aborts_transaction() {
    let factory = factory();
    let db = open_shop(&factory).await;
    seed(&db, &[(1, "Alice")]).await;

    let tx = db
        .transaction(&["customers"], TransactionMode::ReadWrite)
        .unwrap();
    let customers = tx.object_store("customers").unwrap();
    let first = customers.put(&customer(2, "Bob"));
    let duplicate = customers.add(&customer(1, "Again"));
    let after = customers.put(&customer(3, "Carol"));
    drop(customers);

    first.await.unwrap();
    assert!(matches!(duplicate.await, Err(Error::Constraint(_))));
    assert!(matches!(after.await, Err(Error::Abort(_))));
    assert!(matches!(tx.done().await, Err(Error::Constraint(_))));

    let tx = db
        .transaction(&["customers"], TransactionMode::ReadOnly)
        .unwrap();
    let customers = tx.object_store("customers").unwrap();
    assert_eq!(customers.get_all_keys(Query::All, None).await.unwrap(), vec![Key::from(1)]);
}

#[tokio::test]
async fn test_unique_index_violation() {
    let factory = factory();
    let db = factory
        .open("users", 1, |change| async move {
            let users = change
                .transaction
                .create_object_store("users", ObjectStoreParameters::key_path("id"))?;
            users.create_index("byEmail", "email", IndexParameters::unique())?;
            Ok::<_, Error>(())
        })
        .await
        .unwrap();

    let tx = db.transaction(&["users"], TransactionMode::ReadWrite).unwrap();
    let users = tx.object_store("users").unwrap();
    users
        .put(&Value::from(json!({ "id": 1, "email": "a@example.com" })))
        .await
        .unwrap();
    let err = users
        .put(&Value::from(json!({ "id": 2, "email": "a@example.com" })))
        .await
        .unwrap_err();
    assert_eq!(err.name(), "ConstraintError");
}

#[tokio::test]
async fn test_failed_upgrade_reverts_schema_and_version() {
    let factory = factory();
    let db = open_shop(&factory).await;
    seed(&db, &[(1, "Alice")]).await;
    db.close();

    let err = factory
        .open("shop", 2, |change| async move {
            assert_eq!(change.old_version, 1);
            let tx = &change.transaction;
            tx.create_object_store("orders", ObjectStoreParameters::default())?;
            tx.object_store("customers")?.rename("clients")?;
            tx.object_store("clients")?.delete_index("byName")?;
            Err::<(), _>(Error::Constraint("upgrade refused".into()))
        })
        .await
        .unwrap_err();
    assert_eq!(err, Error::Constraint("upgrade refused".into()));

    let db = factory.open_latest("shop").await.unwrap();
    assert_eq!(db.version(), 1);
    assert_eq!(db.object_store_names(), vec!["customers".to_string()]);
    let tx = db
        .transaction(&["customers"], TransactionMode::ReadOnly)
        .unwrap();
    let customers = tx.object_store("customers").unwrap();
    assert_eq!(customers.index_names(), vec!["byName".to_string()]);
    assert_eq!(customers.count(Query::All).await.unwrap(), 1);
}

#[tokio::test]
async fn test_upgrade_renames_and_backfills_index() {
    let factory = factory();
    let db = open_shop(&factory).await;
    seed(&db, &[(1, "Alice"), (2, "Bob")]).await;
    db.close();

    let db = factory
        .open("shop", 2, |change| async move {
            let customers = change.transaction.object_store("customers")?;
            customers.rename("clients")?;
            assert_eq!(customers.name(), "clients");
            customers.create_index("byId", "id", IndexParameters::unique())?;
            Ok::<_, Error>(())
        })
        .await
        .unwrap();
    assert_eq!(db.version(), 2);
    assert_eq!(db.object_store_names(), vec!["clients".to_string()]);

    let tx = db.transaction(&["clients"], TransactionMode::ReadOnly).unwrap();
    let clients = tx.object_store("clients").unwrap();
    assert_eq!(
        clients.index_names(),
        vec!["byId".to_string(), "byName".to_string()]
    );
    let by_id = clients.index("byId").unwrap();
    assert_eq!(by_id.count(Query::All).await.unwrap(), 2);
    let by_name = clients.index("byName").unwrap();
    assert_eq!(by_name.get_key("Bob").await.unwrap(), Some(Key::from(2)));
}

#[tokio::test]
async fn test_version_rules() {
    let factory = factory();
    let db = open_shop(&factory).await;

    let err = factory.open("shop", 0, |_| async { Ok::<_, Error>(()) }).await.unwrap_err();
    assert!(matches!(err, Error::InvalidAccess(_)));

    // Another connection is open.
    let err = factory.open("shop", 2, |_| async { Ok::<_, Error>(()) }).await.unwrap_err();
    assert!(matches!(err, Error::Version(_)));

    db.close();
    assert!(db.is_closed());
    factory.open("shop", 3, |_| async { Ok::<_, Error>(()) }).await.unwrap();
    let err = factory.open("shop", 2, |_| async { Ok::<_, Error>(()) }).await.unwrap_err();
    assert!(matches!(err, Error::Version(_)));
}

#[tokio::test]
async fn test_open_is_refused_during_an_upgrade() {
    let factory = factory();
    open_shop(&factory).await.close();

    let other = factory.clone();
    factory
        .open("shop", 2, |_| async move {
            let err = other.open("shop", 1, |_| async { Ok::<_, Error>(()) }).await.unwrap_err();
            assert!(matches!(err, Error::Version(_)));
            let err = other.open_latest("shop").await.unwrap_err();
            assert!(matches!(err, Error::Version(_)));
            Ok::<_, Error>(())
        })
        .await
        .unwrap();
    assert_eq!(factory.open_latest("shop").await.unwrap().version(), 2);
}

#[tokio::test]
async fn test_values_nested_too_deep_are_rejected() {
    fn nested(depth: usize) -> Value {
        let mut value = Value::from("leaf");
        for _ in 0..depth {
            value = Value::array(vec![value]);
        }
        value
    }
    // The record object itself is one level.
    let record = |id: i32, depth: usize| {
        Value::object(vec![("id", Value::from(id)), ("payload", nested(depth))])
    };

    let factory = factory();
    let db = open_shop(&factory).await;
    let tx = db
        .transaction(&["customers"], TransactionMode::ReadWrite)
        .unwrap();
    {
        let customers = tx.object_store("customers").unwrap();
        let deepest = record(1, MAX_DEPTH - 1);
        customers.put(&deepest).await.unwrap();
        assert!(matches!(
            customers.put(&record(2, MAX_DEPTH)).await,
            Err(Error::DataClone(_))
        ));
        // Rejected before queueing, so the transaction carries on.
        assert_eq!(customers.get(1).await.unwrap(), Some(deepest));
        assert_eq!(customers.count(Query::All).await.unwrap(), 1);
    }
    tx.done().await.unwrap();
}

#[tokio::test]
async fn test_transaction_argument_errors() {
    let factory = factory();
    let db = open_shop(&factory).await;

    assert!(matches!(
        db.transaction(&[], TransactionMode::ReadOnly),
        Err(Error::InvalidAccess(_))
    ));
    assert!(matches!(
        db.transaction(&["missing"], TransactionMode::ReadOnly),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        db.transaction(&["customers"], TransactionMode::VersionChange),
        Err(Error::InvalidAccess(_))
    ));

    let tx = db
        .transaction(&["customers"], TransactionMode::ReadOnly)
        .unwrap();
    let customers = tx.object_store("customers").unwrap();
    assert!(matches!(
        customers.put(&customer(1, "Alice")).await,
        Err(Error::ReadOnly(_))
    ));
    assert!(matches!(
        customers.create_index("x", "x", IndexParameters::default()),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        customers.get(f64::NAN).await,
        Err(Error::Data(_))
    ));

    db.close();
    assert!(matches!(
        db.transaction(&["customers"], TransactionMode::ReadOnly),
        Err(Error::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_requests_after_commit_are_inactive() {
    let factory = factory();
    let db = open_shop(&factory).await;

    let tx = db
        .transaction(&["customers"], TransactionMode::ReadWrite)
        .unwrap();
    let customers = tx.object_store("customers").unwrap();
    customers.put(&customer(1, "Alice")).await.unwrap();
    tx.commit().unwrap();
    assert!(matches!(
        customers.put(&customer(2, "Bob")).await,
        Err(Error::TransactionInactive(_))
    ));
    assert!(matches!(tx.abort(), Err(Error::InvalidState(_))));
    drop(customers);
    tx.done().await.unwrap();
}

#[tokio::test]
async fn test_key_range_queries() {
    let factory = factory();
    let db = open_shop(&factory).await;
    seed(
        &db,
        &[(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")],
    )
    .await;

    let tx = db
        .transaction(&["customers"], TransactionMode::ReadWrite)
        .unwrap();
    let customers = tx.object_store("customers").unwrap();
    let middle = KeyRange::bound(2, 4, false, true).unwrap();
    assert_eq!(
        customers.get_all_keys(middle.clone(), None).await.unwrap(),
        vec![Key::from(2), Key::from(3)]
    );
    assert_eq!(
        customers
            .get_all_keys(KeyRange::lower_bound(3, true), Some(1))
            .await
            .unwrap(),
        vec![Key::from(4)]
    );
    assert_eq!(customers.count(KeyRange::upper_bound(3, false)).await.unwrap(), 3);

    customers.delete(middle).await.unwrap();
    assert_eq!(
        customers.get_all_keys(Query::All, None).await.unwrap(),
        vec![Key::from(1), Key::from(4), Key::from(5)]
    );
    customers.clear().await.unwrap();
    assert_eq!(customers.count(Query::All).await.unwrap(), 0);
    assert!(matches!(customers.delete(Query::All).await, Err(Error::Data(_))));
}

#[tokio::test]
async fn test_delete_database_closes_connections() {
    let factory = factory();
    let db = open_shop(&factory).await;
    assert_eq!(factory.databases().unwrap().len(), 1);

    factory.delete_database("shop").unwrap();
    assert!(db.is_closed());
    assert!(factory.databases().unwrap().is_empty());

    let reopened = factory.open_latest("shop").await.unwrap();
    assert_eq!(reopened.version(), 1);
    assert!(reopened.object_store_names().is_empty());
}
