/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use storage::dom::bindings::error::Error;
use storage::dom::bindings::value::Value;
use storage::dom::eventtarget::event_handler;
use storage::dom::globalscope::GlobalScope;
use storage::dom::idbcursor::IDBCursorDirection;
use storage::dom::idbdatabase::{IDBDatabase, IDBObjectStoreParameters};
use storage::dom::idbkeyrange::IDBKeyRange;
use storage::dom::idbobjectstore::IDBIndexParameters;
use storage::dom::idbtransaction::IDBTransactionMode;
use storage::indexeddb::engines::SqliteBackend;
use storage::new_indexeddb_backend;
use storage_traits::indexeddb::KeyPath;

use crate::{global_with, numbers, open_with_upgrade, put_all, read, run};

fn sqlite_global(dir: &Path) -> Rc<GlobalScope> {
    global_with(Box::new(SqliteBackend::new(dir)))
}

fn book(id: i32, author: &str) -> (Value, Option<Value>) {
    (
        Value::object([("id", Value::from(id)), ("author", Value::from(author))]),
        None,
    )
}

fn create_library(db: &Rc<IDBDatabase>) {
    let params = IDBObjectStoreParameters {
        key_path: Some(KeyPath::from("id")),
        auto_increment: true,
    };
    let store = db.create_object_store("books", &params).unwrap();
    store
        .create_index("by_author", KeyPath::from("author"), &IDBIndexParameters::default())
        .unwrap();
}

#[test]
fn records_survive_a_new_backend() {
    let dir = tempfile::tempdir().unwrap();
    {
        let global = sqlite_global(dir.path());
        let db = open_with_upgrade(&global, "library", 1, |db, _| create_library(db));
        put_all(
            &global,
            &db,
            "books",
            vec![book(1, "le guin"), book(2, "banks"), book(3, "le guin")],
        );
        db.close();
        run(&global);
    }

    let global = sqlite_global(dir.path());
    let infos = global.indexed_db().databases().unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!((infos[0].name.as_str(), infos[0].version), ("library", 1));

    let db = open_with_upgrade(&global, "library", 1, |_, _| panic!("no upgrade expected"));
    assert_eq!(db.object_store_names(), ["books"]);
    let keys = read(&global, &db, "books", |store| {
        store
            .index("by_author")
            .unwrap()
            .get_all_keys(Some(&"le guin".into()), None)
            .unwrap()
    });
    assert_eq!(numbers(&keys), [1.0, 3.0]);

    let transaction = db
        .transaction(&["books"], IDBTransactionMode::Readwrite)
        .unwrap();
    let request = transaction
        .object_store("books")
        .unwrap()
        .add(&Value::object([("author", Value::from("jemisin"))]), None)
        .unwrap();
    run(&global);
    assert_eq!(request.result().unwrap().as_value().as_number(), Some(4.0));
}

#[test]
fn aborted_writes_are_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let global = sqlite_global(dir.path());
    let db = open_with_upgrade(&global, "library", 1, |db, _| create_library(db));
    put_all(&global, &db, "books", vec![book(1, "banks")]);

    let transaction = db
        .transaction(&["books"], IDBTransactionMode::Readwrite)
        .unwrap();
    let store = transaction.object_store("books").unwrap();
    store.clear().unwrap();
    let (value, _) = book(2, "le guin");
    store.put(&value, None).unwrap();
    transaction.abort().unwrap();
    run(&global);

    let keys = read(&global, &db, "books", |store| store.get_all_keys(None, None).unwrap());
    assert_eq!(numbers(&keys), [1.0]);
}

#[test]
fn aborted_upgrade_keeps_the_stored_version() {
    let dir = tempfile::tempdir().unwrap();
    let global = sqlite_global(dir.path());
    let db = open_with_upgrade(&global, "library", 1, |db, _| create_library(db));
    db.close();

    let request = global.indexed_db().open("library", Some(2)).unwrap();
    let upgrade_request = Rc::downgrade(&request);
    request.set_onupgradeneeded(event_handler(move |_| {
        let request = upgrade_request.upgrade().unwrap();
        let db = request.result().unwrap().as_database().unwrap();
        db.delete_object_store("books").unwrap();
        request.transaction().unwrap().abort().unwrap();
    }));
    run(&global);
    assert_eq!(request.error().unwrap(), Some(Error::Abort));
    drop(request);

    let global = sqlite_global(dir.path());
    let db = open_with_upgrade(&global, "library", 1, |_, _| panic!("no upgrade expected"));
    assert_eq!(db.version(), 1);
    assert_eq!(db.object_store_names(), ["books"]);
}

#[test]
fn cursors_walk_sqlite_records_backwards() {
    let dir = tempfile::tempdir().unwrap();
    let global = sqlite_global(dir.path());
    let db = open_with_upgrade(&global, "numbers", 1, |db, _| {
        db.create_object_store("s", &IDBObjectStoreParameters::default())
            .unwrap();
    });
    put_all(
        &global,
        &db,
        "s",
        (1..=5)
            .map(|key| (Value::from(key * 10), Some(Value::from(key))))
            .collect(),
    );

    let transaction = db
        .transaction(&["s"], IDBTransactionMode::Readonly)
        .unwrap();
    let range = IDBKeyRange::bound(&Value::from(2), &Value::from(4), false, true).unwrap();
    let request = transaction
        .object_store("s")
        .unwrap()
        .open_cursor(Some(&range.into()), IDBCursorDirection::Prev)
        .unwrap();
    let values = Rc::new(RefCell::new(vec![]));
    let seen = values.clone();
    let weak_request = Rc::downgrade(&request);
    request.set_onsuccess(event_handler(move |_| {
        let request = weak_request.upgrade().unwrap();
        if let Some(cursor) = request.result().unwrap().as_cursor() {
            seen.borrow_mut().push(cursor.value().as_number().unwrap());
            cursor.continue_(None).unwrap();
        }
    }));
    run(&global);
    assert_eq!(*values.borrow(), [30.0, 20.0]);
}

#[test]
fn deleting_removes_the_database_directory() {
    let dir = tempfile::tempdir().unwrap();
    let global = sqlite_global(dir.path());
    let db = open_with_upgrade(&global, "library", 3, |db, _| create_library(db));
    db.close();

    let request = global.indexed_db().delete_database("library").unwrap();
    let old_versions = Rc::new(RefCell::new(vec![]));
    let seen = old_versions.clone();
    request.set_onsuccess(event_handler(move |event| {
        let change = event.as_version_change().unwrap();
        seen.borrow_mut().push((change.old_version(), change.new_version()));
    }));
    run(&global);

    assert_eq!(*old_versions.borrow(), [(3, None)]);
    assert!(global.indexed_db().databases().unwrap().is_empty());
}

#[test]
fn default_backend_stores_under_the_config_dir() {
    let dir = tempfile::tempdir().unwrap();
    let global = global_with(new_indexeddb_backend(dir.path()));
    open_with_upgrade(&global, "library", 1, |db, _| create_library(db));
    assert!(dir.path().join("IndexedDB").is_dir());
}
