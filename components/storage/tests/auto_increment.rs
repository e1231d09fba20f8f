/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::rc::Rc;

use storage::dom::bindings::error::Error;
use storage::dom::bindings::value::Value;
use storage::dom::eventtarget::event_handler;
use storage::dom::globalscope::GlobalScope;
use storage::dom::idbdatabase::{IDBDatabase, IDBObjectStoreParameters};
use storage::dom::idbobjectstore::{IDBIndexParameters, IDBObjectStore};
use storage::dom::idbrequest::IDBRequest;
use storage::dom::idbtransaction::IDBTransactionMode;
use storage_traits::indexeddb::KeyPath;

use crate::{memory_global, numbers, open_with_upgrade, read, run};

fn generated(key_path: Option<&str>) -> IDBObjectStoreParameters {
    IDBObjectStoreParameters {
        key_path: key_path.map(KeyPath::from),
        auto_increment: true,
    }
}

fn counter_db(global: &Rc<GlobalScope>, key_path: Option<&'static str>) -> Rc<IDBDatabase> {
    open_with_upgrade(global, "counter", 1, move |db, _| {
        db.create_object_store("s", &generated(key_path)).unwrap();
    })
}

/// Runs `write` in a read-write transaction and returns the keys its
/// requests produced, or their errors.
fn write(
    global: &Rc<GlobalScope>,
    db: &Rc<IDBDatabase>,
    write: impl FnOnce(&Rc<IDBObjectStore>) -> Vec<Rc<IDBRequest>>,
) -> Vec<Result<f64, Error>> {
    let transaction = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    let requests = write(&transaction.object_store("s").unwrap());
    for request in &requests {
        request.set_onerror(event_handler(|event| event.prevent_default()));
    }
    run(global);
    requests
        .iter()
        .map(|request| match request.error().unwrap() {
            Some(error) => Err(error),
            None => Ok(request.result().unwrap().as_value().as_number().unwrap()),
        })
        .collect()
}

#[test]
fn out_of_line_keys_count_up_from_one() {
    let global = memory_global();
    let db = counter_db(&global, None);
    let keys = write(&global, &db, |store| {
        (0..3)
            .map(|_| store.add(&Value::from("v"), None).unwrap())
            .collect()
    });
    assert_eq!(keys, [Ok(1.0), Ok(2.0), Ok(3.0)]);

    let stored = read(&global, &db, "s", |store| store.get_all_keys(None, None).unwrap());
    assert_eq!(numbers(&stored), [1.0, 2.0, 3.0]);
}

#[test]
fn generated_keys_are_injected_at_the_key_path() {
    let global = memory_global();
    let db = counter_db(&global, Some("meta.id"));
    let original = Value::object([("name", Value::from("first"))]);
    let keys = write(&global, &db, |store| vec![store.add(&original, None).unwrap()]);
    assert_eq!(keys, [Ok(1.0)]);
    assert!(original.get("meta").is_none());

    let stored = read(&global, &db, "s", |store| store.get(&1.into()).unwrap());
    let id = stored
        .get("meta")
        .and_then(|meta| meta.get("id"))
        .and_then(|id| id.as_number());
    assert_eq!(id, Some(1.0));
    assert_eq!(stored.get("name").unwrap().as_str(), Some("first"));
}

#[test]
fn values_that_cannot_hold_the_key_are_rejected() {
    let global = memory_global();
    let db = counter_db(&global, Some("id"));
    let transaction = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    let store = transaction.object_store("s").unwrap();
    assert_eq!(store.add(&Value::from(5), None).err(), Some(Error::Data));
    assert_eq!(
        store
            .add(&Value::object([]), Some(&Value::from(1)))
            .err(),
        Some(Error::Data)
    );
    let explicit = store
        .add(&Value::object([("id", Value::from(7))]), None)
        .unwrap();
    run(&global);
    assert_eq!(explicit.result().unwrap().as_value().as_number(), Some(7.0));
}

#[test]
fn explicit_keys_move_the_generator_forward() {
    let global = memory_global();
    let db = counter_db(&global, None);
    let keys = write(&global, &db, |store| {
        vec![
            store.add(&Value::from("a"), None).unwrap(),
            store.put(&Value::from("b"), Some(&Value::from(10))).unwrap(),
            store.add(&Value::from("c"), None).unwrap(),
            store.put(&Value::from("d"), Some(&Value::from(5))).unwrap(),
            store.put(&Value::from("e"), Some(&Value::from(12.5))).unwrap(),
            store.add(&Value::from("g"), None).unwrap(),
        ]
    });
    assert_eq!(
        keys,
        [Ok(1.0), Ok(10.0), Ok(11.0), Ok(5.0), Ok(12.5), Ok(13.0)]
    );
}

#[test]
fn failed_writes_do_not_consume_keys() {
    let global = memory_global();
    let db = open_with_upgrade(&global, "counter", 1, |db, _| {
        let store = db.create_object_store("s", &generated(Some("id"))).unwrap();
        let unique = IDBIndexParameters {
            unique: true,
            multi_entry: false,
        };
        store
            .create_index("by_name", KeyPath::from("name"), &unique)
            .unwrap();
    });
    let named = |name: &str| Value::object([("name", Value::from(name))]);
    let keys = write(&global, &db, |store| {
        vec![
            store.add(&named("a"), None).unwrap(),
            store.add(&named("a"), None).unwrap(),
            store.add(&named("b"), None).unwrap(),
        ]
    });
    assert_eq!(keys, [Ok(1.0), Err(Error::Constraint), Ok(2.0)]);
}

#[test]
fn aborted_transactions_roll_back_the_generator() {
    let global = memory_global();
    let db = counter_db(&global, None);
    write(&global, &db, |store| vec![store.add(&Value::from("kept"), None).unwrap()]);

    let transaction = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    let store = transaction.object_store("s").unwrap();
    let request = store.add(&Value::from("lost"), None).unwrap();
    let weak_transaction = Rc::downgrade(&transaction);
    request.set_onsuccess(event_handler(move |_| {
        weak_transaction.upgrade().unwrap().abort().unwrap();
    }));
    run(&global);
    assert_eq!(transaction.error(), None);

    let keys = write(&global, &db, |store| vec![store.add(&Value::from("next"), None).unwrap()]);
    assert_eq!(keys, [Ok(2.0)]);
}

#[test]
fn exhausted_generator_fails_with_constraint() {
    let global = memory_global();
    let db = counter_db(&global, None);
    let keys = write(&global, &db, |store| {
        vec![
            store
                .put(&Value::from("last"), Some(&Value::from(9007199254740992.0)))
                .unwrap(),
            store.add(&Value::from("overflow"), None).unwrap(),
            store
                .put(&Value::from("explicit"), Some(&Value::from(1)))
                .unwrap(),
        ]
    });
    assert_eq!(
        keys,
        [Ok(9007199254740992.0), Err(Error::Constraint), Ok(1.0)]
    );
}

#[test]
fn auto_increment_is_reported_by_the_store() {
    let global = memory_global();
    let db = counter_db(&global, Some("id"));
    let transaction = db
        .transaction(&["s"], IDBTransactionMode::Readonly)
        .unwrap();
    let store = transaction.object_store("s").unwrap();
    assert!(store.auto_increment());
    assert_eq!(store.key_path(), Some(KeyPath::from("id")));
}
