/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::rc::Rc;

use storage::dom::bindings::error::Error;
use storage::dom::bindings::value::Value;
use storage::dom::eventtarget::event_handler;
use storage::dom::globalscope::GlobalScope;
use storage::dom::idbdatabase::{IDBDatabase, IDBObjectStoreParameters};
use storage::dom::idbobjectstore::IDBObjectStore;
use storage::dom::idbrequest::{IDBRequest, IDBRequestReadyState};
use storage::dom::idbtransaction::IDBTransactionMode;

use crate::{Log, memory_global, new_log, open_with_upgrade, push, put_all, read, run};

fn store_db(global: &Rc<GlobalScope>) -> Rc<IDBDatabase> {
    open_with_upgrade(global, "db", 1, |db, _| {
        db.create_object_store("s", &IDBObjectStoreParameters::default())
            .unwrap();
    })
}

#[test]
fn microtasks_run_before_request_events() {
    let global = memory_global();
    let db = store_db(&global);
    let log = new_log();

    let transaction = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    let store = transaction.object_store("s").unwrap();
    let request = store.put(&Value::from("v"), Some(&Value::from(1))).unwrap();
    let success_log = log.clone();
    request.set_onsuccess(event_handler(move |_| push(&success_log, "success")));
    let complete_log = log.clone();
    transaction.set_oncomplete(event_handler(move |_| push(&complete_log, "complete")));
    let microtask_log = log.clone();
    global
        .event_loop()
        .queue_microtask(move || push(&microtask_log, "microtask"));
    push(&log, "sync");

    run(&global);
    assert_eq!(*log.borrow(), ["sync", "microtask", "success", "complete"]);
}

#[test]
fn transaction_stays_active_through_microtasks_only() {
    let global = memory_global();
    let db = store_db(&global);
    let transaction = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    let store = transaction.object_store("s").unwrap();

    let microtask_store = store.clone();
    let log = new_log();
    let microtask_log = log.clone();
    global.event_loop().queue_microtask(move || {
        let result = microtask_store.put(&Value::from("late"), Some(&Value::from(2)));
        push(&microtask_log, if result.is_ok() { "accepted" } else { "rejected" });
    });
    run(&global);

    assert_eq!(*log.borrow(), ["accepted"]);
    assert_eq!(
        store.put(&Value::from("too late"), Some(&Value::from(3))).err(),
        Some(Error::TransactionInactive)
    );
    let stored = read(&global, &db, "s", |store| store.get(&2.into()).unwrap());
    assert_eq!(stored.as_str(), Some("late"));
}

#[test]
fn requests_from_success_handlers_extend_the_transaction() {
    let global = memory_global();
    let db = store_db(&global);
    let transaction = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    let store = transaction.object_store("s").unwrap();
    let request = store.put(&Value::from("a"), Some(&Value::from(1))).unwrap();
    let chained_store = store.clone();
    request.set_onsuccess(event_handler(move |_| {
        chained_store
            .put(&Value::from("b"), Some(&Value::from(2)))
            .unwrap();
    }));
    run(&global);

    let count = read(&global, &db, "s", |store| store.count(None).unwrap());
    assert_eq!(count.as_number(), Some(2.0));
}

#[test]
fn abort_reverts_writes_and_fails_pending_requests() {
    let global = memory_global();
    let db = store_db(&global);
    put_all(&global, &db, "s", vec![(Value::from("kept"), Some(Value::from(1)))]);

    let log = new_log();
    let transaction = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    let store = transaction.object_store("s").unwrap();
    store.clear().unwrap();
    let request = store.put(&Value::from("lost"), Some(&Value::from(2))).unwrap();
    let error_log = log.clone();
    request.set_onerror(event_handler(move |_| push(&error_log, "request error")));
    let abort_log = log.clone();
    transaction.set_onabort(event_handler(move |_| push(&abort_log, "transaction abort")));
    let db_log = log.clone();
    db.set_onabort(event_handler(move |_| push(&db_log, "database abort")));

    transaction.abort().unwrap();
    assert_eq!(transaction.abort(), Err(Error::InvalidState));
    run(&global);

    assert_eq!(
        *log.borrow(),
        ["request error", "transaction abort", "database abort"]
    );
    assert_eq!(request.error().unwrap(), Some(Error::Abort));
    assert_eq!(transaction.error(), None);

    let kept = read(&global, &db, "s", |store| store.get(&1.into()).unwrap());
    assert_eq!(kept.as_str(), Some("kept"));
    let lost = read(&global, &db, "s", |store| store.get(&2.into()).unwrap());
    assert!(lost.is_undefined());
}

#[test]
fn unhandled_request_error_aborts_the_transaction() {
    let global = memory_global();
    let db = store_db(&global);
    put_all(&global, &db, "s", vec![(Value::from("first"), Some(Value::from(1)))]);

    let transaction = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    let store = transaction.object_store("s").unwrap();
    store.put(&Value::from("second"), Some(&Value::from(2))).unwrap();
    let duplicate = store.add(&Value::from("again"), Some(&Value::from(1))).unwrap();
    let log = new_log();
    let complete_log = log.clone();
    transaction.set_oncomplete(event_handler(move |_| push(&complete_log, "complete")));
    let abort_log = log.clone();
    transaction.set_onabort(event_handler(move |_| push(&abort_log, "abort")));
    run(&global);

    assert_eq!(*log.borrow(), ["abort"]);
    assert_eq!(duplicate.error().unwrap(), Some(Error::Constraint));
    assert_eq!(transaction.error(), Some(Error::Constraint));
    let second = read(&global, &db, "s", |store| store.get(&2.into()).unwrap());
    assert!(second.is_undefined());
}

#[test]
fn prevent_default_keeps_the_transaction_alive() {
    let global = memory_global();
    let db = store_db(&global);
    put_all(&global, &db, "s", vec![(Value::from("first"), Some(Value::from(1)))]);

    let transaction = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    let store = transaction.object_store("s").unwrap();
    let duplicate = store.add(&Value::from("again"), Some(&Value::from(1))).unwrap();
    duplicate.set_onerror(event_handler(|event| event.prevent_default()));
    store.put(&Value::from("second"), Some(&Value::from(2))).unwrap();
    let log = new_log();
    let complete_log = log.clone();
    transaction.set_oncomplete(event_handler(move |_| push(&complete_log, "complete")));
    run(&global);

    assert_eq!(*log.borrow(), ["complete"]);
    assert_eq!(transaction.error(), None);
    let second = read(&global, &db, "s", |store| store.get(&2.into()).unwrap());
    assert_eq!(second.as_str(), Some("second"));
}

#[test]
fn error_events_bubble_to_the_database() {
    let global = memory_global();
    let db = store_db(&global);
    put_all(&global, &db, "s", vec![(Value::from("first"), Some(Value::from(1)))]);

    let log = new_log();
    let db_log = log.clone();
    db.set_onerror(event_handler(move |event| {
        push(&db_log, event.type_());
        event.prevent_default();
    }));
    let transaction = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    let store = transaction.object_store("s").unwrap();
    store.add(&Value::from("again"), Some(&Value::from(1))).unwrap();
    run(&global);

    assert_eq!(*log.borrow(), ["error"]);
    assert_eq!(transaction.error(), None);
}

#[test]
fn overlapping_writers_run_one_after_another() {
    let global = memory_global();
    let db = store_db(&global);
    let log = new_log();

    let writer = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    writer
        .object_store("s")
        .unwrap()
        .put(&Value::from("written"), Some(&Value::from(1)))
        .unwrap();
    let writer_log = log.clone();
    writer.set_oncomplete(event_handler(move |_| push(&writer_log, "writer complete")));

    let reader = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    let request = reader.object_store("s").unwrap().get(&1.into()).unwrap();
    let reader_log = log.clone();
    request.set_onsuccess(event_handler(move |_| push(&reader_log, "reader success")));
    run(&global);

    assert_eq!(*log.borrow(), ["writer complete", "reader success"]);
    assert_eq!(request.result().unwrap().as_value().as_str(), Some("written"));
}

#[test]
fn explicit_commit_stops_new_requests() {
    let global = memory_global();
    let db = store_db(&global);
    let transaction = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    let store = transaction.object_store("s").unwrap();
    store.put(&Value::from("v"), Some(&Value::from(1))).unwrap();
    transaction.commit().unwrap();
    assert_eq!(
        store.put(&Value::from("w"), Some(&Value::from(2))).err(),
        Some(Error::TransactionInactive)
    );
    run(&global);
    assert_eq!(transaction.commit(), Err(Error::InvalidState));

    let count = read(&global, &db, "s", |store| store.count(None).unwrap());
    assert_eq!(count.as_number(), Some(1.0));
}

#[test]
fn transaction_creation_is_validated() {
    let global = memory_global();
    let db = store_db(&global);

    assert_eq!(
        db.transaction(&["missing"], IDBTransactionMode::Readonly).err(),
        Some(Error::NotFound)
    );
    assert_eq!(
        db.transaction(&[], IDBTransactionMode::Readonly).err(),
        Some(Error::InvalidAccess)
    );
    assert!(matches!(
        db.transaction(&["s"], IDBTransactionMode::Versionchange),
        Err(Error::Type(_))
    ));

    let transaction = db
        .transaction(&["s", "s"], IDBTransactionMode::Readonly)
        .unwrap();
    assert_eq!(transaction.object_store_names(), ["s"]);
    assert_eq!(
        transaction
            .object_store("s")
            .unwrap()
            .put(&Value::from(1), Some(&Value::from(1)))
            .err(),
        Some(Error::ReadOnly)
    );
    assert_eq!(transaction.object_store("other").err(), Some(Error::NotFound));
    assert!(Rc::ptr_eq(
        &transaction.object_store("s").unwrap(),
        &transaction.object_store("s").unwrap()
    ));
    run(&global);
    assert_eq!(transaction.object_store("s").err(), Some(Error::InvalidState));
}

#[test]
fn closed_connection_rejects_transactions() {
    let global = memory_global();
    let db = store_db(&global);
    db.close();
    assert_eq!(
        db.transaction(&["s"], IDBTransactionMode::Readonly).err(),
        Some(Error::InvalidState)
    );
}

#[test]
fn earlier_readers_do_not_see_later_writes() {
    let global = memory_global();
    let db = store_db(&global);
    put_all(&global, &db, "s", vec![(Value::from("old"), Some(Value::from(1)))]);

    let reader = db
        .transaction(&["s"], IDBTransactionMode::Readonly)
        .unwrap();
    let writer = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    writer
        .object_store("s")
        .unwrap()
        .put(&Value::from("new"), Some(&Value::from(1)))
        .unwrap();
    let seen = reader.object_store("s").unwrap().get(&1.into()).unwrap();
    run(&global);

    assert_eq!(seen.result().unwrap().as_value().as_str(), Some("old"));
    let now = read(&global, &db, "s", |store| store.get(&1.into()).unwrap());
    assert_eq!(now.as_str(), Some("new"));
}

/// Keeps the transaction of `store` busy until `other` is done, giving up
/// after `attempts` more reads.
fn read_until_done(store: &Rc<IDBObjectStore>, other: &Rc<IDBRequest>, log: &Log, attempts: u32) {
    let request = store.get(&1.into()).unwrap();
    let store = store.clone();
    let other = other.clone();
    let log = log.clone();
    request.set_onsuccess(event_handler(move |_| {
        if other.ready_state() == IDBRequestReadyState::Done {
            push(&log, "second done");
        } else if attempts > 0 {
            read_until_done(&store, &other, &log, attempts - 1);
        }
    }));
}

#[test]
fn readers_of_the_same_store_run_together() {
    let global = memory_global();
    let db = store_db(&global);
    put_all(&global, &db, "s", vec![(Value::from("v"), Some(Value::from(1)))]);
    let log = new_log();

    let first = db
        .transaction(&["s"], IDBTransactionMode::Readonly)
        .unwrap();
    let second = db
        .transaction(&["s"], IDBTransactionMode::Readonly)
        .unwrap();
    let other = second.object_store("s").unwrap().get(&1.into()).unwrap();
    read_until_done(&first.object_store("s").unwrap(), &other, &log, 10);
    let first_log = log.clone();
    first.set_oncomplete(event_handler(move |_| push(&first_log, "first complete")));
    let second_log = log.clone();
    second.set_oncomplete(event_handler(move |_| push(&second_log, "second complete")));
    run(&global);

    assert_eq!(log.borrow().first().map(String::as_str), Some("second done"));
    assert_eq!(log.borrow().len(), 3);
    assert_eq!(other.result().unwrap().as_value().as_str(), Some("v"));
}

#[test]
fn later_reader_waits_for_an_overlapping_writer() {
    let global = memory_global();
    let db = store_db(&global);
    let log = new_log();

    let writer = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    let written = writer
        .object_store("s")
        .unwrap()
        .put(&Value::from("written"), Some(&Value::from(1)))
        .unwrap();
    let reader = db
        .transaction(&["s"], IDBTransactionMode::Readonly)
        .unwrap();
    let seen = reader.object_store("s").unwrap().get(&1.into()).unwrap();

    let writer_request_log = log.clone();
    let reader_request = seen.clone();
    written.set_onsuccess(event_handler(move |_| {
        assert_eq!(reader_request.ready_state(), IDBRequestReadyState::Pending);
        push(&writer_request_log, "write success");
    }));
    let writer_log = log.clone();
    writer.set_oncomplete(event_handler(move |_| push(&writer_log, "writer complete")));
    let reader_log = log.clone();
    seen.set_onsuccess(event_handler(move |_| push(&reader_log, "read success")));
    run(&global);

    assert_eq!(
        *log.borrow(),
        ["write success", "writer complete", "read success"]
    );
    assert_eq!(seen.result().unwrap().as_value().as_str(), Some("written"));
}
