/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

mod auto_increment;
mod indexes;
mod lifecycle;
mod sqlite;
mod transactions;

use std::cell::RefCell;
use std::rc::Rc;

use storage::dom::bindings::value::{Object, Value};
use storage::dom::eventtarget::event_handler;
use storage::dom::globalscope::GlobalScope;
use storage::dom::idbdatabase::IDBDatabase;
use storage::dom::idbobjectstore::IDBObjectStore;
use storage::dom::idbrequest::IDBRequest;
use storage::dom::idbtransaction::{IDBTransaction, IDBTransactionMode};
use storage::indexeddb::engines::{IndexedDBBackend, MemoryBackend};

pub type Log = Rc<RefCell<Vec<String>>>;

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn memory_global() -> Rc<GlobalScope> {
    init();
    GlobalScope::new(Box::new(MemoryBackend::new()))
}

pub fn global_with(backend: Box<dyn IndexedDBBackend>) -> Rc<GlobalScope> {
    init();
    GlobalScope::new(backend)
}

pub fn run(global: &GlobalScope) {
    global.event_loop().run_until_idle();
}

pub fn new_log() -> Log {
    Rc::new(RefCell::new(vec![]))
}

pub fn push(log: &Log, entry: impl Into<String>) {
    log.borrow_mut().push(entry.into());
}

/// Opens `name` at `version`, running `upgrade` in `upgradeneeded`, and waits
/// for the connection.
pub fn open_with_upgrade(
    global: &Rc<GlobalScope>,
    name: &str,
    version: u64,
    upgrade: impl Fn(&Rc<IDBDatabase>, &Rc<IDBTransaction>) + 'static,
) -> Rc<IDBDatabase> {
    let request = global.indexed_db().open(name, Some(version)).unwrap();
    let upgrade_request = Rc::downgrade(&request);
    request.set_onupgradeneeded(event_handler(move |_| {
        let request = upgrade_request.upgrade().unwrap();
        let db = request.result().unwrap().as_database().unwrap();
        let transaction = request.transaction().unwrap();
        upgrade(&db, &transaction);
    }));
    run(global);
    request
        .result()
        .unwrap()
        .as_database()
        .expect("the open request should produce a connection")
}

/// Runs `read` against `store` in a new read-only transaction and returns the
/// request's result once it completed.
pub fn read(
    global: &Rc<GlobalScope>,
    db: &Rc<IDBDatabase>,
    store: &str,
    read: impl FnOnce(&Rc<IDBObjectStore>) -> Rc<IDBRequest>,
) -> Value {
    let transaction = db
        .transaction(&[store], IDBTransactionMode::Readonly)
        .unwrap();
    let request = read(&transaction.object_store(store).unwrap());
    run(global);
    request.result().unwrap().as_value()
}

/// Puts `records` as (value, key) pairs in a new read-write transaction.
pub fn put_all(global: &Rc<GlobalScope>, db: &Rc<IDBDatabase>, store: &str, records: Vec<(Value, Option<Value>)>) {
    let transaction = db
        .transaction(&[store], IDBTransactionMode::Readwrite)
        .unwrap();
    let object_store = transaction.object_store(store).unwrap();
    for (value, key) in records {
        object_store.put(&value, key.as_ref()).unwrap();
    }
    run(global);
    assert!(transaction.error().is_none());
}

/// The members of an array value.
pub fn array(value: &Value) -> Vec<Value> {
    match value.as_object().map(|object| object.borrow().clone()) {
        Some(Object::Array(items)) => items,
        _ => panic!("expected an array, got {value:?}"),
    }
}

pub fn numbers(value: &Value) -> Vec<f64> {
    array(value)
        .iter()
        .map(|item| item.as_number().unwrap())
        .collect()
}

pub fn strings(value: &Value) -> Vec<String> {
    array(value)
        .iter()
        .map(|item| item.as_str().unwrap().to_owned())
        .collect()
}
