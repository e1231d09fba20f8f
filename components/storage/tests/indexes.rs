/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::rc::Rc;

use storage::dom::bindings::error::Error;
use storage::dom::bindings::value::Value;
use storage::dom::eventtarget::event_handler;
use storage::dom::globalscope::GlobalScope;
use storage::dom::idbdatabase::{IDBDatabase, IDBObjectStoreParameters};
use storage::dom::idbobjectstore::IDBIndexParameters;
use storage::dom::idbtransaction::IDBTransactionMode;
use storage_traits::indexeddb::KeyPath;

use crate::{memory_global, new_log, numbers, open_with_upgrade, push, put_all, read, run};

fn by_id() -> IDBObjectStoreParameters {
    IDBObjectStoreParameters {
        key_path: Some(KeyPath::from("id")),
        auto_increment: false,
    }
}

fn person(id: i32, email: &str) -> (Value, Option<Value>) {
    (
        Value::object([("id", Value::from(id)), ("email", Value::from(email))]),
        None,
    )
}

fn people_db(global: &Rc<GlobalScope>, unique: bool) -> Rc<IDBDatabase> {
    open_with_upgrade(global, "people", 1, move |db, _| {
        let store = db.create_object_store("s", &by_id()).unwrap();
        let params = IDBIndexParameters {
            unique,
            multi_entry: false,
        };
        store
            .create_index("by_email", KeyPath::from("email"), &params)
            .unwrap();
    })
}

#[test]
fn unique_index_rejects_a_second_record() {
    let global = memory_global();
    let db = people_db(&global, true);
    put_all(&global, &db, "s", vec![person(1, "a@example.org")]);

    let transaction = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    let store = transaction.object_store("s").unwrap();
    let (value, _) = person(2, "a@example.org");
    let request = store.add(&value, None).unwrap();
    run(&global);

    assert_eq!(request.error().unwrap(), Some(Error::Constraint));
    assert_eq!(transaction.error(), Some(Error::Constraint));
    let count = read(&global, &db, "s", |store| store.count(None).unwrap());
    assert_eq!(count.as_number(), Some(1.0));
}

#[test]
fn overwriting_a_record_keeps_its_unique_entry() {
    let global = memory_global();
    let db = people_db(&global, true);
    put_all(&global, &db, "s", vec![person(1, "a@example.org")]);
    put_all(&global, &db, "s", vec![person(1, "a@example.org")]);
    put_all(&global, &db, "s", vec![person(1, "b@example.org")]);
    put_all(&global, &db, "s", vec![person(2, "a@example.org")]);

    let found = read(&global, &db, "s", |store| {
        store
            .index("by_email")
            .unwrap()
            .get_key(&"b@example.org".into())
            .unwrap()
    });
    assert_eq!(found.as_number(), Some(1.0));
}

#[test]
fn index_reads_resolve_to_records() {
    let global = memory_global();
    let db = people_db(&global, false);
    put_all(
        &global,
        &db,
        "s",
        vec![
            person(3, "shared@example.org"),
            person(1, "shared@example.org"),
            person(2, "other@example.org"),
        ],
    );

    let record = read(&global, &db, "s", |store| {
        store
            .index("by_email")
            .unwrap()
            .get(&"shared@example.org".into())
            .unwrap()
    });
    assert_eq!(record.get("id").and_then(|id| id.as_number()), Some(1.0));

    let keys = read(&global, &db, "s", |store| {
        store
            .index("by_email")
            .unwrap()
            .get_all_keys(Some(&"shared@example.org".into()), None)
            .unwrap()
    });
    assert_eq!(numbers(&keys), [1.0, 3.0]);

    let limited = read(&global, &db, "s", |store| {
        store.index("by_email").unwrap().get_all(None, Some(2)).unwrap()
    });
    let ids: Vec<_> = crate::array(&limited)
        .iter()
        .map(|record| record.get("id").and_then(|id| id.as_number()).unwrap())
        .collect();
    assert_eq!(ids, [2.0, 1.0]);

    let missing = read(&global, &db, "s", |store| {
        store
            .index("by_email")
            .unwrap()
            .get(&"nobody@example.org".into())
            .unwrap()
    });
    assert!(missing.is_undefined());
}

#[test]
fn records_without_the_key_path_are_not_indexed() {
    let global = memory_global();
    let db = people_db(&global, false);
    put_all(
        &global,
        &db,
        "s",
        vec![
            person(1, "a@example.org"),
            (Value::object([("id", Value::from(2))]), None),
            (
                Value::object([("id", Value::from(3)), ("email", Value::Null)]),
                None,
            ),
        ],
    );

    let indexed = read(&global, &db, "s", |store| {
        store.index("by_email").unwrap().count(None).unwrap()
    });
    assert_eq!(indexed.as_number(), Some(1.0));
    let stored = read(&global, &db, "s", |store| store.count(None).unwrap());
    assert_eq!(stored.as_number(), Some(3.0));
}

#[test]
fn multi_entry_index_has_one_entry_per_member() {
    let global = memory_global();
    let db = open_with_upgrade(&global, "tags", 1, |db, _| {
        let store = db.create_object_store("s", &by_id()).unwrap();
        let multi = IDBIndexParameters {
            unique: false,
            multi_entry: true,
        };
        store
            .create_index("by_tag", KeyPath::from("tags"), &multi)
            .unwrap();
        store
            .create_index("by_tags", KeyPath::from("tags"), &IDBIndexParameters::default())
            .unwrap();
    });
    let tagged = |id: i32, tags: &[&str]| {
        (
            Value::object([
                ("id", Value::from(id)),
                ("tags", Value::array(tags.iter().map(|tag| Value::from(*tag)))),
            ]),
            None,
        )
    };
    put_all(
        &global,
        &db,
        "s",
        vec![tagged(1, &["a", "b", "a"]), tagged(2, &["b"])],
    );

    let count = |query: &'static str| {
        read(&global, &db, "s", move |store| {
            store
                .index("by_tag")
                .unwrap()
                .count(Some(&query.into()))
                .unwrap()
        })
        .as_number()
    };
    assert_eq!(count("a"), Some(1.0));
    assert_eq!(count("b"), Some(2.0));

    let whole_arrays = read(&global, &db, "s", |store| {
        store.index("by_tags").unwrap().count(None).unwrap()
    });
    assert_eq!(whole_arrays.as_number(), Some(2.0));
    let by_array = read(&global, &db, "s", |store| {
        store
            .index("by_tags")
            .unwrap()
            .get_key(&Value::array([Value::from("b")]).into())
            .unwrap()
    });
    assert_eq!(by_array.as_number(), Some(2.0));
}

#[test]
fn multi_entry_needs_a_single_key_path() {
    let global = memory_global();
    open_with_upgrade(&global, "db", 1, |db, _| {
        let store = db.create_object_store("s", &by_id()).unwrap();
        let multi = IDBIndexParameters {
            unique: false,
            multi_entry: true,
        };
        assert_eq!(
            store
                .create_index("both", KeyPath::from(vec!["a", "b"]), &multi)
                .err(),
            Some(Error::InvalidAccess)
        );
        assert_eq!(
            store
                .create_index("bad", KeyPath::from("a..b"), &IDBIndexParameters::default())
                .err(),
            Some(Error::Syntax)
        );
    });
}

#[test]
fn created_index_covers_existing_records() {
    let global = memory_global();
    let db = open_with_upgrade(&global, "db", 1, |db, _| {
        db.create_object_store("s", &by_id()).unwrap();
    });
    put_all(
        &global,
        &db,
        "s",
        vec![person(1, "a@example.org"), person(2, "b@example.org")],
    );
    db.close();

    let db = open_with_upgrade(&global, "db", 2, |_, transaction| {
        let store = transaction.object_store("s").unwrap();
        store
            .create_index("by_email", KeyPath::from("email"), &IDBIndexParameters::default())
            .unwrap();
        assert_eq!(store.index_names(), ["by_email"]);
    });
    let found = read(&global, &db, "s", |store| {
        store
            .index("by_email")
            .unwrap()
            .get_key(&"b@example.org".into())
            .unwrap()
    });
    assert_eq!(found.as_number(), Some(2.0));
}

#[test]
fn unique_index_over_duplicates_aborts_the_upgrade() {
    let global = memory_global();
    let db = open_with_upgrade(&global, "db", 1, |db, _| {
        db.create_object_store("s", &by_id()).unwrap();
    });
    put_all(
        &global,
        &db,
        "s",
        vec![person(1, "same@example.org"), person(2, "same@example.org")],
    );
    db.close();

    let log = new_log();
    let request = global.indexed_db().open("db", Some(2)).unwrap();
    let upgrade_request = Rc::downgrade(&request);
    let abort_log = log.clone();
    request.set_onupgradeneeded(event_handler(move |_| {
        let request = upgrade_request.upgrade().unwrap();
        let transaction = request.transaction().unwrap();
        let abort_log = abort_log.clone();
        let weak_transaction = Rc::downgrade(&transaction);
        transaction.set_onabort(event_handler(move |_| {
            let error = weak_transaction.upgrade().and_then(|transaction| transaction.error());
            push(&abort_log, format!("abort {error:?}"));
        }));
        let unique = IDBIndexParameters {
            unique: true,
            multi_entry: false,
        };
        let store = transaction.object_store("s").unwrap();
        let index = store
            .create_index("by_email", KeyPath::from("email"), &unique)
            .unwrap();
        assert_eq!(index.name(), "by_email");
        assert!(store.index_names().is_empty());
        assert_eq!(
            index.get(&"same@example.org".into()).err(),
            Some(Error::InvalidState)
        );
        assert_eq!(
            store.create_index("by_email", KeyPath::from("email"), &unique).err(),
            Some(Error::TransactionInactive)
        );
    }));
    let error_log = log.clone();
    request.set_onerror(event_handler(move |_| push(&error_log, "open error")));
    run(&global);

    assert_eq!(
        *log.borrow(),
        [format!("abort {:?}", Some(Error::Constraint)), "open error".to_owned()]
    );
    let db = open_with_upgrade(&global, "db", 1, |_, _| {});
    assert_eq!(db.version(), 1);
    let names = db
        .transaction(&["s"], IDBTransactionMode::Readonly)
        .unwrap()
        .object_store("s")
        .unwrap()
        .index_names();
    assert!(names.is_empty());
}

#[test]
fn indexes_can_be_renamed_and_deleted() {
    let global = memory_global();
    let db = open_with_upgrade(&global, "db", 1, |db, _| {
        let store = db.create_object_store("s", &by_id()).unwrap();
        let params = IDBIndexParameters::default();
        let index = store
            .create_index("first", KeyPath::from("a"), &params)
            .unwrap();
        store.create_index("second", KeyPath::from("b"), &params).unwrap();
        assert_eq!(
            store.create_index("second", KeyPath::from("c"), &params).err(),
            Some(Error::Constraint)
        );
        assert_eq!(index.set_name("second"), Err(Error::Constraint));
        index.set_name("renamed").unwrap();
        assert_eq!(index.name(), "renamed");
        assert!(Rc::ptr_eq(&store.index("renamed").unwrap(), &index));

        store.delete_index("second").unwrap();
        assert_eq!(store.delete_index("second"), Err(Error::NotFound));
        assert_eq!(store.index("second").err(), Some(Error::NotFound));
        assert_eq!(store.index_names(), ["renamed"]);
    });

    let transaction = db
        .transaction(&["s"], IDBTransactionMode::Readonly)
        .unwrap();
    let store = transaction.object_store("s").unwrap();
    let index = store.index("renamed").unwrap();
    assert_eq!(index.key_path(), Some(KeyPath::from("a")));
    assert!(!index.unique());
    assert_eq!(index.set_name("other"), Err(Error::InvalidState));
    assert_eq!(store.delete_index("renamed"), Err(Error::InvalidState));
}
