/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::rc::Rc;

use storage::dom::bindings::error::Error;
use storage::dom::bindings::value::Value;
use storage::dom::event::Event;
use storage::dom::eventtarget::event_handler;
use storage::dom::idbdatabase::IDBObjectStoreParameters;
use storage::dom::idbopendbrequest::IDBOpenDBRequest;
use storage::dom::idbrequest::IDBRequestReadyState;
use storage::dom::idbtransaction::IDBTransactionMode;
use storage_traits::indexeddb::{DatabaseInfo, KeyPath};

use crate::{Log, memory_global, new_log, open_with_upgrade, push, read, run};

fn describe(event: &Event) -> String {
    match event.as_version_change() {
        Some(change) => match change.new_version() {
            Some(version) => format!("{} {}->{version}", event.type_(), change.old_version()),
            None => format!("{} {}->null", event.type_(), change.old_version()),
        },
        None => event.type_().to_owned(),
    }
}

fn log_open_events(request: &Rc<IDBOpenDBRequest>, log: &Log) {
    let blocked_log = log.clone();
    request.set_onblocked(event_handler(move |event| push(&blocked_log, describe(event))));
    let upgrade_log = log.clone();
    request.set_onupgradeneeded(event_handler(move |event| push(&upgrade_log, describe(event))));
    let success_log = log.clone();
    request.set_onsuccess(event_handler(move |event| push(&success_log, describe(event))));
    let error_log = log.clone();
    request.set_onerror(event_handler(move |event| push(&error_log, describe(event))));
}

#[test]
fn first_open_runs_an_upgrade() {
    let global = memory_global();
    let log = new_log();
    let request = global.indexed_db().open("db", None).unwrap();
    assert_eq!(request.ready_state(), IDBRequestReadyState::Pending);
    assert_eq!(request.result().err(), Some(Error::InvalidState));
    log_open_events(&request, &log);

    let upgrade_request = Rc::downgrade(&request);
    let upgrade_log = log.clone();
    request.upcast().add_event_listener("upgradeneeded", move |_| {
        let request = upgrade_request.upgrade().unwrap();
        let transaction = request.transaction().unwrap();
        assert_eq!(transaction.mode(), IDBTransactionMode::Versionchange);
        let complete_log = upgrade_log.clone();
        transaction.set_oncomplete(event_handler(move |_| push(&complete_log, "complete")));
    });
    run(&global);

    assert_eq!(*log.borrow(), ["upgradeneeded 0->1", "complete", "success"]);
    let db = request.result().unwrap().as_database().unwrap();
    assert_eq!(db.version(), 1);
    assert_eq!(db.name(), "db");
    assert!(request.transaction().is_none());
}

#[test]
fn opening_an_older_version_fails() {
    let global = memory_global();
    let db = open_with_upgrade(&global, "db", 2, |_, _| {});
    db.close();

    let log = new_log();
    let request = global.indexed_db().open("db", Some(1)).unwrap();
    log_open_events(&request, &log);
    run(&global);

    assert_eq!(*log.borrow(), ["error"]);
    assert_eq!(request.error().unwrap(), Some(Error::Version));
    assert!(request.result().unwrap().as_database().is_none());
}

#[test]
fn version_zero_is_rejected() {
    let global = memory_global();
    assert!(matches!(
        global.indexed_db().open("db", Some(0)),
        Err(Error::Type(_))
    ));
}

#[test]
fn aborted_upgrade_keeps_the_previous_schema() {
    let global = memory_global();
    let db = open_with_upgrade(&global, "db", 1, |db, _| {
        db.create_object_store("s", &IDBObjectStoreParameters::default())
            .unwrap();
    });
    db.close();

    let log = new_log();
    let request = global.indexed_db().open("db", Some(2)).unwrap();
    log_open_events(&request, &log);
    let upgrade_request = Rc::downgrade(&request);
    request.upcast().add_event_listener("upgradeneeded", move |_| {
        let request = upgrade_request.upgrade().unwrap();
        let db = request.result().unwrap().as_database().unwrap();
        db.create_object_store("t", &IDBObjectStoreParameters::default())
            .unwrap();
        assert_eq!(db.object_store_names(), ["s", "t"]);
        request.transaction().unwrap().abort().unwrap();
        assert_eq!(db.version(), 1);
        assert_eq!(db.object_store_names(), ["s"]);
    });
    run(&global);

    assert_eq!(*log.borrow(), ["upgradeneeded 1->2", "error"]);
    assert_eq!(request.error().unwrap(), Some(Error::Abort));
    assert!(request.transaction().is_none());

    let reopened = open_with_upgrade(&global, "db", 1, |_, _| panic!("no upgrade expected"));
    assert_eq!(reopened.version(), 1);
    assert_eq!(reopened.object_store_names(), ["s"]);
}

#[test]
fn open_connections_block_an_upgrade_until_closed() {
    let global = memory_global();
    let first = open_with_upgrade(&global, "db", 1, |_, _| {});
    let log = new_log();
    let versionchange_log = log.clone();
    first.set_onversionchange(event_handler(move |event| {
        push(&versionchange_log, describe(event))
    }));

    let request = global.indexed_db().open("db", Some(2)).unwrap();
    log_open_events(&request, &log);
    run(&global);
    assert_eq!(*log.borrow(), ["versionchange 1->2", "blocked 1->2"]);
    assert_eq!(request.ready_state(), IDBRequestReadyState::Pending);

    first.close();
    run(&global);
    assert_eq!(
        *log.borrow(),
        [
            "versionchange 1->2",
            "blocked 1->2",
            "upgradeneeded 1->2",
            "success"
        ]
    );
    assert_eq!(request.result().unwrap().as_database().unwrap().version(), 2);
}

#[test]
fn upgrade_waits_for_a_closing_connection_to_finish() {
    let global = memory_global();
    let db = open_with_upgrade(&global, "db", 1, |db, _| {
        db.create_object_store("s", &IDBObjectStoreParameters::default())
            .unwrap();
    });
    let log = new_log();
    let versionchange_log = log.clone();
    db.set_onversionchange(event_handler(move |event| {
        push(&versionchange_log, describe(event))
    }));
    let transaction = db
        .transaction(&["s"], IDBTransactionMode::Readwrite)
        .unwrap();
    transaction
        .object_store("s")
        .unwrap()
        .put(&Value::from("kept"), Some(&Value::from(1)))
        .unwrap();
    let complete_log = log.clone();
    transaction.set_oncomplete(event_handler(move |_| push(&complete_log, "complete")));
    db.close();

    let request = global.indexed_db().open("db", Some(2)).unwrap();
    log_open_events(&request, &log);
    run(&global);

    let log = log.borrow();
    assert!(!log.iter().any(|entry| entry.starts_with("versionchange")));
    assert_eq!(log.first().map(String::as_str), Some("blocked 1->2"));
    let position = |wanted: &str| log.iter().position(|entry| entry == wanted).unwrap();
    assert!(position("complete") < position("upgradeneeded 1->2"));
    assert_eq!(log[log.len() - 2..], ["upgradeneeded 1->2", "success"]);

    let upgraded = request.result().unwrap().as_database().unwrap();
    assert_eq!(upgraded.version(), 2);
    let kept = read(&global, &upgraded, "s", |store| store.get(&1.into()).unwrap());
    assert_eq!(kept.as_str(), Some("kept"));
}

#[test]
fn closing_on_versionchange_avoids_blocked() {
    let global = memory_global();
    let first = open_with_upgrade(&global, "db", 1, |_, _| {});
    let log = new_log();
    let versionchange_log = log.clone();
    let weak_first = Rc::downgrade(&first);
    first.set_onversionchange(event_handler(move |event| {
        push(&versionchange_log, describe(event));
        weak_first.upgrade().unwrap().close();
    }));

    let request = global.indexed_db().open("db", Some(2)).unwrap();
    log_open_events(&request, &log);
    run(&global);

    assert_eq!(
        *log.borrow(),
        ["versionchange 1->2", "upgradeneeded 1->2", "success"]
    );
}

#[test]
fn close_during_upgrade_fails_the_open_request() {
    let global = memory_global();
    let request = global.indexed_db().open("db", Some(1)).unwrap();
    let log = new_log();
    log_open_events(&request, &log);
    let upgrade_request = Rc::downgrade(&request);
    request.upcast().add_event_listener("upgradeneeded", move |_| {
        let request = upgrade_request.upgrade().unwrap();
        request.result().unwrap().as_database().unwrap().close();
    });
    run(&global);

    assert_eq!(*log.borrow(), ["upgradeneeded 0->1", "error"]);
    assert_eq!(request.error().unwrap(), Some(Error::Abort));
    assert_eq!(
        global.indexed_db().databases().unwrap(),
        [DatabaseInfo {
            name: "db".to_owned(),
            version: 1
        }]
    );
}

#[test]
fn delete_database_reports_the_old_version() {
    let global = memory_global();
    let db = open_with_upgrade(&global, "db", 3, |db, _| {
        db.create_object_store("s", &IDBObjectStoreParameters::default())
            .unwrap();
    });
    db.close();

    let log = new_log();
    let request = global.indexed_db().delete_database("db").unwrap();
    log_open_events(&request, &log);
    run(&global);

    assert_eq!(*log.borrow(), ["success 3->null"]);
    assert!(request.result().unwrap().as_value().is_undefined());
    assert!(global.indexed_db().databases().unwrap().is_empty());

    let reopened = open_with_upgrade(&global, "db", 1, |_, _| {});
    assert!(reopened.object_store_names().is_empty());
}

#[test]
fn delete_waits_for_open_connections() {
    let global = memory_global();
    let db = open_with_upgrade(&global, "db", 1, |_, _| {});
    let log = new_log();
    let versionchange_log = log.clone();
    db.set_onversionchange(event_handler(move |event| {
        push(&versionchange_log, describe(event))
    }));

    let request = global.indexed_db().delete_database("db").unwrap();
    log_open_events(&request, &log);
    run(&global);
    assert_eq!(*log.borrow(), ["versionchange 1->null", "blocked 1->null"]);

    db.close();
    run(&global);
    assert_eq!(log.borrow().last().map(String::as_str), Some("success 1->null"));
}

#[test]
fn deleting_a_missing_database_succeeds() {
    let global = memory_global();
    let log = new_log();
    let request = global.indexed_db().delete_database("nothing").unwrap();
    log_open_events(&request, &log);
    run(&global);
    assert_eq!(*log.borrow(), ["success 0->null"]);
}

#[test]
fn databases_lists_only_committed_versions() {
    let global = memory_global();
    open_with_upgrade(&global, "b", 3, |_, _| {});
    open_with_upgrade(&global, "a", 1, |_, _| {});

    let seen = new_log();
    let seen_during_upgrade = seen.clone();
    let factory_global = global.clone();
    open_with_upgrade(&global, "c", 1, move |_, _| {
        for info in factory_global.indexed_db().databases().unwrap() {
            push(&seen_during_upgrade, info.name);
        }
    });

    assert_eq!(*seen.borrow(), ["a", "b"]);
    let names: Vec<_> = global
        .indexed_db()
        .databases()
        .unwrap()
        .into_iter()
        .map(|info| (info.name, info.version))
        .collect();
    assert_eq!(
        names,
        [
            ("a".to_owned(), 1),
            ("b".to_owned(), 3),
            ("c".to_owned(), 1)
        ]
    );
}

#[test]
fn schema_changes_need_an_active_upgrade() {
    let global = memory_global();
    let db = open_with_upgrade(&global, "db", 1, |db, _| {
        let params = IDBObjectStoreParameters::default();
        db.create_object_store("s", &params).unwrap();
        assert_eq!(
            db.create_object_store("s", &params).err(),
            Some(Error::Constraint)
        );
        let invalid = IDBObjectStoreParameters {
            key_path: Some(KeyPath::from("1a")),
            auto_increment: false,
        };
        assert_eq!(
            db.create_object_store("t", &invalid).err(),
            Some(Error::Syntax)
        );
        let empty_generated = IDBObjectStoreParameters {
            key_path: Some(KeyPath::from("")),
            auto_increment: true,
        };
        assert_eq!(
            db.create_object_store("t", &empty_generated).err(),
            Some(Error::InvalidAccess)
        );
        assert_eq!(db.delete_object_store("missing"), Err(Error::NotFound));

        let renamed = db.create_object_store("old", &params).unwrap();
        renamed.set_name("new").unwrap();
        assert_eq!(renamed.name(), "new");
        assert_eq!(db.object_store_names(), ["new", "s"]);

        let doomed = db.create_object_store("doomed", &params).unwrap();
        db.delete_object_store("doomed").unwrap();
        assert_eq!(
            doomed.put(&Value::from(1), Some(&Value::from(1))).err(),
            Some(Error::InvalidState)
        );
    });

    assert_eq!(db.object_store_names(), ["new", "s"]);
    assert_eq!(
        db.create_object_store("late", &IDBObjectStoreParameters::default())
            .err(),
        Some(Error::InvalidState)
    );
    assert_eq!(db.delete_object_store("s"), Err(Error::InvalidState));
}

#[test]
fn cmp_follows_key_order() {
    let global = memory_global();
    let factory = global.indexed_db();
    assert_eq!(factory.cmp(&Value::from(1), &Value::from("a")), Ok(-1));
    assert_eq!(factory.cmp(&Value::from("b"), &Value::from("a")), Ok(1));
    assert_eq!(
        factory.cmp(
            &Value::array([Value::from(1), Value::from(2)]),
            &Value::array([Value::from(1), Value::from(2)])
        ),
        Ok(0)
    );
    assert_eq!(
        factory.cmp(&Value::array([]), &Value::from("z")),
        Ok(1)
    );
    assert_eq!(
        factory.cmp(&Value::Null, &Value::from(1)),
        Err(Error::Data)
    );
}
