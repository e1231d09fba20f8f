/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fs;

use shovel_config::pref;
use shovel_config::prefs::{self, PrefError, Preferences};

#[test]
fn test_missing_fields_keep_defaults() {
    let preferences =
        Preferences::from_json(r#"{ "dom_indexeddb_backend": "memory" }"#).unwrap();
    assert_eq!(preferences.dom_indexeddb_backend, "memory");
    assert_eq!(
        preferences.dom_indexeddb_sqlite_cache_size,
        Preferences::default().dom_indexeddb_sqlite_cache_size
    );
}

#[test]
fn test_invalid_json_is_a_parse_error() {
    let result = Preferences::from_json(r#"{ "dom_indexeddb_sqlite_cache_size": "lots" }"#);
    assert!(matches!(result, Err(PrefError::Parse(_))));
}

#[test]
fn test_load_from_file_and_set() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("prefs.json");
    fs::write(&path, r#"{ "dom_indexeddb_sqlite_synchronous": "FULL" }"#)
        .expect("Failed to write prefs");

    let preferences = Preferences::from_file(&path).expect("Failed to load prefs");
    prefs::set(preferences);
    assert_eq!(pref!(dom_indexeddb_sqlite_synchronous), "FULL");

    prefs::set(Preferences::default());
    assert_eq!(pref!(dom_indexeddb_sqlite_synchronous), "NORMAL");
}

#[test]
fn test_missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let result = Preferences::from_file(&dir.path().join("absent.json"));
    assert!(matches!(result, Err(PrefError::Io(_))));
}
