/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

#![deny(unsafe_code)]

pub mod dom;
pub mod event_loop;
pub mod indexed_db;
pub mod indexeddb;

use std::path::Path;

use log::{debug, warn};
use shovel_config::pref;

use crate::indexeddb::engines::{IndexedDBBackend, MemoryBackend, SqliteBackend};

/// Creates the backend selected by the `dom_indexeddb_backend` preference.
/// SQLite databases live under `IndexedDB` in `config_dir`.
pub fn new_indexeddb_backend(config_dir: &Path) -> Box<dyn IndexedDBBackend> {
    let backend = pref!(dom_indexeddb_backend);
    debug!("Using the {backend} IndexedDB backend");
    match backend.as_str() {
        "memory" => Box::new(MemoryBackend::new()),
        "sqlite" => Box::new(SqliteBackend::new(&config_dir.join("IndexedDB"))),
        other => {
            warn!("Unknown IndexedDB backend {other:?}, falling back to sqlite");
            Box::new(SqliteBackend::new(&config_dir.join("IndexedDB")))
        },
    }
}
