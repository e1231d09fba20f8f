/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Storage backends for IndexedDB.
//!
//! A backend stores encoded keys and serialized values; it never sees script
//! values. [`IndexedDBBackend`] is the registry of databases,
//! [`KvsEngine`] is one open database and [`KvsTransaction`] is the unit of
//! atomic work against it.

use std::rc::Rc;

use storage_traits::indexeddb::{
    BackendResult, CreateObjectResult, DatabaseInfo, DatabaseMeta, IndexedDBIndex,
    IndexedDBObjectStore, IndexedDBTxnMode, PutItemResult,
};

pub use self::memory::MemoryBackend;
pub use self::sqlite::SqliteBackend;
use crate::indexeddb::key_codec::{EncodedKey, EncodedKeyRange};

mod memory;
mod sqlite;

/// A record as stored in an object store.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredRecord {
    pub key: EncodedKey,
    pub value: Vec<u8>,
}

/// An entry of an index, optionally with the referenced record's value.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexRecord {
    pub key: EncodedKey,
    pub primary_key: EncodedKey,
    pub value: Option<Vec<u8>>,
}

/// The index keys computed from a value, for one index.
#[derive(Clone, Debug)]
pub struct IndexEntries {
    pub index_name: String,
    pub keys: Vec<EncodedKey>,
}

#[derive(Clone, Debug)]
pub struct PutRecord {
    pub key: EncodedKey,
    pub value: Vec<u8>,
    pub index_entries: Vec<IndexEntries>,
}

/// What a seek walks over.
#[derive(Clone, Copy, Debug)]
pub enum RecordSource<'a> {
    ObjectStore(&'a str),
    Index { store: &'a str, index: &'a str },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SeekDirection {
    Forward,
    Backward,
}

/// Where a seek starts. Without a primary key only the key is compared, so an
/// exclusive position skips every entry sharing that key.
#[derive(Clone, Debug)]
pub struct SeekPosition {
    pub key: EncodedKey,
    pub primary_key: Option<EncodedKey>,
    pub inclusive: bool,
}

impl SeekPosition {
    /// Whether an entry lies on the far side of this position when walking in
    /// `direction`.
    pub fn admits(&self, direction: SeekDirection, key: &EncodedKey, primary_key: &EncodedKey) -> bool {
        let ordering = match &self.primary_key {
            Some(position_primary_key) => {
                (key, primary_key).cmp(&(&self.key, position_primary_key))
            },
            None => key.cmp(&self.key),
        };
        match (direction, self.inclusive) {
            (SeekDirection::Forward, true) => ordering.is_ge(),
            (SeekDirection::Forward, false) => ordering.is_gt(),
            (SeekDirection::Backward, true) => ordering.is_le(),
            (SeekDirection::Backward, false) => ordering.is_lt(),
        }
    }
}

/// The registry of databases a backend holds.
pub trait IndexedDBBackend {
    /// Opens `name`, creating an empty database at version 0 if needed.
    fn open(&self, name: &str) -> BackendResult<Rc<dyn KvsEngine>>;

    /// Removes the database and returns the version it had, or 0.
    fn delete_database(&self, name: &str) -> BackendResult<u64>;

    /// Databases with a committed version greater than 0, sorted by name.
    fn databases(&self) -> BackendResult<Vec<DatabaseInfo>>;
}

/// One open database.
pub trait KvsEngine {
    fn name(&self) -> &str;

    /// The committed version.
    fn version(&self) -> BackendResult<u64>;

    /// The schema, including changes of a running versionchange transaction.
    fn metadata(&self) -> BackendResult<DatabaseMeta>;

    fn begin_transaction(
        &self,
        scope: &[String],
        mode: IndexedDBTxnMode,
    ) -> BackendResult<Box<dyn KvsTransaction>>;

    /// Whether readwrite transactions with disjoint scopes may run at the
    /// same time. When they may not, the scheduler starts them one by one.
    fn allows_concurrent_writers(&self) -> bool {
        true
    }

    /// Stages a new version. Only valid while a versionchange transaction is
    /// running; discarded if that transaction aborts.
    fn set_version(&self, version: u64) -> BackendResult<()>;

    /// Persists the staged version as part of the running versionchange
    /// transaction.
    fn commit_version(&self) -> BackendResult<()>;
}

pub trait KvsTransaction {
    fn mode(&self) -> IndexedDBTxnMode;

    fn create_object_store(&mut self, store: IndexedDBObjectStore) -> BackendResult<CreateObjectResult>;

    fn delete_object_store(&mut self, name: &str) -> BackendResult<()>;

    fn rename_object_store(&mut self, name: &str, new_name: &str) -> BackendResult<()>;

    /// Creates an empty index; entries are added with [`KvsTransaction::add_index_entries`].
    fn create_index(&mut self, store: &str, index: IndexedDBIndex) -> BackendResult<CreateObjectResult>;

    fn delete_index(&mut self, store: &str, name: &str) -> BackendResult<()>;

    fn rename_index(&mut self, store: &str, name: &str, new_name: &str) -> BackendResult<()>;

    /// Adds entries pointing at `primary_key`. Fails with a constraint error if
    /// a unique index already maps one of the keys to another record.
    fn add_index_entries(
        &mut self,
        store: &str,
        index: &str,
        primary_key: &EncodedKey,
        keys: &[EncodedKey],
    ) -> BackendResult<()>;

    fn get(&self, store: &str, range: &EncodedKeyRange) -> BackendResult<Option<StoredRecord>>;

    fn get_all(
        &self,
        store: &str,
        range: &EncodedKeyRange,
        count: Option<u32>,
    ) -> BackendResult<Vec<StoredRecord>>;

    fn count(&self, store: &str, range: &EncodedKeyRange) -> BackendResult<u64>;

    /// Stores a record, replacing the old record and its index entries when
    /// `overwrite` is set. Unique index violations fail with a constraint error.
    fn put(&mut self, store: &str, record: PutRecord, overwrite: bool) -> BackendResult<PutItemResult>;

    fn delete(&mut self, store: &str, range: &EncodedKeyRange) -> BackendResult<()>;

    fn clear(&mut self, store: &str) -> BackendResult<()>;

    fn index_get_all(
        &self,
        store: &str,
        index: &str,
        range: &EncodedKeyRange,
        count: Option<u32>,
        with_value: bool,
    ) -> BackendResult<Vec<IndexRecord>>;

    fn index_count(&self, store: &str, index: &str, range: &EncodedKeyRange) -> BackendResult<u64>;

    /// The first entry of `source` within `range`, walking in `direction` from
    /// `position`. Object store entries report their key as the primary key.
    fn seek(
        &self,
        source: RecordSource<'_>,
        range: &EncodedKeyRange,
        direction: SeekDirection,
        position: Option<&SeekPosition>,
        with_value: bool,
    ) -> BackendResult<Option<IndexRecord>>;

    /// Reserves the next generated key, or `None` once the generator is exhausted.
    fn next_auto_increment_key(&mut self, store: &str) -> BackendResult<Option<u64>>;

    /// <https://w3c.github.io/IndexedDB/#possibly-update-the-key-generator>
    fn maybe_update_key_generator(&mut self, store: &str, key: f64) -> BackendResult<()>;

    fn get_auto_increment_current(&self, store: &str) -> BackendResult<u64>;

    fn set_auto_increment_current(&mut self, store: &str, current: u64) -> BackendResult<()>;

    fn commit(self: Box<Self>) -> BackendResult<()>;

    /// Undoes every change made by this transaction.
    fn abort(self: Box<Self>) -> BackendResult<()>;
}

/// The value a key generator takes after seeing an explicit key, if it changes.
pub(crate) fn updated_key_generator(current: u64, key: f64) -> Option<u64> {
    use crate::indexed_db::MAX_KEY_GENERATOR_VALUE;

    // Step 2-3.
    let value = key.min(MAX_KEY_GENERATOR_VALUE as f64).floor();
    // Step 4.
    if value >= current as f64 {
        return Some(value as u64 + 1);
    }
    None
}
