/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! An in-memory backend, for tests and for hosts without durable storage.
//!
//! Writes go straight to the shared ordered maps. Every change is recorded in
//! the transaction's undo log, which is replayed backwards on abort.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::ops::Bound;
use std::rc::Rc;

use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use storage_traits::indexeddb::{
    BackendError, BackendResult, CreateObjectResult, DatabaseInfo, DatabaseMeta, IndexedDBIndex,
    IndexedDBObjectStore, IndexedDBTxnMode, PutItemResult,
};

use super::{
    IndexEntries, IndexRecord, IndexedDBBackend, KvsEngine, KvsTransaction, PutRecord,
    RecordSource, SeekDirection, SeekPosition, StoredRecord, updated_key_generator,
};
use crate::indexed_db::MAX_KEY_GENERATOR_VALUE;
use crate::indexeddb::key_codec::{EncodedKey, EncodedKeyRange};

type IndexEntrySet = BTreeSet<(EncodedKey, EncodedKey)>;

#[derive(Default)]
pub struct MemoryBackend {
    databases: RefCell<FxHashMap<String, Rc<MemoryEngine>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexedDBBackend for MemoryBackend {
    fn open(&self, name: &str) -> BackendResult<Rc<dyn KvsEngine>> {
        let engine = self
            .databases
            .borrow_mut()
            .entry(name.to_owned())
            .or_insert_with(|| Rc::new(MemoryEngine::new(name)))
            .clone();
        Ok(engine)
    }

    fn delete_database(&self, name: &str) -> BackendResult<u64> {
        let removed = self.databases.borrow_mut().remove(name);
        Ok(removed.map_or(0, |engine| engine.state.version.get()))
    }

    fn databases(&self) -> BackendResult<Vec<DatabaseInfo>> {
        let mut databases: Vec<DatabaseInfo> = self
            .databases
            .borrow()
            .values()
            .filter(|engine| engine.state.version.get() > 0)
            .map(|engine| DatabaseInfo {
                name: engine.name.clone(),
                version: engine.state.version.get(),
            })
            .collect();
        databases.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(databases)
    }
}

struct MemoryObjectStore {
    meta: IndexedDBObjectStore,
    records: BTreeMap<EncodedKey, Vec<u8>>,
    indexes: FxHashMap<String, IndexEntrySet>,
    key_generator_current: u64,
}

impl MemoryObjectStore {
    fn index_mut(&mut self, name: &str) -> BackendResult<&mut IndexEntrySet> {
        self.indexes
            .get_mut(name)
            .ok_or(BackendError::IndexNotFound)
    }

    fn check_unique(&self, primary_key: &EncodedKey, entries: &[IndexEntries]) -> BackendResult<()> {
        for entry in entries {
            let unique = self
                .meta
                .index(&entry.index_name)
                .is_some_and(|index| index.unique);
            if !unique {
                continue;
            }
            let Some(index) = self.indexes.get(&entry.index_name) else {
                return Err(BackendError::IndexNotFound);
            };
            for key in &entry.keys {
                let taken = index
                    .range((
                        Bound::Included((key.clone(), EncodedKey::default())),
                        Bound::Excluded((key.successor(), EncodedKey::default())),
                    ))
                    .any(|(_, existing)| existing != primary_key);
                if taken {
                    return Err(BackendError::Constraint(format!(
                        "index {} already contains the key",
                        entry.index_name
                    )));
                }
            }
        }
        Ok(())
    }

    /// The record at `key` as it is now, to be put back on abort.
    fn saved_record(&self, key: &EncodedKey) -> Undo {
        let value = self.records.get(key).cloned();
        // Only stored records have index entries.
        let index_entries = match value {
            Some(_) => self
                .indexes
                .iter()
                .flat_map(|(name, entries)| {
                    entries
                        .iter()
                        .filter(|(_, primary_key)| primary_key == key)
                        .map(|(index_key, _)| (name.clone(), index_key.clone()))
                })
                .collect(),
            None => Vec::new(),
        };
        Undo::Record {
            store: self.meta.name.clone(),
            key: key.clone(),
            value,
            index_entries,
        }
    }

    fn saved_key_generator(&self) -> Undo {
        Undo::KeyGenerator {
            store: self.meta.name.clone(),
            current: self.key_generator_current,
        }
    }

    fn remove_index_entries(&mut self, primary_keys: &FxHashSet<EncodedKey>) {
        for index in self.indexes.values_mut() {
            index.retain(|(_, primary_key)| !primary_keys.contains(primary_key));
        }
    }
}

struct MemoryState {
    stores: RefCell<BTreeMap<String, MemoryObjectStore>>,
    version: Cell<u64>,
    pending_version: Cell<Option<u64>>,
}

pub(super) struct MemoryEngine {
    name: String,
    state: Rc<MemoryState>,
}

impl MemoryEngine {
    fn new(name: &str) -> Self {
        MemoryEngine {
            name: name.to_owned(),
            state: Rc::new(MemoryState {
                stores: RefCell::new(BTreeMap::new()),
                version: Cell::new(0),
                pending_version: Cell::new(None),
            }),
        }
    }
}

impl KvsEngine for MemoryEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> BackendResult<u64> {
        Ok(self.state.version.get())
    }

    fn metadata(&self) -> BackendResult<DatabaseMeta> {
        let object_stores = self
            .state
            .stores
            .borrow()
            .iter()
            .map(|(name, store)| (name.clone(), store.meta.clone()))
            .collect();
        Ok(DatabaseMeta {
            name: self.name.clone(),
            object_stores,
        })
    }

    fn begin_transaction(
        &self,
        _scope: &[String],
        mode: IndexedDBTxnMode,
    ) -> BackendResult<Box<dyn KvsTransaction>> {
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            mode,
            undo: Vec::new(),
        }))
    }

    fn set_version(&self, version: u64) -> BackendResult<()> {
        self.state.pending_version.set(Some(version));
        Ok(())
    }

    fn commit_version(&self) -> BackendResult<()> {
        if let Some(version) = self.state.pending_version.take() {
            self.state.version.set(version);
        }
        Ok(())
    }
}

/// One change a transaction made, with what is needed to take it back.
enum Undo {
    /// A record as it was before a put or delete touched it.
    Record {
        store: String,
        key: EncodedKey,
        value: Option<Vec<u8>>,
        /// `(index name, index key)` of every entry pointing at the record.
        index_entries: Vec<(String, EncodedKey)>,
    },
    /// The records and index entries a clear removed.
    Cleared {
        store: String,
        records: BTreeMap<EncodedKey, Vec<u8>>,
        indexes: Vec<(String, IndexEntrySet)>,
    },
    IndexEntriesAdded {
        store: String,
        index: String,
        entries: Vec<(EncodedKey, EncodedKey)>,
    },
    KeyGenerator {
        store: String,
        current: u64,
    },
    StoreCreated(String),
    StoreDeleted(MemoryObjectStore),
    StoreRenamed {
        from: String,
        to: String,
    },
    IndexCreated {
        store: String,
        name: String,
    },
    IndexDeleted {
        store: String,
        meta: IndexedDBIndex,
        entries: IndexEntrySet,
    },
    IndexRenamed {
        store: String,
        from: String,
        to: String,
    },
}

impl Undo {
    fn revert(self, stores: &mut BTreeMap<String, MemoryObjectStore>) {
        match self {
            Undo::StoreCreated(name) => {
                stores.remove(&name);
            },
            Undo::StoreDeleted(store) => {
                stores.insert(store.meta.name.clone(), store);
            },
            Undo::StoreRenamed { from, to } => {
                if let Some(mut store) = stores.remove(&to) {
                    store.meta.name = from.clone();
                    stores.insert(from, store);
                }
            },
            Undo::Record {
                store,
                key,
                value,
                index_entries,
            } => {
                let Some(store) = stores.get_mut(&store) else {
                    return warn!("Cannot restore a record of missing store {store}");
                };
                if store.records.contains_key(&key) {
                    store.remove_index_entries(&FxHashSet::from_iter([key.clone()]));
                }
                match value {
                    Some(value) => store.records.insert(key.clone(), value),
                    None => store.records.remove(&key),
                };
                for (index, index_key) in index_entries {
                    if let Some(entries) = store.indexes.get_mut(&index) {
                        entries.insert((index_key, key.clone()));
                    }
                }
            },
            Undo::Cleared {
                store,
                records,
                indexes,
            } => {
                let Some(store) = stores.get_mut(&store) else {
                    return warn!("Cannot restore cleared store {store}");
                };
                store.records = records;
                for (name, entries) in indexes {
                    store.indexes.insert(name, entries);
                }
            },
            Undo::IndexEntriesAdded {
                store,
                index,
                entries,
            } => {
                if let Some(index) = stores
                    .get_mut(&store)
                    .and_then(|store| store.indexes.get_mut(&index))
                {
                    for entry in &entries {
                        index.remove(entry);
                    }
                }
            },
            Undo::KeyGenerator { store, current } => {
                if let Some(store) = stores.get_mut(&store) {
                    store.key_generator_current = current;
                }
            },
            Undo::IndexCreated { store, name } => {
                if let Some(store) = stores.get_mut(&store) {
                    store.indexes.remove(&name);
                    store.meta.indexes.remove(&name);
                }
            },
            Undo::IndexDeleted {
                store,
                meta,
                entries,
            } => {
                if let Some(store) = stores.get_mut(&store) {
                    store.indexes.insert(meta.name.clone(), entries);
                    store.meta.indexes.insert(meta.name.clone(), meta);
                }
            },
            Undo::IndexRenamed { store, from, to } => {
                if let Some(store) = stores.get_mut(&store) {
                    if let Some(entries) = store.indexes.remove(&to) {
                        store.indexes.insert(from.clone(), entries);
                    }
                    if let Some(mut index) = store.meta.indexes.remove(&to) {
                        index.name = from.clone();
                        store.meta.indexes.insert(from, index);
                    }
                }
            },
        }
    }
}

struct MemoryTransaction {
    state: Rc<MemoryState>,
    mode: IndexedDBTxnMode,
    /// Changes made so far, oldest first.
    undo: Vec<Undo>,
}

fn schema_error() -> BackendError {
    BackendError::DbErr("schema changes need a versionchange transaction".to_owned())
}

fn readonly_error() -> BackendError {
    BackendError::DbErr("write in a readonly transaction".to_owned())
}

/// Entries of an object store within `range`, in key order.
fn store_range<'a>(
    records: &'a BTreeMap<EncodedKey, Vec<u8>>,
    range: &'a EncodedKeyRange,
) -> impl Iterator<Item = (&'a EncodedKey, &'a Vec<u8>)> + 'a {
    records
        .range::<EncodedKey, _>((range.lower.as_ref(), Bound::Unbounded))
        .take_while(move |(key, _)| !range.is_below(key))
}

/// The smallest index entry that can lie inside `range`.
fn index_lower_bound(range: &EncodedKeyRange) -> Bound<(EncodedKey, EncodedKey)> {
    match &range.lower {
        Bound::Included(lower) => Bound::Included((lower.clone(), EncodedKey::default())),
        Bound::Excluded(lower) => Bound::Included((lower.successor(), EncodedKey::default())),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// The first index entry past `range`.
fn index_upper_bound(range: &EncodedKeyRange) -> Bound<(EncodedKey, EncodedKey)> {
    match &range.upper {
        Bound::Included(upper) => Bound::Excluded((upper.successor(), EncodedKey::default())),
        Bound::Excluded(upper) => Bound::Excluded((upper.clone(), EncodedKey::default())),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn index_range<'a>(
    entries: &'a IndexEntrySet,
    range: &'a EncodedKeyRange,
) -> impl Iterator<Item = &'a (EncodedKey, EncodedKey)> + 'a {
    entries
        .range((index_lower_bound(range), Bound::Unbounded))
        .take_while(move |(key, _)| !range.is_below(key))
}

impl MemoryTransaction {
    fn check_versionchange(&self) -> BackendResult<()> {
        match self.mode {
            IndexedDBTxnMode::Versionchange => Ok(()),
            _ => Err(schema_error()),
        }
    }

    fn check_write(&self) -> BackendResult<()> {
        match self.mode {
            IndexedDBTxnMode::Readonly => Err(readonly_error()),
            _ => Ok(()),
        }
    }

    fn with_store<R>(
        &self,
        name: &str,
        callback: impl FnOnce(&MemoryObjectStore) -> BackendResult<R>,
    ) -> BackendResult<R> {
        let stores = self.state.stores.borrow();
        let store = stores.get(name).ok_or(BackendError::StoreNotFound)?;
        callback(store)
    }

    fn with_store_mut<R>(
        &mut self,
        name: &str,
        callback: impl FnOnce(&mut MemoryObjectStore, &mut Vec<Undo>) -> BackendResult<R>,
    ) -> BackendResult<R> {
        self.check_write()?;
        let mut stores = self.state.stores.borrow_mut();
        let store = stores.get_mut(name).ok_or(BackendError::StoreNotFound)?;
        callback(store, &mut self.undo)
    }
}

impl KvsTransaction for MemoryTransaction {
    fn mode(&self) -> IndexedDBTxnMode {
        self.mode
    }

    fn create_object_store(&mut self, store: IndexedDBObjectStore) -> BackendResult<CreateObjectResult> {
        self.check_versionchange()?;
        let mut stores = self.state.stores.borrow_mut();
        if stores.contains_key(&store.name) {
            return Ok(CreateObjectResult::AlreadyExists);
        }
        let indexes = store
            .indexes
            .keys()
            .map(|name| (name.clone(), IndexEntrySet::new()))
            .collect();
        let store_name = store.name.clone();
        stores.insert(
            store.name.clone(),
            MemoryObjectStore {
                meta: store,
                records: BTreeMap::new(),
                indexes,
                key_generator_current: 1,
            },
        );
        self.undo.push(Undo::StoreCreated(store_name));
        Ok(CreateObjectResult::Created)
    }

    fn delete_object_store(&mut self, name: &str) -> BackendResult<()> {
        self.check_versionchange()?;
        let store = self
            .state
            .stores
            .borrow_mut()
            .remove(name)
            .ok_or(BackendError::StoreNotFound)?;
        self.undo.push(Undo::StoreDeleted(store));
        Ok(())
    }

    fn rename_object_store(&mut self, name: &str, new_name: &str) -> BackendResult<()> {
        self.check_versionchange()?;
        let mut stores = self.state.stores.borrow_mut();
        if stores.contains_key(new_name) {
            return Err(BackendError::Constraint(format!("object store {new_name} exists")));
        }
        let mut store = stores.remove(name).ok_or(BackendError::StoreNotFound)?;
        store.meta.name = new_name.to_owned();
        stores.insert(new_name.to_owned(), store);
        self.undo.push(Undo::StoreRenamed {
            from: name.to_owned(),
            to: new_name.to_owned(),
        });
        Ok(())
    }

    fn create_index(&mut self, store: &str, index: IndexedDBIndex) -> BackendResult<CreateObjectResult> {
        self.check_versionchange()?;
        self.with_store_mut(store, |store, undo| {
            if store.indexes.contains_key(&index.name) {
                return Ok(CreateObjectResult::AlreadyExists);
            }
            store
                .indexes
                .insert(index.name.clone(), IndexEntrySet::new());
            undo.push(Undo::IndexCreated {
                store: store.meta.name.clone(),
                name: index.name.clone(),
            });
            store.meta.indexes.insert(index.name.clone(), index);
            Ok(CreateObjectResult::Created)
        })
    }

    fn delete_index(&mut self, store: &str, name: &str) -> BackendResult<()> {
        self.check_versionchange()?;
        self.with_store_mut(store, |store, undo| {
            let entries = store
                .indexes
                .remove(name)
                .ok_or(BackendError::IndexNotFound)?;
            if let Some(meta) = store.meta.indexes.remove(name) {
                undo.push(Undo::IndexDeleted {
                    store: store.meta.name.clone(),
                    meta,
                    entries,
                });
            }
            Ok(())
        })
    }

    fn rename_index(&mut self, store: &str, name: &str, new_name: &str) -> BackendResult<()> {
        self.check_versionchange()?;
        self.with_store_mut(store, |store, undo| {
            if store.indexes.contains_key(new_name) {
                return Err(BackendError::Constraint(format!("index {new_name} exists")));
            }
            let entries = store
                .indexes
                .remove(name)
                .ok_or(BackendError::IndexNotFound)?;
            store.indexes.insert(new_name.to_owned(), entries);
            if let Some(mut index) = store.meta.indexes.remove(name) {
                index.name = new_name.to_owned();
                store.meta.indexes.insert(new_name.to_owned(), index);
            }
            undo.push(Undo::IndexRenamed {
                store: store.meta.name.clone(),
                from: name.to_owned(),
                to: new_name.to_owned(),
            });
            Ok(())
        })
    }

    fn add_index_entries(
        &mut self,
        store: &str,
        index: &str,
        primary_key: &EncodedKey,
        keys: &[EncodedKey],
    ) -> BackendResult<()> {
        self.with_store_mut(store, |store, undo| {
            let entries = [IndexEntries {
                index_name: index.to_owned(),
                keys: keys.to_vec(),
            }];
            store.check_unique(primary_key, &entries)?;
            let store_name = store.meta.name.clone();
            let index_entries = store.index_mut(index)?;
            let added: Vec<_> = keys
                .iter()
                .map(|key| (key.clone(), primary_key.clone()))
                .filter(|entry| index_entries.insert(entry.clone()))
                .collect();
            if !added.is_empty() {
                undo.push(Undo::IndexEntriesAdded {
                    store: store_name,
                    index: index.to_owned(),
                    entries: added,
                });
            }
            Ok(())
        })
    }

    fn get(&self, store: &str, range: &EncodedKeyRange) -> BackendResult<Option<StoredRecord>> {
        self.with_store(store, |store| {
            Ok(store_range(&store.records, range)
                .next()
                .map(|(key, value)| StoredRecord {
                    key: key.clone(),
                    value: value.clone(),
                }))
        })
    }

    fn get_all(
        &self,
        store: &str,
        range: &EncodedKeyRange,
        count: Option<u32>,
    ) -> BackendResult<Vec<StoredRecord>> {
        self.with_store(store, |store| {
            Ok(store_range(&store.records, range)
                .take(count.map_or(usize::MAX, |count| count as usize))
                .map(|(key, value)| StoredRecord {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect())
        })
    }

    fn count(&self, store: &str, range: &EncodedKeyRange) -> BackendResult<u64> {
        self.with_store(store, |store| {
            Ok(store_range(&store.records, range).count() as u64)
        })
    }

    fn put(&mut self, store: &str, record: PutRecord, overwrite: bool) -> BackendResult<PutItemResult> {
        self.with_store_mut(store, |store, undo| {
            let exists = store.records.contains_key(&record.key);
            if exists && !overwrite {
                return Ok(PutItemResult::CannotOverwrite);
            }
            store.check_unique(&record.key, &record.index_entries)?;
            undo.push(store.saved_record(&record.key));
            if exists {
                let replaced = FxHashSet::from_iter([record.key.clone()]);
                store.remove_index_entries(&replaced);
            }
            for entry in record.index_entries {
                let index = store.index_mut(&entry.index_name)?;
                for key in entry.keys {
                    index.insert((key, record.key.clone()));
                }
            }
            store.records.insert(record.key, record.value);
            Ok(PutItemResult::Success)
        })
    }

    fn delete(&mut self, store: &str, range: &EncodedKeyRange) -> BackendResult<()> {
        self.with_store_mut(store, |store, undo| {
            let doomed: FxHashSet<EncodedKey> = store_range(&store.records, range)
                .map(|(key, _)| key.clone())
                .collect();
            if doomed.is_empty() {
                return Ok(());
            }
            for key in &doomed {
                undo.push(store.saved_record(key));
            }
            store.records.retain(|key, _| !doomed.contains(key));
            store.remove_index_entries(&doomed);
            Ok(())
        })
    }

    fn clear(&mut self, store: &str) -> BackendResult<()> {
        self.with_store_mut(store, |store, undo| {
            let records = mem::take(&mut store.records);
            let indexes = store
                .indexes
                .iter_mut()
                .map(|(name, entries)| (name.clone(), mem::take(entries)))
                .collect();
            undo.push(Undo::Cleared {
                store: store.meta.name.clone(),
                records,
                indexes,
            });
            Ok(())
        })
    }

    fn index_get_all(
        &self,
        store: &str,
        index: &str,
        range: &EncodedKeyRange,
        count: Option<u32>,
        with_value: bool,
    ) -> BackendResult<Vec<IndexRecord>> {
        self.with_store(store, |store| {
            let entries = store.indexes.get(index).ok_or(BackendError::IndexNotFound)?;
            Ok(index_range(entries, range)
                .take(count.map_or(usize::MAX, |count| count as usize))
                .map(|(key, primary_key)| IndexRecord {
                    key: key.clone(),
                    primary_key: primary_key.clone(),
                    value: with_value
                        .then(|| store.records.get(primary_key).cloned())
                        .flatten(),
                })
                .collect())
        })
    }

    fn index_count(&self, store: &str, index: &str, range: &EncodedKeyRange) -> BackendResult<u64> {
        self.with_store(store, |store| {
            let entries = store.indexes.get(index).ok_or(BackendError::IndexNotFound)?;
            Ok(index_range(entries, range).count() as u64)
        })
    }

    fn seek(
        &self,
        source: RecordSource<'_>,
        range: &EncodedKeyRange,
        direction: SeekDirection,
        position: Option<&SeekPosition>,
        with_value: bool,
    ) -> BackendResult<Option<IndexRecord>> {
        let admits = |key: &EncodedKey, primary_key: &EncodedKey| {
            range.contains(key) &&
                position.is_none_or(|position| position.admits(direction, key, primary_key))
        };

        match source {
            RecordSource::ObjectStore(store) => self.with_store(store, |store| {
                let found = match direction {
                    SeekDirection::Forward => {
                        let start = position.map_or(range.lower.as_ref(), |position| {
                            Bound::Included(&position.key)
                        });
                        store
                            .records
                            .range::<EncodedKey, _>((start, Bound::Unbounded))
                            .take_while(move |(key, _)| !range.is_below(key))
                            .find(|(key, _)| admits(key, key))
                    },
                    SeekDirection::Backward => {
                        let end = position.map_or(range.upper.as_ref(), |position| {
                            Bound::Included(&position.key)
                        });
                        store
                            .records
                            .range::<EncodedKey, _>((Bound::Unbounded, end))
                            .rev()
                            .take_while(|(key, _)| !range.is_above(key))
                            .find(|(key, _)| admits(key, key))
                    },
                };
                Ok(found.map(|(key, value)| IndexRecord {
                    key: key.clone(),
                    primary_key: key.clone(),
                    value: with_value.then(|| value.clone()),
                }))
            }),
            RecordSource::Index { store, index } => self.with_store(store, |store| {
                let entries = store.indexes.get(index).ok_or(BackendError::IndexNotFound)?;
                let found = match direction {
                    SeekDirection::Forward => {
                        let start = position.map_or_else(
                            || index_lower_bound(range),
                            |position| {
                                Bound::Included((
                                    position.key.clone(),
                                    position.primary_key.clone().unwrap_or_default(),
                                ))
                            },
                        );
                        entries
                            .range((start, Bound::Unbounded))
                            .take_while(move |(key, _)| !range.is_below(key))
                            .find(|(key, primary_key)| admits(key, primary_key))
                    },
                    SeekDirection::Backward => {
                        let end = position.map_or_else(
                            || index_upper_bound(range),
                            |position| {
                                Bound::Excluded((position.key.successor(), EncodedKey::default()))
                            },
                        );
                        entries
                            .range((Bound::Unbounded, end))
                            .rev()
                            .take_while(|(key, _)| !range.is_above(key))
                            .find(|(key, primary_key)| admits(key, primary_key))
                    },
                };
                Ok(found.map(|(key, primary_key)| IndexRecord {
                    key: key.clone(),
                    primary_key: primary_key.clone(),
                    value: with_value
                        .then(|| store.records.get(primary_key).cloned())
                        .flatten(),
                }))
            }),
        }
    }

    fn next_auto_increment_key(&mut self, store: &str) -> BackendResult<Option<u64>> {
        self.with_store_mut(store, |store, undo| {
            let current = store.key_generator_current;
            if current > MAX_KEY_GENERATOR_VALUE {
                return Ok(None);
            }
            undo.push(store.saved_key_generator());
            store.key_generator_current = current + 1;
            Ok(Some(current))
        })
    }

    fn maybe_update_key_generator(&mut self, store: &str, key: f64) -> BackendResult<()> {
        self.with_store_mut(store, |store, undo| {
            if let Some(current) = updated_key_generator(store.key_generator_current, key) {
                undo.push(store.saved_key_generator());
                store.key_generator_current = current;
            }
            Ok(())
        })
    }

    fn get_auto_increment_current(&self, store: &str) -> BackendResult<u64> {
        self.with_store(store, |store| Ok(store.key_generator_current))
    }

    fn set_auto_increment_current(&mut self, store: &str, current: u64) -> BackendResult<()> {
        self.with_store_mut(store, |store, undo| {
            undo.push(store.saved_key_generator());
            store.key_generator_current = current;
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> BackendResult<()> {
        Ok(())
    }

    fn abort(self: Box<Self>) -> BackendResult<()> {
        let MemoryTransaction { state, mode, undo } = *self;
        debug!("Reverting {} changes", undo.len());
        let mut stores = state.stores.borrow_mut();
        for change in undo.into_iter().rev() {
            change.revert(&mut stores);
        }
        if mode == IndexedDBTxnMode::Versionchange {
            state.pending_version.set(None);
        }
        Ok(())
    }
}
