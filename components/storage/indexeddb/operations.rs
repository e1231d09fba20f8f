/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The operations a request runs against a started backend transaction.
//!
//! Keys cross this boundary decoded and values as script values; everything
//! below is encoded keys and serialized bytes.

use log::debug;
use storage_traits::indexeddb::{
    BackendError, IndexedDBIndex, IndexedDBKeyRange, IndexedDBKeyType, IndexedDBObjectStore,
    KeyPath,
    PutItemResult,
};

use crate::dom::bindings::error::{Error, Fallible, map_backend_error_to_dom_error};
use crate::dom::bindings::structuredclone;
use crate::dom::bindings::value::Value;
use crate::dom::idbcursor::IDBCursorDirection;
use crate::indexed_db::{ExtractionResult, extract_key, inject_key_into_value};
use crate::indexeddb::engines::{
    IndexEntries, KvsTransaction, PutRecord, RecordSource, SeekDirection, SeekPosition,
};
use crate::indexeddb::key_codec::{self, EncodedKey, EncodedKeyRange};

/// An object store, or an index of it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Source {
    pub store: String,
    pub index: Option<String>,
}

impl Source {
    fn as_record_source(&self) -> RecordSource<'_> {
        match &self.index {
            Some(index) => RecordSource::Index {
                store: &self.store,
                index,
            },
            None => RecordSource::ObjectStore(&self.store),
        }
    }
}

/// <https://w3c.github.io/IndexedDB/#iterate-a-cursor>
#[derive(Clone, Debug)]
pub(crate) struct IterationParam {
    pub source: Source,
    pub key_range: IndexedDBKeyRange,
    pub direction: IDBCursorDirection,
    /// The cursor's position.
    pub position: Option<IndexedDBKeyType>,
    /// The cursor's object store position, for index cursors.
    pub object_store_position: Option<IndexedDBKeyType>,
    /// The key passed to `continue()` or `continuePrimaryKey()`.
    pub key: Option<IndexedDBKeyType>,
    pub primary_key: Option<IndexedDBKeyType>,
    pub count: u32,
    pub key_only: bool,
}

#[derive(Debug)]
pub(crate) enum AsyncReadOnlyOperation {
    GetItem {
        source: Source,
        key_range: IndexedDBKeyRange,
    },
    GetKey {
        source: Source,
        key_range: IndexedDBKeyRange,
    },
    GetAllItems {
        source: Source,
        key_range: IndexedDBKeyRange,
        count: Option<u32>,
    },
    GetAllKeys {
        source: Source,
        key_range: IndexedDBKeyRange,
        count: Option<u32>,
    },
    Count {
        source: Source,
        key_range: IndexedDBKeyRange,
    },
    Iterate(IterationParam),
}

#[derive(Debug)]
pub(crate) enum AsyncReadWriteOperation {
    /// <https://w3c.github.io/IndexedDB/#store-a-record-into-an-object-store>
    PutItem {
        store: IndexedDBObjectStore,
        /// Already cloned when the request was made.
        value: Value,
        key: Option<IndexedDBKeyType>,
        should_overwrite: bool,
    },
    RemoveItem {
        store: String,
        key_range: IndexedDBKeyRange,
    },
    Clear(String),
}

#[derive(Debug)]
pub(crate) enum AsyncOperation {
    ReadOnly(AsyncReadOnlyOperation),
    ReadWrite(AsyncReadWriteOperation),
}

/// The record a cursor moved to.
#[derive(Clone, Debug)]
pub(crate) struct CursorRecord {
    pub key: IndexedDBKeyType,
    pub primary_key: IndexedDBKeyType,
    pub value: Option<Value>,
}

#[derive(Debug)]
pub(crate) enum OperationOutcome {
    Undefined,
    Key(IndexedDBKeyType),
    Value(Value),
    Values(Vec<Value>),
    Keys(Vec<IndexedDBKeyType>),
    Count(u64),
    /// `None` once the cursor ran off the end of its range.
    Iteration(Option<CursorRecord>),
}

fn backend(error: BackendError) -> Error {
    map_backend_error_to_dom_error(error)
}

fn decode_key(key: &EncodedKey) -> Fallible<IndexedDBKeyType> {
    key_codec::decode(key).map_err(backend)
}

pub(crate) fn execute(
    operation: AsyncOperation,
    transaction: &mut dyn KvsTransaction,
) -> Fallible<OperationOutcome> {
    match operation {
        AsyncOperation::ReadOnly(operation) => execute_read_only(operation, transaction),
        AsyncOperation::ReadWrite(operation) => execute_read_write(operation, transaction),
    }
}

fn execute_read_only(
    operation: AsyncReadOnlyOperation,
    transaction: &dyn KvsTransaction,
) -> Fallible<OperationOutcome> {
    match operation {
        AsyncReadOnlyOperation::GetItem { source, key_range } => {
            let range = EncodedKeyRange::from(&key_range);
            let data = match &source.index {
                None => transaction
                    .get(&source.store, &range)
                    .map_err(backend)?
                    .map(|record| record.value),
                Some(index) => transaction
                    .index_get_all(&source.store, index, &range, Some(1), true)
                    .map_err(backend)?
                    .into_iter()
                    .next()
                    .and_then(|record| record.value),
            };
            match data {
                Some(data) => Ok(OperationOutcome::Value(structuredclone::read(&data)?)),
                None => Ok(OperationOutcome::Undefined),
            }
        },
        AsyncReadOnlyOperation::GetKey { source, key_range } => {
            let range = EncodedKeyRange::from(&key_range);
            let key = match &source.index {
                None => transaction
                    .get(&source.store, &range)
                    .map_err(backend)?
                    .map(|record| record.key),
                Some(index) => transaction
                    .index_get_all(&source.store, index, &range, Some(1), false)
                    .map_err(backend)?
                    .into_iter()
                    .next()
                    .map(|record| record.primary_key),
            };
            match key {
                Some(key) => Ok(OperationOutcome::Key(decode_key(&key)?)),
                None => Ok(OperationOutcome::Undefined),
            }
        },
        AsyncReadOnlyOperation::GetAllItems {
            source,
            key_range,
            count,
        } => {
            let range = EncodedKeyRange::from(&key_range);
            let data: Vec<Vec<u8>> = match &source.index {
                None => transaction
                    .get_all(&source.store, &range, count)
                    .map_err(backend)?
                    .into_iter()
                    .map(|record| record.value)
                    .collect(),
                Some(index) => transaction
                    .index_get_all(&source.store, index, &range, count, true)
                    .map_err(backend)?
                    .into_iter()
                    .filter_map(|record| record.value)
                    .collect(),
            };
            let values = data
                .iter()
                .map(|data| structuredclone::read(data))
                .collect::<Fallible<Vec<_>>>()?;
            Ok(OperationOutcome::Values(values))
        },
        AsyncReadOnlyOperation::GetAllKeys {
            source,
            key_range,
            count,
        } => {
            let range = EncodedKeyRange::from(&key_range);
            let keys: Vec<EncodedKey> = match &source.index {
                None => transaction
                    .get_all(&source.store, &range, count)
                    .map_err(backend)?
                    .into_iter()
                    .map(|record| record.key)
                    .collect(),
                Some(index) => transaction
                    .index_get_all(&source.store, index, &range, count, false)
                    .map_err(backend)?
                    .into_iter()
                    .map(|record| record.primary_key)
                    .collect(),
            };
            let keys = keys.iter().map(decode_key).collect::<Fallible<Vec<_>>>()?;
            Ok(OperationOutcome::Keys(keys))
        },
        AsyncReadOnlyOperation::Count { source, key_range } => {
            let range = EncodedKeyRange::from(&key_range);
            let count = match &source.index {
                None => transaction.count(&source.store, &range),
                Some(index) => transaction.index_count(&source.store, index, &range),
            }
            .map_err(backend)?;
            Ok(OperationOutcome::Count(count))
        },
        AsyncReadOnlyOperation::Iterate(param) => {
            Ok(OperationOutcome::Iteration(iterate_cursor(param, transaction)?))
        },
    }
}

fn execute_read_write(
    operation: AsyncReadWriteOperation,
    transaction: &mut dyn KvsTransaction,
) -> Fallible<OperationOutcome> {
    match operation {
        AsyncReadWriteOperation::PutItem {
            store,
            value,
            key,
            should_overwrite,
        } => {
            let key = store_a_record(transaction, &store, value, key, !should_overwrite)?;
            Ok(OperationOutcome::Key(key))
        },
        AsyncReadWriteOperation::RemoveItem { store, key_range } => {
            transaction
                .delete(&store, &EncodedKeyRange::from(&key_range))
                .map_err(backend)?;
            Ok(OperationOutcome::Undefined)
        },
        AsyncReadWriteOperation::Clear(store) => {
            transaction.clear(&store).map_err(backend)?;
            Ok(OperationOutcome::Undefined)
        },
    }
}

/// <https://w3c.github.io/IndexedDB/#store-a-record-into-an-object-store>
fn store_a_record(
    transaction: &mut dyn KvsTransaction,
    store: &IndexedDBObjectStore,
    value: Value,
    key: Option<IndexedDBKeyType>,
    no_overwrite: bool,
) -> Fallible<IndexedDBKeyType> {
    // A failed store must not consume a generated key.
    let saved_generator = if store.has_key_generator {
        Some(
            transaction
                .get_auto_increment_current(&store.name)
                .map_err(backend)?,
        )
    } else {
        None
    };

    let result = store_with_generator(transaction, store, value, key, no_overwrite);
    if let (Err(_), Some(saved)) = (&result, saved_generator) {
        debug!("Restoring key generator of {} to {saved}", store.name);
        transaction
            .set_auto_increment_current(&store.name, saved)
            .map_err(backend)?;
    }
    result
}

fn store_with_generator(
    transaction: &mut dyn KvsTransaction,
    store: &IndexedDBObjectStore,
    value: Value,
    key: Option<IndexedDBKeyType>,
    no_overwrite: bool,
) -> Fallible<IndexedDBKeyType> {
    // Step 1: If store uses a key generator, then:
    let key = match key {
        // Step 1.1: If key is undefined, then:
        None if store.has_key_generator => {
            // Step 1.1.1: Let key be the result of generating a key for store.
            // Step 1.1.2: If key is failure, then this operation failed with a
            // "ConstraintError" DOMException.
            let Some(generated) = transaction
                .next_auto_increment_key(&store.name)
                .map_err(backend)?
            else {
                return Err(Error::Constraint);
            };
            let key = IndexedDBKeyType::Number(generated as f64);

            // Step 1.1.3: If store also uses in-line keys, then run inject a key
            // into a value using a key path with value, key and store's key path.
            if let Some(KeyPath::String(key_path)) = &store.key_path {
                if !inject_key_into_value(&value, &key, key_path) {
                    return Err(Error::Data);
                }
            }
            key
        },
        // Step 1.2: Otherwise, run possibly update the key generator for store with key.
        Some(key) => {
            if let (true, IndexedDBKeyType::Number(number)) = (store.has_key_generator, &key) {
                transaction
                    .maybe_update_key_generator(&store.name, *number)
                    .map_err(backend)?;
            }
            key
        },
        None => return Err(Error::Data),
    };

    // Step 5: For each index which references store, compute its index keys.
    let index_entries = store
        .indexes
        .values()
        .map(|index| IndexEntries {
            index_name: index.name.clone(),
            keys: index_keys(&value, index),
        })
        .collect();

    let record = PutRecord {
        key: key_codec::encode(&key),
        value: structuredclone::write(&value)?,
        index_entries,
    };

    // Step 2: If the no-overwrite flag was given and a record already exists
    // with key, this operation failed with a "ConstraintError" DOMException.
    // Step 3-4: Otherwise the old record and its index entries are replaced.
    match transaction.put(&store.name, record, !no_overwrite) {
        Ok(PutItemResult::Success) => Ok(key),
        Ok(PutItemResult::CannotOverwrite) => Err(Error::Constraint),
        Err(error) => Err(backend(error)),
    }
}

/// The keys `value` adds to `index`: one per distinct member of an array
/// for multiEntry indexes, one otherwise, none if the key path yields no
/// valid key.
fn index_keys(value: &Value, index: &IndexedDBIndex) -> Vec<EncodedKey> {
    match extract_key(value, &index.key_path, Some(index.multi_entry)) {
        ExtractionResult::Key(IndexedDBKeyType::Array(members)) if index.multi_entry => {
            let mut keys: Vec<EncodedKey> = members.iter().map(key_codec::encode).collect();
            keys.sort();
            keys.dedup();
            keys
        },
        ExtractionResult::Key(index_key) => vec![key_codec::encode(&index_key)],
        // Step 5.3: If index key is invalid or failure, take no further
        // actions for this index.
        ExtractionResult::Invalid | ExtractionResult::Failure => vec![],
    }
}

/// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-createindex>
/// Step 13: Populate a new index from the records already in its store.
pub(crate) fn populate_index(
    transaction: &mut dyn KvsTransaction,
    store: &str,
    index: &IndexedDBIndex,
) -> Fallible<()> {
    let records = transaction
        .get_all(store, &EncodedKeyRange::unbounded(), None)
        .map_err(backend)?;
    for record in records {
        let value = structuredclone::read(&record.value)?;
        let keys = index_keys(&value, index);
        if keys.is_empty() {
            continue;
        }
        transaction
            .add_index_entries(store, &index.name, &record.key, &keys)
            .map_err(backend)?;
    }
    Ok(())
}

/// <https://w3c.github.io/IndexedDB/#iterate-a-cursor>
fn iterate_cursor(
    param: IterationParam,
    transaction: &dyn KvsTransaction,
) -> Fallible<Option<CursorRecord>> {
    let IterationParam {
        source,
        key_range,
        direction,
        position,
        object_store_position,
        key,
        primary_key,
        count,
        key_only,
    } = param;
    let range = EncodedKeyRange::from(&key_range);
    let record_source = source.as_record_source();
    let is_index = source.index.is_some();
    let unique = matches!(
        direction,
        IDBCursorDirection::Nextunique | IDBCursorDirection::Prevunique
    );
    let seek_direction = match direction {
        IDBCursorDirection::Next | IDBCursorDirection::Nextunique => SeekDirection::Forward,
        IDBCursorDirection::Prev | IDBCursorDirection::Prevunique => SeekDirection::Backward,
    };

    // The first step honors the requested key; later steps only move past the
    // current position.
    let mut seek_from = match key {
        Some(key) => Some(SeekPosition {
            key: key_codec::encode(&key),
            primary_key: primary_key.as_ref().map(key_codec::encode),
            inclusive: true,
        }),
        None => position.as_ref().map(|position| SeekPosition {
            key: key_codec::encode(position),
            primary_key: object_store_position
                .as_ref()
                .filter(|_| is_index && !unique)
                .map(key_codec::encode),
            inclusive: false,
        }),
    };

    // Step 8: Repeat count times.
    let mut found = None;
    for _ in 0..count.max(1) {
        let Some(mut record) = transaction
            .seek(
                record_source,
                &range,
                seek_direction,
                seek_from.as_ref(),
                !key_only,
            )
            .map_err(backend)?
        else {
            // Step 8.1: If found record is not defined, set cursor's key to
            // undefined and return null.
            return Ok(None);
        };

        // Step 8.2: If direction is "prevunique", let temp record be the first
        // record in records which satisfies all of the following: it is in range
        // and its key equals found record's key.
        if direction == IDBCursorDirection::Prevunique {
            let first = transaction
                .seek(
                    record_source,
                    &range,
                    SeekDirection::Forward,
                    Some(&SeekPosition {
                        key: record.key.clone(),
                        primary_key: None,
                        inclusive: true,
                    }),
                    !key_only,
                )
                .map_err(backend)?;
            if let Some(first) = first {
                record = first;
            }
        }

        seek_from = Some(SeekPosition {
            key: record.key.clone(),
            primary_key: Some(record.primary_key.clone()).filter(|_| is_index && !unique),
            inclusive: false,
        });
        found = Some(record);
    }

    let Some(record) = found else {
        return Ok(None);
    };

    // Step 10-12: Set cursor's position, object store position, key and value.
    let value = match &record.value {
        Some(data) if !key_only => Some(structuredclone::read(data)?),
        _ => None,
    };
    Ok(Some(CursorRecord {
        key: decode_key(&record.key)?,
        primary_key: decode_key(&record.primary_key)?,
        value,
    }))
}
