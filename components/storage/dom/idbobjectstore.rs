/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::debug;
use rustc_hash::FxHashMap;
use storage_traits::indexeddb::{
    BackendResult, CreateObjectResult, IndexedDBIndex, IndexedDBKeyType, IndexedDBObjectStore,
    KeyPath,
};

use crate::dom::bindings::error::{Error, ErrorResult, Fallible, map_backend_error_to_dom_error};
use crate::dom::bindings::structuredclone;
use crate::dom::bindings::value::Value;
use crate::dom::idbcursor::{IDBCursor, IDBCursorDirection, IDBCursorSource};
use crate::dom::idbindex::IDBIndex;
use crate::dom::idbrequest::{IDBRequest, IDBRequestSource};
use crate::dom::idbtransaction::{IDBTransaction, IDBTransactionMode};
use crate::indexed_db::{
    ExtractionResult, KeyOrKeyRange, can_inject_key_into_value, convert_value_to_key_range,
    extract_key, is_valid_key_path, validate_key,
};
use crate::indexeddb::engines::KvsTransaction;
use crate::indexeddb::operations::{
    self, AsyncOperation, AsyncReadOnlyOperation, AsyncReadWriteOperation, Source,
};

/// <https://w3c.github.io/IndexedDB/#dictdef-idbindexparameters>
#[derive(Clone, Copy, Debug, Default)]
pub struct IDBIndexParameters {
    pub unique: bool,
    pub multi_entry: bool,
}

/// <https://w3c.github.io/IndexedDB/#object-store-handle-construct>
pub struct IDBObjectStore {
    name: RefCell<String>,
    transaction: Rc<IDBTransaction>,
    /// Set when the store is deleted by the upgrade transaction.
    deleted: Cell<bool>,
    /// <https://w3c.github.io/IndexedDB/#object-store-handle-index-set>
    index_handles: RefCell<FxHashMap<String, Rc<IDBIndex>>>,
}

impl IDBObjectStore {
    pub(crate) fn new(transaction: &Rc<IDBTransaction>, name: &str) -> Rc<IDBObjectStore> {
        Rc::new(IDBObjectStore {
            name: RefCell::new(name.to_owned()),
            transaction: transaction.clone(),
            deleted: Cell::new(false),
            index_handles: Default::default(),
        })
    }

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    pub fn transaction(&self) -> Rc<IDBTransaction> {
        self.transaction.clone()
    }

    /// The schema of this store as the connection last saw it.
    pub(crate) fn meta(&self) -> Fallible<IndexedDBObjectStore> {
        self.transaction
            .db()
            .object_store_meta(&self.name.borrow())
            .ok_or(Error::InvalidState)
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.get() || !self.transaction.db().object_store_exists(&self.name.borrow())
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.set(true);
        for index in self.index_handles.borrow().values() {
            index.mark_deleted();
        }
    }

    fn source(&self) -> Source {
        Source {
            store: self.name(),
            index: None,
        }
    }

    /// Runs `callback` against the backend transaction of this handle.
    pub(crate) fn with_backend<R>(
        &self,
        callback: impl FnOnce(&mut dyn KvsTransaction) -> BackendResult<R>,
    ) -> Fallible<R> {
        let db = self.transaction.db();
        self.transaction
            .global()
            .indexeddb_manager()
            .with_transaction(db.name(), self.transaction.serial_number(), callback)
            .and_then(|result| result)
            .map_err(map_backend_error_to_dom_error)
    }

    fn verify_not_deleted(&self) -> ErrorResult {
        if self.is_deleted() {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    /// Checks if the transaction is active, throwing a "TransactionInactiveError" DOMException if not.
    fn check_transaction_active(&self) -> ErrorResult {
        if !self.transaction.is_active() {
            return Err(Error::TransactionInactive);
        }
        Ok(())
    }

    /// Checks if the transaction is active, throwing a "TransactionInactiveError" DOMException if not.
    /// it then checks if the transaction is a read-only transaction, throwing a "ReadOnlyError" DOMException if so.
    fn check_readwrite_transaction_active(&self) -> ErrorResult {
        self.check_transaction_active()?;
        if self.transaction.mode() == IDBTransactionMode::Readonly {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// The schema checks of `createIndex()`, `deleteIndex()` and renames.
    fn check_upgrade_transaction_active(&self) -> ErrorResult {
        // If transaction is not an upgrade transaction, throw an "InvalidStateError" DOMException.
        if self.transaction.mode() != IDBTransactionMode::Versionchange {
            return Err(Error::InvalidState);
        }
        // If store has been deleted, throw an "InvalidStateError" DOMException.
        self.verify_not_deleted()?;
        // If transaction's state is not active, then throw a "TransactionInactiveError" DOMException.
        self.check_transaction_active()
    }

    fn execute(self: &Rc<Self>, operation: AsyncOperation) -> Fallible<Rc<IDBRequest>> {
        IDBRequest::execute_async(
            IDBRequestSource::ObjectStore(self.clone()),
            operation,
            None,
            None,
        )
    }

    // https://www.w3.org/TR/IndexedDB-2/#dom-idbobjectstore-put
    fn put_or_add(
        self: &Rc<Self>,
        value: &Value,
        key: Option<&Value>,
        overwrite: bool,
    ) -> Fallible<Rc<IDBRequest>> {
        // Step 1. Let transaction be handle's transaction.
        // Step 2: Let store be this object store handle's object store.
        // Step 3: If store has been deleted, throw an "InvalidStateError" DOMException.
        self.verify_not_deleted()?;

        // Step 4. If transaction's state is not active, then throw a "TransactionInactiveError" DOMException.
        // Step 5. If transaction is a read-only transaction, throw a "ReadOnlyError" DOMException.
        self.check_readwrite_transaction_active()?;

        let store = self.meta()?;
        let key = key.filter(|key| !key.is_undefined());

        // Step 6: If store uses in-line keys and key was given, throw a "DataError" DOMException.
        if key.is_some() && store.key_path.is_some() {
            return Err(Error::Data);
        }

        // Step 7: If store uses out-of-line keys and has no key generator
        // and key was not given, throw a "DataError" DOMException.
        if key.is_none() && store.key_path.is_none() && !store.has_key_generator {
            return Err(Error::Data);
        }

        // Step 8: If key was given, then: convert a value to a key with key.
        // Rethrow any exceptions, and throw a "DataError" if the key is invalid.
        let mut key: Option<IndexedDBKeyType> = key.map(validate_key).transpose()?;

        // Step 9-10. Let clone be a clone of value in targetRealm during transaction. Rethrow any exceptions.
        let clone = structuredclone::clone(value)?;

        // Step 11: If store uses in-line keys, then:
        if let Some(key_path) = &store.key_path {
            match extract_key(&clone, key_path, None) {
                // Step 11.4: Set key to kpk.
                ExtractionResult::Key(extracted) => key = Some(extracted),
                // Step 11.2: If kpk is invalid, throw a "DataError" DOMException.
                ExtractionResult::Invalid => return Err(Error::Data),
                // Step 11.3: If kpk is failure, then: the store needs a key
                // generator, and a place to inject the generated key.
                ExtractionResult::Failure => {
                    if !store.has_key_generator {
                        return Err(Error::Data);
                    }
                    let injectable = match key_path {
                        KeyPath::String(path) => can_inject_key_into_value(&clone, path),
                        KeyPath::Sequence(_) => false,
                    };
                    if !injectable {
                        return Err(Error::Data);
                    }
                },
            }
        }

        // Step 12. Let operation be an algorithm to run store a record into an object store with store, clone, key, and no-overwrite flag.
        // Step 13. Return the result (an IDBRequest) of running asynchronously execute a request with handle and operation.
        self.execute(AsyncOperation::ReadWrite(
            AsyncReadWriteOperation::PutItem {
                store,
                value: clone,
                key,
                should_overwrite: overwrite,
            },
        ))
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-put>
    pub fn put(self: &Rc<Self>, value: &Value, key: Option<&Value>) -> Fallible<Rc<IDBRequest>> {
        self.put_or_add(value, key, true)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-add>
    pub fn add(self: &Rc<Self>, value: &Value, key: Option<&Value>) -> Fallible<Rc<IDBRequest>> {
        self.put_or_add(value, key, false)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-delete>
    pub fn delete(self: &Rc<Self>, query: &KeyOrKeyRange) -> Fallible<Rc<IDBRequest>> {
        // Step 1. Let transaction be this's transaction.
        // Step 2. Let store be this's object store.
        // Step 3. If store has been deleted, throw an "InvalidStateError" DOMException.
        self.verify_not_deleted()?;

        // Step 4. If transaction's state is not active, then throw a "TransactionInactiveError" DOMException.
        // Step 5. If transaction is a read-only transaction, throw a "ReadOnlyError" DOMException.
        self.check_readwrite_transaction_active()?;

        // Step 6. Let range be the result of converting a value to a key range
        // with query and true. Rethrow any exceptions.
        let key_range = convert_value_to_key_range(Some(query), Some(true))?;

        // Step 7. Let operation be an algorithm to run delete records from an object store with store and range.
        // Step 8. Return the result (an IDBRequest) of running asynchronously execute a request with this and operation.
        self.execute(AsyncOperation::ReadWrite(
            AsyncReadWriteOperation::RemoveItem {
                store: self.name(),
                key_range,
            },
        ))
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-clear>
    pub fn clear(self: &Rc<Self>) -> Fallible<Rc<IDBRequest>> {
        // Step 1. Let transaction be this's transaction.
        // Step 2. Let store be this's object store.
        // Step 3. If store has been deleted, throw an "InvalidStateError" DOMException.
        self.verify_not_deleted()?;

        // Step 4. If transaction's state is not active, then throw a "TransactionInactiveError" DOMException.
        // Step 5. If transaction is a read-only transaction, throw a "ReadOnlyError" DOMException.
        self.check_readwrite_transaction_active()?;

        // Step 6. Let operation be an algorithm to run clear an object store with store.
        // Step 7. Return the result (an IDBRequest) of running asynchronously execute a request with this and operation.
        self.execute(AsyncOperation::ReadWrite(AsyncReadWriteOperation::Clear(
            self.name(),
        )))
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-get>
    pub fn get(self: &Rc<Self>, query: &KeyOrKeyRange) -> Fallible<Rc<IDBRequest>> {
        // Step 1. Let transaction be this's transaction.
        // Step 2. Let store be this's object store.
        // Step 3. If store has been deleted, throw an "InvalidStateError" DOMException.
        self.verify_not_deleted()?;

        // Step 4. If transaction's state is not active, then throw a "TransactionInactiveError" DOMException.
        self.check_transaction_active()?;

        // Step 5. Let range be the result of converting a value to a key range with query and true. Rethrow any exceptions.
        let key_range = convert_value_to_key_range(Some(query), Some(true))?;

        // Step 6. Let operation be an algorithm to run retrieve a value from an object store with the current Realm record, store, and range.
        // Step 7. Return the result (an IDBRequest) of running asynchronously execute a request with this and operation.
        self.execute(AsyncOperation::ReadOnly(AsyncReadOnlyOperation::GetItem {
            source: self.source(),
            key_range,
        }))
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-getkey>
    pub fn get_key(self: &Rc<Self>, query: &KeyOrKeyRange) -> Fallible<Rc<IDBRequest>> {
        // Step 1. Let transaction be this's transaction.
        // Step 2. Let store be this's object store.
        // Step 3. If store has been deleted, throw an "InvalidStateError" DOMException.
        self.verify_not_deleted()?;

        // Step 4. If transaction's state is not active, then throw a "TransactionInactiveError" DOMException.
        self.check_transaction_active()?;

        // Step 5. Let range be the result of running the steps to convert a value to a key range with query and null disallowed flag set. Rethrow any exceptions.
        let key_range = convert_value_to_key_range(Some(query), Some(true))?;

        // Step 6. Run the steps to asynchronously execute a request and return the IDBRequest created by these steps.
        self.execute(AsyncOperation::ReadOnly(AsyncReadOnlyOperation::GetKey {
            source: self.source(),
            key_range,
        }))
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-getall>
    pub fn get_all(
        self: &Rc<Self>,
        query: Option<&KeyOrKeyRange>,
        count: Option<u32>,
    ) -> Fallible<Rc<IDBRequest>> {
        self.verify_not_deleted()?;
        self.check_transaction_active()?;

        // Step 5. Let range be the result of converting a value to a key range with query. Rethrow any exceptions.
        let key_range = convert_value_to_key_range(query, None)?;

        // A count of 0 means no limit.
        self.execute(AsyncOperation::ReadOnly(
            AsyncReadOnlyOperation::GetAllItems {
                source: self.source(),
                key_range,
                count: count.filter(|count| *count > 0),
            },
        ))
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-getallkeys>
    pub fn get_all_keys(
        self: &Rc<Self>,
        query: Option<&KeyOrKeyRange>,
        count: Option<u32>,
    ) -> Fallible<Rc<IDBRequest>> {
        self.verify_not_deleted()?;
        self.check_transaction_active()?;
        let key_range = convert_value_to_key_range(query, None)?;
        self.execute(AsyncOperation::ReadOnly(
            AsyncReadOnlyOperation::GetAllKeys {
                source: self.source(),
                key_range,
                count: count.filter(|count| *count > 0),
            },
        ))
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-count>
    pub fn count(self: &Rc<Self>, query: Option<&KeyOrKeyRange>) -> Fallible<Rc<IDBRequest>> {
        // Step 1. Let transaction be this's transaction.
        // Step 2. Let store be this's object store.
        // Step 3. If store has been deleted, throw an "InvalidStateError" DOMException.
        self.verify_not_deleted()?;

        // Step 4. If transaction's state is not active, then throw a "TransactionInactiveError" DOMException.
        self.check_transaction_active()?;

        // Step 5. Let range be the result of converting a value to a key range with query. Rethrow any exceptions.
        let key_range = convert_value_to_key_range(query, None)?;

        // Step 6. Let operation be an algorithm to run count the records in a range with store and range.
        // Step 7. Return the result (an IDBRequest) of running asynchronously execute a request with this and operation.
        self.execute(AsyncOperation::ReadOnly(AsyncReadOnlyOperation::Count {
            source: self.source(),
            key_range,
        }))
    }

    /// <https://www.w3.org/TR/IndexedDB-2/#dom-idbobjectstore-opencursor>
    /// <https://www.w3.org/TR/IndexedDB-2/#dom-idbobjectstore-openkeycursor>
    fn open_cursor_common(
        self: &Rc<Self>,
        query: Option<&KeyOrKeyRange>,
        direction: IDBCursorDirection,
        key_only: bool,
    ) -> Fallible<Rc<IDBRequest>> {
        // Step 1. Let transaction be this object store handle's transaction.
        // Step 2. Let store be this object store handle's object store.
        // Step 3. If store has been deleted, throw an "InvalidStateError" DOMException.
        self.verify_not_deleted()?;

        // Step 4. If transaction is not active, throw a "TransactionInactiveError" DOMException.
        self.check_transaction_active()?;

        // Step 5. Let range be the result of running the steps to convert a value to a key range
        // with query. Rethrow any exceptions.
        let range = convert_value_to_key_range(query, None)?;

        // Step 6. Let cursor be a new cursor with transaction set to transaction, an undefined
        // position, direction set to direction, got value flag unset, and undefined key and value.
        // Step 7. Run the steps to asynchronously execute a request and return the IDBRequest
        // created by these steps.
        IDBCursor::open(
            IDBCursorSource::ObjectStore(self.clone()),
            range,
            direction,
            key_only,
        )
    }

    pub fn open_cursor(
        self: &Rc<Self>,
        query: Option<&KeyOrKeyRange>,
        direction: IDBCursorDirection,
    ) -> Fallible<Rc<IDBRequest>> {
        self.open_cursor_common(query, direction, false)
    }

    pub fn open_key_cursor(
        self: &Rc<Self>,
        query: Option<&KeyOrKeyRange>,
        direction: IDBCursorDirection,
    ) -> Fallible<Rc<IDBRequest>> {
        self.open_cursor_common(query, direction, true)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-index>
    pub fn index(self: &Rc<Self>, name: &str) -> Fallible<Rc<IDBIndex>> {
        // Step 3: If store has been deleted, throw an "InvalidStateError" DOMException.
        self.verify_not_deleted()?;

        // Step 4: If transaction's state is finished, then throw an "InvalidStateError" DOMException.
        if self.transaction.is_finished() {
            return Err(Error::InvalidState);
        }

        // Step 5: Let index be the index named name in this's index set if one
        // exists, or throw a "NotFoundError" DOMException otherwise.
        if self.meta()?.index(name).is_none() {
            return Err(Error::NotFound);
        }

        // Step 6: Return an index handle associated with index and this.
        Ok(self.index_handle(name))
    }

    fn index_handle(self: &Rc<Self>, name: &str) -> Rc<IDBIndex> {
        self.index_handles
            .borrow_mut()
            .entry(name.to_owned())
            .or_insert_with(|| IDBIndex::new(self, name))
            .clone()
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-createindex>
    ///
    /// When existing records violate a unique index, the transaction is
    /// aborted with a "ConstraintError" and the returned handle refers to an
    /// index that was never added, so every call on it throws an
    /// "InvalidStateError".
    pub fn create_index(
        self: &Rc<Self>,
        name: &str,
        key_path: KeyPath,
        options: &IDBIndexParameters,
    ) -> Fallible<Rc<IDBIndex>> {
        // Step 1-5: The transaction must be an active upgrade transaction and the
        // store must not have been deleted.
        self.check_upgrade_transaction_active()?;
        let mut store = self.meta()?;

        // Step 6: If an index named name already exists in store, throw a "ConstraintError" DOMException.
        if store.index(name).is_some() {
            return Err(Error::Constraint);
        }

        // Step 7: If keyPath is not a valid key path, throw a "SyntaxError" DOMException.
        if !is_valid_key_path(&key_path) {
            return Err(Error::Syntax);
        }

        // Step 8-9: If keyPath is a sequence and multiEntry is true, throw an
        // "InvalidAccessError" DOMException.
        if matches!(key_path, KeyPath::Sequence(_)) && options.multi_entry {
            return Err(Error::InvalidAccess);
        }

        // Step 10: Let index be a new index in store.
        let index = IndexedDBIndex {
            name: name.to_owned(),
            key_path,
            unique: options.unique,
            multi_entry: options.multi_entry,
        };
        let store_name = self.name();
        let created = self.with_backend(|backend| backend.create_index(&store_name, index.clone()))?;
        if created == CreateObjectResult::AlreadyExists {
            return Err(Error::Constraint);
        }

        // The index is populated from the records the store already holds.
        let db = self.transaction.db();
        let populated = self
            .transaction
            .global()
            .indexeddb_manager()
            .with_transaction(db.name(), self.transaction.serial_number(), |backend| {
                operations::populate_index(backend, &store_name, &index)
            })
            .map_err(map_backend_error_to_dom_error)?;
        match populated {
            Ok(()) => {},
            // If an existing record violates the unique flag, the index cannot be
            // created and the transaction aborts with a "ConstraintError".
            Err(Error::Constraint) => {
                debug!("Index {name} of {store_name} violates its unique flag");
                self.transaction.abort_transaction(Some(Error::Constraint));
                return Ok(self.index_handle(name));
            },
            Err(error) => return Err(error),
        }

        store.indexes.insert(name.to_owned(), index);
        db.update_object_store_meta(store);

        // Step 11: Add index to this's index set.
        // Step 12: Return a new index handle associated with index and this.
        Ok(self.index_handle(name))
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-deleteindex>
    pub fn delete_index(&self, name: &str) -> ErrorResult {
        // Step 1-5.
        self.check_upgrade_transaction_active()?;
        let mut store = self.meta()?;

        // Step 6: Let index be the index named name in store if one exists, or
        // throw a "NotFoundError" DOMException otherwise.
        if store.indexes.remove(name).is_none() {
            return Err(Error::NotFound);
        }

        // Step 7: Remove index from this's index set.
        if let Some(handle) = self.index_handles.borrow_mut().remove(name) {
            handle.mark_deleted();
        }

        // Step 8: Destroy index.
        let store_name = self.name();
        self.with_backend(|backend| backend.delete_index(&store_name, name))?;
        self.transaction.db().update_object_store_meta(store);
        Ok(())
    }

    /// Renames an index of this store; see `IDBIndex::set_name`.
    pub(crate) fn rename_index(&self, name: &str, new_name: &str) -> ErrorResult {
        let mut store = self.meta()?;
        if store.index(new_name).is_some() {
            return Err(Error::Constraint);
        }
        let store_name = self.name();
        self.with_backend(|backend| backend.rename_index(&store_name, name, new_name))?;
        if let Some(mut index) = store.indexes.remove(name) {
            index.name = new_name.to_owned();
            store.indexes.insert(new_name.to_owned(), index);
        }
        self.transaction.db().update_object_store_meta(store);

        let mut handles = self.index_handles.borrow_mut();
        if let Some(handle) = handles.remove(name) {
            handles.insert(new_name.to_owned(), handle);
        }
        Ok(())
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-name>
    pub fn set_name(&self, value: &str) -> ErrorResult {
        // Step 2. Let transaction be this's transaction.
        // Step 3. Let store be this's object store.
        // Step 4. If store has been deleted, throw an "InvalidStateError" DOMException.
        // Step 5. If transaction is not an upgrade transaction, throw an "InvalidStateError" DOMException.
        // Step 6. If transaction's state is not active, throw a "TransactionInactiveError" DOMException.
        self.check_upgrade_transaction_active()?;

        // Step 7. If store's name is equal to name, terminate these steps.
        let name = self.name();
        if name == value {
            return Ok(());
        }

        // Step 8. If an object store named name already exists in store's
        // database, throw a "ConstraintError" DOMException.
        let db = self.transaction.db();
        if db.object_store_exists(value) {
            return Err(Error::Constraint);
        }

        // Step 9. Set store's name to name.
        // Step 10. Set this's name to name.
        db.rename_object_store(&name, value)?;
        self.transaction.rename_object_store_handle(&name, value);
        *self.name.borrow_mut() = value.to_owned();
        Ok(())
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-keypath>
    pub fn key_path(&self) -> Option<KeyPath> {
        self.meta().ok().and_then(|store| store.key_path)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-indexnames>
    pub fn index_names(&self) -> Vec<String> {
        self.meta()
            .map(|store| store.index_names())
            .unwrap_or_default()
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbobjectstore-autoincrement>
    pub fn auto_increment(&self) -> bool {
        self.meta().is_ok_and(|store| store.has_key_generator)
    }
}
