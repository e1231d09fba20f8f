/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use storage_traits::indexeddb::{IndexedDBKeyRange, IndexedDBKeyType};

use crate::dom::bindings::error::{Error, ErrorResult, Fallible};
use crate::dom::bindings::structuredclone;
use crate::dom::bindings::value::Value;
use crate::dom::idbindex::IDBIndex;
use crate::dom::idbobjectstore::IDBObjectStore;
use crate::dom::idbrequest::{IDBRequest, IDBRequestSource};
use crate::dom::idbtransaction::{IDBTransaction, IDBTransactionMode};
use crate::indexed_db::{ExtractionResult, extract_key, key_type_to_value, validate_key};
use crate::indexeddb::operations::{
    AsyncOperation, AsyncReadOnlyOperation, AsyncReadWriteOperation, CursorRecord,
    IterationParam, Source,
};

/// <https://w3c.github.io/IndexedDB/#enumdef-idbcursordirection>
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum IDBCursorDirection {
    #[default]
    Next,
    Nextunique,
    Prev,
    Prevunique,
}

impl IDBCursorDirection {
    fn is_forward(self) -> bool {
        matches!(self, IDBCursorDirection::Next | IDBCursorDirection::Nextunique)
    }
}

/// <https://w3c.github.io/IndexedDB/#cursor-source>
#[derive(Clone)]
pub enum IDBCursorSource {
    ObjectStore(Rc<IDBObjectStore>),
    Index(Rc<IDBIndex>),
}

impl IDBCursorSource {
    fn object_store(&self) -> Rc<IDBObjectStore> {
        match self {
            IDBCursorSource::ObjectStore(store) => store.clone(),
            IDBCursorSource::Index(index) => index.object_store(),
        }
    }

    fn is_deleted(&self) -> bool {
        match self {
            IDBCursorSource::ObjectStore(store) => store.is_deleted(),
            IDBCursorSource::Index(index) => index.is_deleted(),
        }
    }

    fn as_request_source(&self) -> IDBRequestSource {
        match self {
            IDBCursorSource::ObjectStore(store) => IDBRequestSource::ObjectStore(store.clone()),
            IDBCursorSource::Index(index) => IDBRequestSource::Index(index.clone()),
        }
    }

    fn as_operation_source(&self) -> Source {
        match self {
            IDBCursorSource::ObjectStore(store) => Source {
                store: store.name(),
                index: None,
            },
            IDBCursorSource::Index(index) => Source {
                store: index.object_store().name(),
                index: Some(index.name()),
            },
        }
    }
}

/// <https://w3c.github.io/IndexedDB/#cursor>
pub struct IDBCursor {
    /// <https://w3c.github.io/IndexedDB/#cursor-transaction>
    transaction: Rc<IDBTransaction>,
    /// <https://w3c.github.io/IndexedDB/#cursor-source>
    source: IDBCursorSource,
    /// <https://w3c.github.io/IndexedDB/#cursor-direction>
    direction: IDBCursorDirection,
    /// <https://w3c.github.io/IndexedDB/#cursor-range>
    range: IndexedDBKeyRange,
    /// <https://w3c.github.io/IndexedDB/#cursor-key-only-flag>
    key_only: bool,

    /// <https://w3c.github.io/IndexedDB/#cursor-position>
    position: RefCell<Option<IndexedDBKeyType>>,
    /// <https://w3c.github.io/IndexedDB/#cursor-object-store-position>
    object_store_position: RefCell<Option<IndexedDBKeyType>>,
    /// <https://w3c.github.io/IndexedDB/#cursor-key>
    key: RefCell<Option<IndexedDBKeyType>>,
    /// <https://w3c.github.io/IndexedDB/#cursor-value>
    value: RefCell<Value>,
    /// <https://w3c.github.io/IndexedDB/#cursor-got-value-flag>
    got_value: Cell<bool>,

    /// <https://w3c.github.io/IndexedDB/#cursor-request>
    request: RefCell<Option<Rc<IDBRequest>>>,
}

impl IDBCursor {
    pub(crate) fn new(
        transaction: &Rc<IDBTransaction>,
        source: IDBCursorSource,
        direction: IDBCursorDirection,
        range: IndexedDBKeyRange,
        key_only: bool,
    ) -> Rc<IDBCursor> {
        Rc::new(IDBCursor {
            transaction: transaction.clone(),
            source,
            direction,
            range,
            key_only,
            position: Default::default(),
            object_store_position: Default::default(),
            key: Default::default(),
            value: Default::default(),
            got_value: Cell::new(false),
            request: Default::default(),
        })
    }

    /// Opens a cursor on `source` and starts its first iteration.
    pub(crate) fn open(
        source: IDBCursorSource,
        range: IndexedDBKeyRange,
        direction: IDBCursorDirection,
        key_only: bool,
    ) -> Fallible<Rc<IDBRequest>> {
        let transaction = source.object_store().transaction();
        let cursor = IDBCursor::new(&transaction, source.clone(), direction, range, key_only);
        let param = cursor.iteration_param(None, None, 1);
        let request = IDBRequest::execute_async(
            source.as_request_source(),
            AsyncOperation::ReadOnly(AsyncReadOnlyOperation::Iterate(param)),
            None,
            Some(cursor.clone()),
        )?;
        *cursor.request.borrow_mut() = Some(request.clone());
        Ok(request)
    }

    pub(crate) fn transaction(&self) -> Rc<IDBTransaction> {
        self.transaction.clone()
    }

    fn iteration_param(
        &self,
        key: Option<IndexedDBKeyType>,
        primary_key: Option<IndexedDBKeyType>,
        count: u32,
    ) -> IterationParam {
        IterationParam {
            source: self.source.as_operation_source(),
            key_range: self.range.clone(),
            direction: self.direction,
            position: self.position.borrow().clone(),
            object_store_position: self.object_store_position.borrow().clone(),
            key,
            primary_key,
            count,
            key_only: self.key_only,
        }
    }

    /// <https://w3c.github.io/IndexedDB/#iterate-a-cursor>
    /// Step 10-13: the cursor moved to `record`.
    pub(crate) fn set_iteration_result(&self, record: CursorRecord) {
        *self.position.borrow_mut() = Some(record.key.clone());
        *self.object_store_position.borrow_mut() = Some(record.primary_key);
        *self.key.borrow_mut() = Some(record.key);
        *self.value.borrow_mut() = record.value.unwrap_or_default();
        self.got_value.set(true);
    }

    /// <https://w3c.github.io/IndexedDB/#iterate-a-cursor>
    /// Step 8.1: the cursor ran off the end of its range.
    pub(crate) fn clear_iteration_result(&self) {
        *self.key.borrow_mut() = None;
        *self.value.borrow_mut() = Value::Undefined;
        self.got_value.set(false);
    }

    /// <https://w3c.github.io/IndexedDB/#cursor-effective-key>
    fn effective_key(&self) -> Option<IndexedDBKeyType> {
        match &self.source {
            IDBCursorSource::ObjectStore(_) => self.position.borrow().clone(),
            IDBCursorSource::Index(_) => self.object_store_position.borrow().clone(),
        }
    }

    /// The checks shared by `advance()`, `continue()` and `continuePrimaryKey()`.
    fn check_can_iterate(&self) -> ErrorResult {
        // If transaction's state is not active, throw a "TransactionInactiveError" DOMException.
        if !self.transaction.is_active() {
            return Err(Error::TransactionInactive);
        }

        // If this's source or effective object store has been deleted, throw an
        // "InvalidStateError" DOMException.
        if self.source.is_deleted() {
            return Err(Error::InvalidState);
        }

        // If this's got value flag is false, indicating that the cursor is being
        // iterated or has iterated past its end, throw an "InvalidStateError" DOMException.
        if !self.got_value.get() {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    fn iterate(
        self: &Rc<Self>,
        key: Option<IndexedDBKeyType>,
        primary_key: Option<IndexedDBKeyType>,
        count: u32,
    ) -> ErrorResult {
        let request = self.request.borrow().clone().ok_or(Error::InvalidState)?;
        let param = self.iteration_param(key, primary_key, count);

        // Set this's got value flag to false.
        self.got_value.set(false);

        // Let request be this's request, set its processed flag to false and its
        // done flag to false, then run asynchronously execute a request with
        // this's source, operation and request.
        IDBRequest::execute_async(
            self.source.as_request_source(),
            AsyncOperation::ReadOnly(AsyncReadOnlyOperation::Iterate(param)),
            Some(request),
            Some(self.clone()),
        )?;
        Ok(())
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbcursor-advance>
    pub fn advance(self: &Rc<Self>, count: u32) -> ErrorResult {
        // Step 1: If count is 0 (zero), throw a TypeError.
        if count == 0 {
            return Err(Error::Type("advance() count must not be zero".to_owned()));
        }
        // Step 2-5.
        self.check_can_iterate()?;
        // Step 6-10.
        self.iterate(None, None, count)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbcursor-continue>
    pub fn continue_(self: &Rc<Self>, key: Option<&Value>) -> ErrorResult {
        // Step 1-4.
        self.check_can_iterate()?;

        // Step 5: If key is given, then:
        let key = match key.filter(|key| !key.is_undefined()) {
            Some(key) => {
                // Step 5.1-5.2: Convert key, throwing a "DataError" if invalid.
                let key = validate_key(key)?;
                // Step 5.3-5.4: key must be past the cursor's position in its direction.
                if let Some(position) = self.position.borrow().as_ref() {
                    let past = if self.direction.is_forward() {
                        key > *position
                    } else {
                        key < *position
                    };
                    if !past {
                        return Err(Error::Data);
                    }
                }
                Some(key)
            },
            None => None,
        };

        // Step 6-9.
        self.iterate(key, None, 1)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbcursor-continueprimarykey>
    pub fn continue_primary_key(self: &Rc<Self>, key: &Value, primary_key: &Value) -> ErrorResult {
        // Step 1-2: If transaction is not active, throw a "TransactionInactiveError".
        if !self.transaction.is_active() {
            return Err(Error::TransactionInactive);
        }

        // Step 3: If this's source or effective object store has been deleted,
        // throw an "InvalidStateError" DOMException.
        if self.source.is_deleted() {
            return Err(Error::InvalidState);
        }

        // Step 4: If this's source is not an index throw an "InvalidAccessError" DOMException.
        if !matches!(self.source, IDBCursorSource::Index(_)) {
            return Err(Error::InvalidAccess);
        }

        // Step 5: If this's direction is not "next" or "prev", throw an
        // "InvalidAccessError" DOMException.
        if !matches!(
            self.direction,
            IDBCursorDirection::Next | IDBCursorDirection::Prev
        ) {
            return Err(Error::InvalidAccess);
        }

        // Step 6: If this's got value flag is false, throw an "InvalidStateError" DOMException.
        if !self.got_value.get() {
            return Err(Error::InvalidState);
        }

        // Step 7-10: Convert both keys, throwing a "DataError" if invalid.
        let key = validate_key(key)?;
        let primary_key = validate_key(primary_key)?;

        // Step 11-14: The pair must be past the cursor's position and object
        // store position in its direction.
        let position = self.position.borrow().clone();
        let object_store_position = self.object_store_position.borrow().clone();
        if let (Some(position), Some(object_store_position)) = (position, object_store_position) {
            let past = if self.direction.is_forward() {
                key > position || (key == position && primary_key > object_store_position)
            } else {
                key < position || (key == position && primary_key < object_store_position)
            };
            if !past {
                return Err(Error::Data);
            }
        }

        // Step 15-18.
        self.iterate(Some(key), Some(primary_key), 1)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbcursor-update>
    pub fn update(self: &Rc<Self>, value: &Value) -> Fallible<Rc<IDBRequest>> {
        // Step 1-2: If transaction's state is not active, throw a "TransactionInactiveError".
        if !self.transaction.is_active() {
            return Err(Error::TransactionInactive);
        }

        // Step 3: If transaction is a read-only transaction, throw a "ReadOnlyError" DOMException.
        if self.transaction.mode() == IDBTransactionMode::Readonly {
            return Err(Error::ReadOnly);
        }

        // Step 4: If this's source or effective object store has been deleted,
        // throw an "InvalidStateError" DOMException.
        if self.source.is_deleted() {
            return Err(Error::InvalidState);
        }

        // Step 5: If this's got value flag is false or its key only flag is true,
        // throw an "InvalidStateError" DOMException.
        if !self.got_value.get() || self.key_only {
            return Err(Error::InvalidState);
        }
        let effective_key = self.effective_key().ok_or(Error::InvalidState)?;
        let store = self.source.object_store().meta()?;

        // Step 7: Let clone be a clone of value. Rethrow any exceptions.
        let clone = structuredclone::clone(value)?;

        // Step 8: If the effective object store uses in-line keys, the key
        // extracted from clone must equal the cursor's effective key.
        if let Some(key_path) = &store.key_path {
            match extract_key(&clone, key_path, None) {
                ExtractionResult::Key(key) if key == effective_key => {},
                _ => return Err(Error::Data),
            }
        }

        // Step 9: Let operation be an algorithm to run store a record into an
        // object store with the effective object store, clone, the effective
        // key, and with the no-overwrite flag false.
        // Step 10: Return the result of asynchronously executing a request with
        // this as source.
        IDBRequest::execute_async(
            IDBRequestSource::Cursor(self.clone()),
            AsyncOperation::ReadWrite(AsyncReadWriteOperation::PutItem {
                store,
                value: clone,
                key: Some(effective_key),
                should_overwrite: true,
            }),
            None,
            None,
        )
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbcursor-delete>
    pub fn delete(self: &Rc<Self>) -> Fallible<Rc<IDBRequest>> {
        // Step 1-2.
        if !self.transaction.is_active() {
            return Err(Error::TransactionInactive);
        }
        // Step 3.
        if self.transaction.mode() == IDBTransactionMode::Readonly {
            return Err(Error::ReadOnly);
        }
        // Step 4.
        if self.source.is_deleted() {
            return Err(Error::InvalidState);
        }
        // Step 5.
        if !self.got_value.get() || self.key_only {
            return Err(Error::InvalidState);
        }
        let effective_key = self.effective_key().ok_or(Error::InvalidState)?;

        // Step 6: Let operation be an algorithm to run delete records from an
        // object store with the effective object store and the effective key.
        // Step 7: Return the result of asynchronously executing a request with
        // this as source.
        IDBRequest::execute_async(
            IDBRequestSource::Cursor(self.clone()),
            AsyncOperation::ReadWrite(AsyncReadWriteOperation::RemoveItem {
                store: self.source.object_store().name(),
                key_range: IndexedDBKeyRange::only(effective_key),
            }),
            None,
            None,
        )
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbcursor-source>
    pub fn source(&self) -> IDBCursorSource {
        self.source.clone()
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbcursor-direction>
    pub fn direction(&self) -> IDBCursorDirection {
        self.direction
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbcursor-key>
    pub fn key(&self) -> Value {
        self.key
            .borrow()
            .as_ref()
            .map_or(Value::Undefined, key_type_to_value)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbcursor-primarykey>
    pub fn primary_key(&self) -> Value {
        self.effective_key()
            .as_ref()
            .map_or(Value::Undefined, key_type_to_value)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbcursorwithvalue-value>
    /// Undefined for key cursors.
    pub fn value(&self) -> Value {
        self.value.borrow().clone()
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbcursor-request>
    pub fn request(&self) -> Option<Rc<IDBRequest>> {
        self.request.borrow().clone()
    }

    /// Whether this cursor exposes `value`, as an `IDBCursorWithValue` does.
    pub fn has_value(&self) -> bool {
        !self.key_only
    }
}
