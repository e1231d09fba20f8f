/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use storage_traits::indexeddb::{IndexedDBIndex, KeyPath};

use crate::dom::bindings::error::{Error, ErrorResult, Fallible};
use crate::dom::idbcursor::{IDBCursor, IDBCursorDirection, IDBCursorSource};
use crate::dom::idbobjectstore::IDBObjectStore;
use crate::dom::idbrequest::{IDBRequest, IDBRequestSource};
use crate::dom::idbtransaction::IDBTransactionMode;
use crate::indexed_db::{KeyOrKeyRange, convert_value_to_key_range};
use crate::indexeddb::operations::{AsyncOperation, AsyncReadOnlyOperation, Source};

/// <https://w3c.github.io/IndexedDB/#index-handle-construct>
pub struct IDBIndex {
    object_store: Rc<IDBObjectStore>,
    name: RefCell<String>,
    deleted: Cell<bool>,
}

impl IDBIndex {
    pub(crate) fn new(object_store: &Rc<IDBObjectStore>, name: &str) -> Rc<IDBIndex> {
        Rc::new(IDBIndex {
            object_store: object_store.clone(),
            name: RefCell::new(name.to_owned()),
            deleted: Cell::new(false),
        })
    }

    fn meta(&self) -> Fallible<IndexedDBIndex> {
        self.object_store
            .meta()?
            .index(&self.name.borrow())
            .cloned()
            .ok_or(Error::InvalidState)
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.get() || self.object_store.is_deleted() || self.meta().is_err()
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.set(true);
    }

    fn source(&self) -> Source {
        Source {
            store: self.object_store.name(),
            index: Some(self.name()),
        }
    }

    /// Step 3-4 of every read: the index must exist and its transaction be active.
    fn check_readable(&self) -> ErrorResult {
        // If index or index's object store has been deleted, throw an "InvalidStateError" DOMException.
        if self.is_deleted() {
            return Err(Error::InvalidState);
        }
        // If transaction's state is not active, then throw a "TransactionInactiveError" DOMException.
        if !self.object_store.transaction().is_active() {
            return Err(Error::TransactionInactive);
        }
        Ok(())
    }

    fn execute(self: &Rc<Self>, operation: AsyncReadOnlyOperation) -> Fallible<Rc<IDBRequest>> {
        IDBRequest::execute_async(
            IDBRequestSource::Index(self.clone()),
            AsyncOperation::ReadOnly(operation),
            None,
            None,
        )
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbindex-get>
    pub fn get(self: &Rc<Self>, query: &KeyOrKeyRange) -> Fallible<Rc<IDBRequest>> {
        self.check_readable()?;
        // Step 5: Let range be the result of converting a value to a key range
        // with query and true. Rethrow any exceptions.
        let key_range = convert_value_to_key_range(Some(query), Some(true))?;
        // Step 6-7: Retrieve a referenced value from an index.
        self.execute(AsyncReadOnlyOperation::GetItem {
            source: self.source(),
            key_range,
        })
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbindex-getkey>
    pub fn get_key(self: &Rc<Self>, query: &KeyOrKeyRange) -> Fallible<Rc<IDBRequest>> {
        self.check_readable()?;
        let key_range = convert_value_to_key_range(Some(query), Some(true))?;
        self.execute(AsyncReadOnlyOperation::GetKey {
            source: self.source(),
            key_range,
        })
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbindex-getall>
    pub fn get_all(
        self: &Rc<Self>,
        query: Option<&KeyOrKeyRange>,
        count: Option<u32>,
    ) -> Fallible<Rc<IDBRequest>> {
        self.check_readable()?;
        let key_range = convert_value_to_key_range(query, None)?;
        self.execute(AsyncReadOnlyOperation::GetAllItems {
            source: self.source(),
            key_range,
            count: count.filter(|count| *count > 0),
        })
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbindex-getallkeys>
    pub fn get_all_keys(
        self: &Rc<Self>,
        query: Option<&KeyOrKeyRange>,
        count: Option<u32>,
    ) -> Fallible<Rc<IDBRequest>> {
        self.check_readable()?;
        let key_range = convert_value_to_key_range(query, None)?;
        self.execute(AsyncReadOnlyOperation::GetAllKeys {
            source: self.source(),
            key_range,
            count: count.filter(|count| *count > 0),
        })
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbindex-count>
    pub fn count(self: &Rc<Self>, query: Option<&KeyOrKeyRange>) -> Fallible<Rc<IDBRequest>> {
        self.check_readable()?;
        let key_range = convert_value_to_key_range(query, None)?;
        self.execute(AsyncReadOnlyOperation::Count {
            source: self.source(),
            key_range,
        })
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbindex-opencursor>
    pub fn open_cursor(
        self: &Rc<Self>,
        query: Option<&KeyOrKeyRange>,
        direction: IDBCursorDirection,
    ) -> Fallible<Rc<IDBRequest>> {
        self.check_readable()?;
        let range = convert_value_to_key_range(query, None)?;
        IDBCursor::open(IDBCursorSource::Index(self.clone()), range, direction, false)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbindex-openkeycursor>
    pub fn open_key_cursor(
        self: &Rc<Self>,
        query: Option<&KeyOrKeyRange>,
        direction: IDBCursorDirection,
    ) -> Fallible<Rc<IDBRequest>> {
        self.check_readable()?;
        let range = convert_value_to_key_range(query, None)?;
        IDBCursor::open(IDBCursorSource::Index(self.clone()), range, direction, true)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbindex-name>
    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbindex-name>
    pub fn set_name(&self, value: &str) -> ErrorResult {
        // Step 2-3: If transaction is not an upgrade transaction, throw an
        // "InvalidStateError" DOMException.
        let transaction = self.object_store.transaction();
        if transaction.mode() != IDBTransactionMode::Versionchange {
            return Err(Error::InvalidState);
        }

        // Step 4: If transaction's state is not active, then throw a
        // "TransactionInactiveError" DOMException.
        if !transaction.is_active() {
            return Err(Error::TransactionInactive);
        }

        // Step 5: If index or index's object store has been deleted, throw an
        // "InvalidStateError" DOMException.
        if self.is_deleted() {
            return Err(Error::InvalidState);
        }

        // Step 6: If index's name is equal to name, terminate these steps.
        let name = self.name();
        if name == value {
            return Ok(());
        }

        // Step 7: If an index named name already exists in index's object store,
        // throw a "ConstraintError" DOMException.
        // Step 8-9: Set index's name and this's name to name.
        self.object_store.rename_index(&name, value)?;
        *self.name.borrow_mut() = value.to_owned();
        Ok(())
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbindex-objectstore>
    pub fn object_store(&self) -> Rc<IDBObjectStore> {
        self.object_store.clone()
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbindex-keypath>
    pub fn key_path(&self) -> Option<KeyPath> {
        self.meta().ok().map(|index| index.key_path)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbindex-multientry>
    pub fn multi_entry(&self) -> bool {
        self.meta().is_ok_and(|index| index.multi_entry)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbindex-unique>
    pub fn unique(&self) -> bool {
        self.meta().is_ok_and(|index| index.unique)
    }
}
