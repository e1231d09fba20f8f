/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::{debug, warn};
use storage_traits::indexeddb::{
    CreateObjectResult, DatabaseMeta, IndexedDBObjectStore, KeyPath,
};

use crate::dom::bindings::error::{Error, ErrorResult, Fallible, map_backend_error_to_dom_error};
use crate::dom::eventtarget::EventTarget;
use crate::dom::globalscope::GlobalScope;
use crate::dom::idbobjectstore::IDBObjectStore;
use crate::dom::idbtransaction::{IDBTransaction, IDBTransactionMode};
use crate::dom::idbversionchangeevent::IDBVersionChangeEvent;
use crate::indexed_db::is_valid_key_path;

/// <https://w3c.github.io/IndexedDB/#dictdef-idbobjectstoreparameters>
#[derive(Clone, Debug, Default)]
pub struct IDBObjectStoreParameters {
    pub key_path: Option<KeyPath>,
    pub auto_increment: bool,
}

/// <https://w3c.github.io/IndexedDB/#database-interface>
pub struct IDBDatabase {
    eventtarget: EventTarget,
    global: Rc<GlobalScope>,
    name: String,
    /// The connection id in the manager.
    id: u64,
    version: Cell<u64>,
    /// <https://w3c.github.io/IndexedDB/#connection-object-store-set>
    object_store_set: RefCell<DatabaseMeta>,

    upgrade_transaction: RefCell<Option<Rc<IDBTransaction>>>,
    /// Unfinished transactions created with `transaction()`.
    transactions: RefCell<Vec<Rc<IDBTransaction>>>,

    /// <https://w3c.github.io/IndexedDB/#connection-close-pending-flag>
    close_pending: Cell<bool>,
    /// Set once the manager forgot about this connection.
    closed: Cell<bool>,
}

impl IDBDatabase {
    pub(crate) fn new(global: &Rc<GlobalScope>, name: &str, id: u64, version: u64) -> Rc<IDBDatabase> {
        let database = Rc::new(IDBDatabase {
            eventtarget: EventTarget::new_inherited(),
            global: global.clone(),
            name: name.to_owned(),
            id,
            version: Cell::new(version),
            object_store_set: RefCell::new(DatabaseMeta::new(name)),
            upgrade_transaction: Default::default(),
            transactions: Default::default(),
            close_pending: Cell::new(false),
            closed: Cell::new(false),
        });
        database.refresh_object_store_set();
        database
    }

    pub fn upcast(&self) -> &EventTarget {
        &self.eventtarget
    }

    pub(crate) fn global(&self) -> &Rc<GlobalScope> {
        &self.global
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_close_pending(&self) -> bool {
        self.close_pending.get()
    }

    /// Reloads the schema, after an upgrade transaction changed or reverted it.
    pub(crate) fn refresh_object_store_set(&self) {
        match self.global.indexeddb_manager().metadata(&self.name) {
            Ok(meta) => *self.object_store_set.borrow_mut() = meta,
            Err(e) => warn!("Failed to load the schema of {}: {e}", self.name),
        }
    }

    pub(crate) fn object_store_meta(&self, name: &str) -> Option<IndexedDBObjectStore> {
        self.object_store_set.borrow().object_store(name).cloned()
    }

    pub(crate) fn object_store_exists(&self, name: &str) -> bool {
        self.object_store_set.borrow().object_stores.contains_key(name)
    }

    pub(crate) fn set_upgrade_transaction(&self, transaction: Option<Rc<IDBTransaction>>) {
        *self.upgrade_transaction.borrow_mut() = transaction;
    }

    /// The running upgrade transaction, required by every schema change.
    pub(crate) fn upgrade_transaction(&self) -> Fallible<Rc<IDBTransaction>> {
        self.upgrade_transaction
            .borrow()
            .clone()
            .filter(|transaction| !transaction.is_finished())
            .ok_or(Error::InvalidState)
    }

    /// <https://w3c.github.io/IndexedDB/#abort-an-upgrade-transaction>
    /// Step 3-4: Set connection's version to the previous version and its
    /// object store set to the set it had before.
    pub(crate) fn revert_upgrade(&self, old_version: u64) {
        self.version.set(old_version);
        self.refresh_object_store_set();
    }

    /// <https://w3c.github.io/IndexedDB/#eventdef-idbdatabase-versionchange>
    pub(crate) fn dispatch_versionchange(&self, old_version: u64, new_version: Option<u64>) {
        // A connection that is closing does not get versionchange.
        if self.close_pending.get() {
            return;
        }
        let event = IDBVersionChangeEvent::new("versionchange", old_version, new_version);
        event.fire(self.upcast());
    }

    pub(crate) fn transaction_finished(&self, transaction: &Rc<IDBTransaction>) {
        self.transactions
            .borrow_mut()
            .retain(|running| !Rc::ptr_eq(running, transaction));
        let is_upgrade = self
            .upgrade_transaction
            .borrow()
            .as_ref()
            .is_some_and(|upgrade| Rc::ptr_eq(upgrade, transaction));
        if is_upgrade {
            self.set_upgrade_transaction(None);
        }
        self.maybe_finish_close();
    }

    /// <https://w3c.github.io/IndexedDB/#close-a-database-connection>
    /// Step 2: Wait for all transactions created using connection to complete.
    /// Once they are complete, connection is closed.
    fn maybe_finish_close(&self) {
        if !self.close_pending.get() || self.closed.get() {
            return;
        }
        if !self.transactions.borrow().is_empty() || self.upgrade_transaction.borrow().is_some() {
            return;
        }
        debug!("Connection {} to {} closed", self.id, self.name);
        self.closed.set(true);
        self.global
            .indexeddb_manager()
            .close_database(&self.name, self.id);
    }

    /// The manager already dropped this connection.
    pub(crate) fn mark_closed(&self) {
        self.close_pending.set(true);
        self.closed.set(true);
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbdatabase-transaction>
    pub fn transaction(
        self: &Rc<Self>,
        store_names: &[&str],
        mode: IDBTransactionMode,
    ) -> Fallible<Rc<IDBTransaction>> {
        // Step 1: If a live upgrade transaction is associated with the connection,
        // throw an "InvalidStateError" DOMException.
        if self.upgrade_transaction().is_ok() {
            return Err(Error::InvalidState);
        }

        // Step 2: If this's close pending flag is true, then throw an "InvalidStateError" DOMException.
        if self.close_pending.get() {
            return Err(Error::InvalidState);
        }

        // Step 3: Let scope be the set of unique strings in storeNames if it is a
        // sequence, and a set containing one string equal to storeNames otherwise.
        let mut scope: Vec<String> = store_names.iter().map(|name| name.to_string()).collect();
        scope.sort();
        scope.dedup();

        // Step 4: If any string in scope is not the name of an object store in the
        // connected database, throw a "NotFoundError" DOMException.
        if scope.iter().any(|name| !self.object_store_exists(name)) {
            return Err(Error::NotFound);
        }

        // Step 5: If scope is empty, throw an "InvalidAccessError" DOMException.
        if scope.is_empty() {
            return Err(Error::InvalidAccess);
        }

        // Step 6: If mode is not "readonly" or "readwrite", throw a TypeError.
        if mode == IDBTransactionMode::Versionchange {
            return Err(Error::Type(
                "A versionchange transaction cannot be created manually".to_owned(),
            ));
        }

        // Step 7: Let transaction be a newly created transaction with this
        // connection, mode, options' durability member, and the set of object
        // stores named in scope.
        // Step 8: Set transaction's cleanup event loop to the current event loop.
        let transaction = IDBTransaction::new(self, mode, scope)?;
        self.transactions.borrow_mut().push(transaction.clone());

        // Step 9: Return an IDBTransaction object representing transaction.
        Ok(transaction)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbdatabase-createobjectstore>
    pub fn create_object_store(
        &self,
        name: &str,
        options: &IDBObjectStoreParameters,
    ) -> Fallible<Rc<IDBObjectStore>> {
        // Step 2: Let transaction be database's upgrade transaction if it is not
        // null, or throw an "InvalidStateError" DOMException otherwise.
        let transaction = self.upgrade_transaction()?;

        // Step 3: If transaction's state is not active, then throw a
        // "TransactionInactiveError" DOMException.
        if !transaction.is_active() {
            return Err(Error::TransactionInactive);
        }

        // Step 4-5: If keyPath is not null and is not a valid key path, throw a
        // "SyntaxError" DOMException.
        let key_path = options.key_path.as_ref();
        if key_path.is_some_and(|key_path| !is_valid_key_path(key_path)) {
            return Err(Error::Syntax);
        }

        // Step 6: If an object store named name already exists in database throw a
        // "ConstraintError" DOMException.
        if self.object_store_exists(name) {
            return Err(Error::Constraint);
        }

        // Step 7-8: If autoIncrement is true and keyPath is an empty string or any
        // sequence, throw an "InvalidAccessError" DOMException.
        if options.auto_increment {
            match key_path {
                Some(KeyPath::String(path)) if path.is_empty() => {
                    return Err(Error::InvalidAccess);
                },
                Some(KeyPath::Sequence(_)) => return Err(Error::InvalidAccess),
                _ => {},
            }
        }

        // Step 9: Let store be a new object store in database.
        let store = IndexedDBObjectStore {
            name: name.to_owned(),
            key_path: options.key_path.clone(),
            has_key_generator: options.auto_increment,
            indexes: Default::default(),
        };
        let created = self
            .global
            .indexeddb_manager()
            .with_transaction(&self.name, transaction.serial_number(), |backend| {
                backend.create_object_store(store.clone())
            })
            .and_then(|result| result)
            .map_err(map_backend_error_to_dom_error)?;
        if created == CreateObjectResult::AlreadyExists {
            return Err(Error::Constraint);
        }
        self.object_store_set
            .borrow_mut()
            .object_stores
            .insert(name.to_owned(), store);

        // Step 10: Return a new object store handle associated with store and transaction.
        Ok(transaction.object_store_handle(name))
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbdatabase-deleteobjectstore>
    pub fn delete_object_store(&self, name: &str) -> ErrorResult {
        // Step 1-2: Let transaction be database's upgrade transaction if it is not
        // null, or throw an "InvalidStateError" DOMException otherwise.
        let transaction = self.upgrade_transaction()?;

        // Step 3: If transaction's state is not active, then throw a
        // "TransactionInactiveError" DOMException.
        if !transaction.is_active() {
            return Err(Error::TransactionInactive);
        }

        // Step 4: Let store be the object store named name in database, or throw a
        // "NotFoundError" DOMException if none.
        if !self.object_store_exists(name) {
            return Err(Error::NotFound);
        }

        // Step 5: Remove store from this's object store set.
        self.object_store_set.borrow_mut().object_stores.remove(name);

        // Step 6: If there is an object store handle associated with store and
        // transaction, remove all entries from its index set.
        transaction.forget_object_store_handle(name);

        // Step 7: Destroy store.
        self.global
            .indexeddb_manager()
            .with_transaction(&self.name, transaction.serial_number(), |backend| {
                backend.delete_object_store(name)
            })
            .and_then(|result| result)
            .map_err(map_backend_error_to_dom_error)
    }

    /// Renames an object store of the running upgrade transaction.
    pub(crate) fn rename_object_store(&self, name: &str, new_name: &str) -> ErrorResult {
        let transaction = self.upgrade_transaction()?;
        self.global
            .indexeddb_manager()
            .with_transaction(&self.name, transaction.serial_number(), |backend| {
                backend.rename_object_store(name, new_name)
            })
            .and_then(|result| result)
            .map_err(map_backend_error_to_dom_error)?;
        let mut object_store_set = self.object_store_set.borrow_mut();
        if let Some(mut store) = object_store_set.object_stores.remove(name) {
            store.name = new_name.to_owned();
            object_store_set
                .object_stores
                .insert(new_name.to_owned(), store);
        }
        Ok(())
    }

    /// Replaces the cached schema of one object store.
    pub(crate) fn update_object_store_meta(&self, store: IndexedDBObjectStore) {
        self.object_store_set
            .borrow_mut()
            .object_stores
            .insert(store.name.clone(), store);
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbdatabase-name>
    pub fn name(&self) -> &str {
        &self.name
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbdatabase-version>
    pub fn version(&self) -> u64 {
        self.version.get()
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbdatabase-objectstorenames>
    pub fn object_store_names(&self) -> Vec<String> {
        self.object_store_set.borrow().object_store_names()
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbdatabase-close>
    pub fn close(&self) {
        // Step 1: Run close a database connection with this connection.

        // <https://w3c.github.io/IndexedDB/#close-a-database-connection>
        // Step 1: Set connection's close pending flag to true.
        if self.close_pending.replace(true) {
            return;
        }
        self.global
            .indexeddb_manager()
            .close_pending(&self.name, self.id);

        // Step 2: Wait for all transactions created using connection to complete.
        self.maybe_finish_close();
    }

    // https://w3c.github.io/IndexedDB/#dom-idbdatabase-onabort
    event_handler!(abort, get_onabort, set_onabort);

    // https://w3c.github.io/IndexedDB/#dom-idbdatabase-onclose
    event_handler!(close, get_onclose, set_onclose);

    // https://w3c.github.io/IndexedDB/#dom-idbdatabase-onerror
    event_handler!(error, get_onerror, set_onerror);

    // https://w3c.github.io/IndexedDB/#dom-idbdatabase-onversionchange
    event_handler!(versionchange, get_onversionchange, set_onversionchange);
}
