/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use log::{debug, warn};
use rustc_hash::FxHashMap;
use storage_traits::indexeddb::{BackendResult, IndexedDBTxnMode};

use crate::dom::bindings::error::{Error, ErrorResult, Fallible, map_backend_error_to_dom_error};
use crate::dom::event::{Event, EventBubbles, EventCancelable};
use crate::dom::eventtarget::EventTarget;
use crate::dom::globalscope::GlobalScope;
use crate::dom::idbcursor::IDBCursor;
use crate::dom::idbdatabase::IDBDatabase;
use crate::dom::idbobjectstore::IDBObjectStore;
use crate::dom::idbopendbrequest::IDBOpenDBRequest;
use crate::dom::idbrequest::IDBRequest;
use crate::event_loop::TaskSourceName;
use crate::indexeddb::operations::{self, AsyncOperation};

/// <https://w3c.github.io/IndexedDB/#enumdef-idbtransactionmode>
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IDBTransactionMode {
    Readonly,
    Readwrite,
    Versionchange,
}

impl From<IDBTransactionMode> for IndexedDBTxnMode {
    fn from(mode: IDBTransactionMode) -> IndexedDBTxnMode {
        match mode {
            IDBTransactionMode::Readonly => IndexedDBTxnMode::Readonly,
            IDBTransactionMode::Readwrite => IndexedDBTxnMode::Readwrite,
            IDBTransactionMode::Versionchange => IndexedDBTxnMode::Versionchange,
        }
    }
}

/// <https://w3c.github.io/IndexedDB/#transaction-lifecycle>
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TransactionState {
    Active,
    Inactive,
    Committing,
    Finished,
}

type QueuedOperation = (Rc<IDBRequest>, AsyncOperation, Option<Rc<IDBCursor>>);

/// <https://w3c.github.io/IndexedDB/#transaction>
pub struct IDBTransaction {
    eventtarget: EventTarget,
    global: Rc<GlobalScope>,
    db: Rc<IDBDatabase>,
    mode: IDBTransactionMode,
    /// Object store names, sorted. Empty for upgrade transactions, whose scope
    /// is the whole database.
    scope: Vec<String>,
    serial_number: Cell<u64>,
    state: Cell<TransactionState>,
    /// Set once the scheduler started the backend transaction.
    started: Cell<bool>,

    /// <https://w3c.github.io/IndexedDB/#transaction-request-list>
    requests: RefCell<Vec<Rc<IDBRequest>>>,
    /// Operations waiting for the transaction to start.
    queued_operations: RefCell<VecDeque<QueuedOperation>>,

    /// <https://w3c.github.io/IndexedDB/#transaction-error>
    error: RefCell<Option<Error>>,

    /// The object store handles returned by `objectStore()`, by name.
    store_handles: RefCell<FxHashMap<String, Rc<IDBObjectStore>>>,

    /// The open request of an upgrade transaction.
    open_request: RefCell<Option<Rc<IDBOpenDBRequest>>>,
    /// The database version before an upgrade transaction.
    upgrade_old_version: Option<u64>,
}

impl IDBTransaction {
    fn new_inherited(
        db: &Rc<IDBDatabase>,
        mode: IDBTransactionMode,
        scope: Vec<String>,
        upgrade_old_version: Option<u64>,
    ) -> IDBTransaction {
        IDBTransaction {
            eventtarget: EventTarget::new_inherited(),
            global: db.global().clone(),
            db: db.clone(),
            mode,
            scope,
            serial_number: Cell::new(0),
            state: Cell::new(TransactionState::Active),
            started: Cell::new(false),
            requests: Default::default(),
            queued_operations: Default::default(),
            error: Default::default(),
            store_handles: Default::default(),
            open_request: Default::default(),
            upgrade_old_version,
        }
    }

    /// Creates a transaction and hands it to the scheduler. It is active until
    /// the end of the current task.
    pub(crate) fn new(
        db: &Rc<IDBDatabase>,
        mode: IDBTransactionMode,
        scope: Vec<String>,
    ) -> Fallible<Rc<IDBTransaction>> {
        let transaction = Rc::new(IDBTransaction::new_inherited(db, mode, scope.clone(), None));

        let weak: Weak<IDBTransaction> = Rc::downgrade(&transaction);
        let serial_number = db
            .global()
            .indexeddb_manager()
            .register_transaction(
                db.name(),
                mode.into(),
                scope,
                Box::new(move |result| {
                    if let Some(transaction) = weak.upgrade() {
                        transaction.start(result);
                    }
                }),
            )
            .map_err(map_backend_error_to_dom_error)?;
        transaction.serial_number.set(serial_number);

        // https://html.spec.whatwg.org/multipage/#perform-a-microtask-checkpoint
        // Step 6: Cleanup Indexed Database transactions.
        let cleanup = transaction.clone();
        db.global().event_loop().register_transaction_cleanup(move || {
            if cleanup.state.get() == TransactionState::Active {
                cleanup.state.set(TransactionState::Inactive);
            }
            cleanup.maybe_commit();
        });

        debug!(
            "Created {mode:?} transaction {serial_number} on {}",
            db.name()
        );
        Ok(transaction)
    }

    /// <https://w3c.github.io/IndexedDB/#upgrade-transaction>
    /// The manager already started the backend transaction.
    pub(crate) fn new_upgrade(
        db: &Rc<IDBDatabase>,
        serial_number: u64,
        old_version: u64,
        open_request: &Rc<IDBOpenDBRequest>,
    ) -> Rc<IDBTransaction> {
        let transaction = IDBTransaction::new_inherited(
            db,
            IDBTransactionMode::Versionchange,
            vec![],
            Some(old_version),
        );
        transaction.serial_number.set(serial_number);
        transaction.started.set(true);
        // Step 10.5: Set transaction's state to inactive; it is only active
        // while upgradeneeded is dispatched.
        transaction.state.set(TransactionState::Inactive);
        *transaction.open_request.borrow_mut() = Some(open_request.clone());
        Rc::new(transaction)
    }

    pub fn upcast(&self) -> &EventTarget {
        &self.eventtarget
    }

    pub(crate) fn global(&self) -> &Rc<GlobalScope> {
        &self.global
    }

    pub(crate) fn serial_number(&self) -> u64 {
        self.serial_number.get()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.get() == TransactionState::Active
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.get() == TransactionState::Finished
    }

    fn is_upgrade(&self) -> bool {
        self.mode == IDBTransactionMode::Versionchange
    }

    /// Runs `dispatch` with the transaction active, restoring the previous
    /// state afterwards unless a listener finished or committed it.
    pub(crate) fn set_active_for_dispatch<R>(&self, dispatch: impl FnOnce() -> R) -> R {
        let was_inactive = self.state.get() == TransactionState::Inactive;
        if was_inactive {
            self.state.set(TransactionState::Active);
        }
        let result = dispatch();
        if was_inactive && self.state.get() == TransactionState::Active {
            self.state.set(TransactionState::Inactive);
        }
        result
    }

    /// Returns the cached handle for `name`, creating it on first use.
    pub(crate) fn object_store_handle(self: &Rc<Self>, name: &str) -> Rc<IDBObjectStore> {
        self.store_handles
            .borrow_mut()
            .entry(name.to_owned())
            .or_insert_with(|| IDBObjectStore::new(self, name))
            .clone()
    }

    pub(crate) fn rename_object_store_handle(&self, name: &str, new_name: &str) {
        let mut handles = self.store_handles.borrow_mut();
        if let Some(handle) = handles.remove(name) {
            handles.insert(new_name.to_owned(), handle);
        }
    }

    pub(crate) fn forget_object_store_handle(&self, name: &str) {
        let handle = self.store_handles.borrow_mut().remove(name);
        if let Some(handle) = handle {
            handle.mark_deleted();
        }
    }

    /// Appends `request` to the request list, running its operation now if the
    /// transaction already started.
    pub(crate) fn add_request(
        self: &Rc<Self>,
        request: &Rc<IDBRequest>,
        operation: AsyncOperation,
        cursor: Option<Rc<IDBCursor>>,
    ) {
        self.requests.borrow_mut().push(request.clone());
        if self.started.get() {
            self.run_operation(request.clone(), operation, cursor);
        } else {
            self.queued_operations
                .borrow_mut()
                .push_back((request.clone(), operation, cursor));
        }
    }

    /// Runs the operation against the backend; the outcome is delivered in a
    /// database task, in request order.
    fn run_operation(
        self: &Rc<Self>,
        request: Rc<IDBRequest>,
        operation: AsyncOperation,
        cursor: Option<Rc<IDBCursor>>,
    ) {
        let outcome = self
            .global
            .indexeddb_manager()
            .with_transaction(self.db.name(), self.serial_number(), |backend| {
                operations::execute(operation, backend)
            })
            .map_err(map_backend_error_to_dom_error)
            .and_then(|outcome| outcome);

        let transaction = self.clone();
        self.global
            .event_loop()
            .queue_task(TaskSourceName::DatabaseAccess, move || {
                request.handle_outcome(&transaction, outcome, cursor)
            });
    }

    /// Removes a request whose outcome is being delivered. Returns false if the
    /// request is no longer in the list.
    pub(crate) fn take_request(&self, request: &Rc<IDBRequest>) -> bool {
        let mut requests = self.requests.borrow_mut();
        match requests.iter().position(|pending| Rc::ptr_eq(pending, request)) {
            Some(position) => {
                requests.remove(position);
                true
            },
            None => false,
        }
    }

    /// <https://w3c.github.io/IndexedDB/#transaction-start>
    fn start(self: &Rc<Self>, result: BackendResult<()>) {
        if let Err(error) = result {
            warn!("Transaction {} failed to start: {error}", self.serial_number());
            return self.abort_transaction(Some(map_backend_error_to_dom_error(error)));
        }
        if self.is_finished() {
            return;
        }
        self.started.set(true);
        loop {
            let Some((request, operation, cursor)) = self.queued_operations.borrow_mut().pop_front()
            else {
                break;
            };
            self.run_operation(request, operation, cursor);
        }
        self.maybe_commit();
    }

    /// <https://w3c.github.io/IndexedDB/#transaction-lifecycle>
    /// An inactive transaction commits once every request it made has been
    /// delivered, unless new ones were made in the meantime.
    pub(crate) fn maybe_commit(self: &Rc<Self>) {
        let can_commit = matches!(
            self.state.get(),
            TransactionState::Inactive | TransactionState::Committing
        );
        if !can_commit || !self.started.get() {
            return;
        }
        if !self.requests.borrow().is_empty() || !self.queued_operations.borrow().is_empty() {
            return;
        }
        self.commit_transaction();
    }

    /// <https://w3c.github.io/IndexedDB/#commit-a-transaction>
    fn commit_transaction(self: &Rc<Self>) {
        // Step 1: Set transaction's state to committing.
        self.state.set(TransactionState::Committing);

        // Step 2.1-2.3: Attempt to write any outstanding changes to the backing
        // store; on failure run abort a transaction with the error.
        let committed = self
            .global
            .indexeddb_manager()
            .commit_transaction(self.db.name(), self.serial_number());
        if let Err(error) = committed {
            warn!("Failed to commit transaction {}: {error}", self.serial_number());
            return self.abort_transaction(Some(map_backend_error_to_dom_error(error)));
        }

        // Step 2.4.2: Set transaction's state to finished.
        self.state.set(TransactionState::Finished);

        // Step 2.4: Queue a database task to fire complete at transaction.
        let this = self.clone();
        self.global
            .event_loop()
            .queue_task(TaskSourceName::DatabaseAccess, move || {
                let event = Event::new(
                    "complete",
                    EventBubbles::DoesNotBubble,
                    EventCancelable::NotCancelable,
                );
                event.fire(this.upcast());
                this.finished();
                if this.is_upgrade() {
                    // https://w3c.github.io/IndexedDB/#upgrade-a-database
                    // Step 11: Wait for transaction to finish, then hand the
                    // connection to the open request.
                    this.open_request.borrow_mut().take();
                    this.global
                        .indexeddb_manager()
                        .upgrade_finished(this.db.name(), this.db.id());
                }
            });
    }

    fn finished(self: &Rc<Self>) {
        self.db.transaction_finished(self);
        self.store_handles.borrow_mut().clear();
    }

    /// <https://w3c.github.io/IndexedDB/#abort-a-transaction>
    pub(crate) fn abort_transaction(self: &Rc<Self>, error: Option<Error>) {
        if self.is_finished() {
            return;
        }
        debug!(
            "Aborting transaction {} with {:?}",
            self.serial_number(),
            error.as_ref().map(Error::name)
        );

        // Step 1: All the changes made to the database by the transaction are
        // reverted.
        if let Err(e) = self
            .global
            .indexeddb_manager()
            .abort_transaction(self.db.name(), self.serial_number())
        {
            warn!(
                "Failed to revert transaction {} on {}: {e}",
                self.serial_number(),
                self.db.name()
            );
        }

        // Step 2: If transaction is an upgrade transaction, run abort an
        // upgrade transaction with transaction.
        if let Some(old_version) = self.upgrade_old_version {
            self.db.revert_upgrade(old_version);
        }

        // Step 3: Set transaction's state to finished.
        self.state.set(TransactionState::Finished);

        // Step 4: Set transaction's error to error.
        *self.error.borrow_mut() = error;

        // Step 5: For each request of transaction's request list, abort the
        // steps to asynchronously execute a request and queue a database task
        // to fire an error event with an "AbortError".
        self.queued_operations.borrow_mut().clear();
        let requests = std::mem::take(&mut *self.requests.borrow_mut());
        for request in requests {
            let transaction = self.clone();
            self.global
                .event_loop()
                .queue_task(TaskSourceName::DatabaseAccess, move || {
                    request.abort_pending(&transaction)
                });
        }

        // Step 6: Queue a database task to fire abort at transaction, with its
        // bubbles attribute initialized to true.
        let this = self.clone();
        self.global
            .event_loop()
            .queue_task(TaskSourceName::DatabaseAccess, move || {
                let event = Event::new(
                    "abort",
                    EventBubbles::Bubbles,
                    EventCancelable::NotCancelable,
                );
                event.dispatch(&[this.upcast(), this.db.upcast()]);
                this.finished();

                // https://w3c.github.io/IndexedDB/#abort-an-upgrade-transaction
                // Step 6: The open request fails with an "AbortError".
                if this.is_upgrade() {
                    this.open_request.borrow_mut().take();
                    this.global
                        .indexeddb_manager()
                        .abort_pending_upgrade(this.db.name(), this.db.id());
                }
            });
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbtransaction-objectstorenames>
    pub fn object_store_names(&self) -> Vec<String> {
        if self.is_upgrade() {
            return self.db.object_store_names();
        }
        self.scope.clone()
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbtransaction-mode>
    pub fn mode(&self) -> IDBTransactionMode {
        self.mode
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbtransaction-db>
    pub fn db(&self) -> Rc<IDBDatabase> {
        self.db.clone()
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbtransaction-error>
    pub fn error(&self) -> Option<Error> {
        self.error.borrow().clone()
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbtransaction-objectstore>
    pub fn object_store(self: &Rc<Self>, name: &str) -> Fallible<Rc<IDBObjectStore>> {
        // Step 1: If transaction's state is finished, then throw an
        // "InvalidStateError" DOMException.
        if self.is_finished() {
            return Err(Error::InvalidState);
        }

        // Step 2: Let store be the object store named name in this's scope, or
        // throw a "NotFoundError" DOMException if none.
        let in_scope = if self.is_upgrade() {
            self.db.object_store_exists(name)
        } else {
            self.scope.iter().any(|store| store == name) && self.db.object_store_exists(name)
        };
        if !in_scope {
            return Err(Error::NotFound);
        }

        // Step 3: Return an object store handle associated with store and this.
        Ok(self.object_store_handle(name))
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbtransaction-commit>
    pub fn commit(self: &Rc<Self>) -> ErrorResult {
        // Step 1: If this's state is finished, then throw an "InvalidStateError" DOMException.
        if self.is_finished() {
            return Err(Error::InvalidState);
        }

        // Step 2: If this's state is not active, then throw a
        // "TransactionInactiveError" DOMException.
        if !self.is_active() {
            return Err(Error::TransactionInactive);
        }

        // Step 3: Run commit a transaction with this once its requests are done.
        self.state.set(TransactionState::Committing);
        self.maybe_commit();
        Ok(())
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbtransaction-abort>
    pub fn abort(self: &Rc<Self>) -> ErrorResult {
        // Step 1: If this's state is committing or finished, then throw an
        // "InvalidStateError" DOMException.
        if matches!(
            self.state.get(),
            TransactionState::Committing | TransactionState::Finished
        ) {
            return Err(Error::InvalidState);
        }

        // Step 2: Set this's state to inactive and run abort a transaction with
        // this and null.
        self.state.set(TransactionState::Inactive);
        self.abort_transaction(None);
        Ok(())
    }

    // https://w3c.github.io/IndexedDB/#dom-idbtransaction-onabort
    event_handler!(abort, get_onabort, set_onabort);

    // https://w3c.github.io/IndexedDB/#dom-idbtransaction-oncomplete
    event_handler!(complete, get_oncomplete, set_oncomplete);

    // https://w3c.github.io/IndexedDB/#dom-idbtransaction-onerror
    event_handler!(error, get_onerror, set_onerror);
}
