/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::debug;

use crate::dom::bindings::error::{Error, Fallible};
use crate::dom::bindings::value::Value;
use crate::dom::event::{Event, EventBubbles, EventCancelable};
use crate::dom::eventtarget::EventTarget;
use crate::dom::globalscope::GlobalScope;
use crate::dom::idbcursor::IDBCursor;
use crate::dom::idbdatabase::IDBDatabase;
use crate::dom::idbindex::IDBIndex;
use crate::dom::idbobjectstore::IDBObjectStore;
use crate::dom::idbtransaction::IDBTransaction;
use crate::indexed_db::key_type_to_value;
use crate::indexeddb::operations::{AsyncOperation, OperationOutcome};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IDBRequestReadyState {
    Pending,
    Done,
}

/// <https://w3c.github.io/IndexedDB/#request-result>
#[derive(Clone, Default)]
pub enum IDBRequestResult {
    #[default]
    Undefined,
    Value(Value),
    Cursor(Rc<IDBCursor>),
    Database(Rc<IDBDatabase>),
}

impl IDBRequestResult {
    /// The result as a script value; cursors and connections have none.
    pub fn as_value(&self) -> Value {
        match self {
            IDBRequestResult::Value(value) => value.clone(),
            _ => Value::Undefined,
        }
    }

    pub fn as_cursor(&self) -> Option<Rc<IDBCursor>> {
        match self {
            IDBRequestResult::Cursor(cursor) => Some(cursor.clone()),
            _ => None,
        }
    }

    pub fn as_database(&self) -> Option<Rc<IDBDatabase>> {
        match self {
            IDBRequestResult::Database(database) => Some(database.clone()),
            _ => None,
        }
    }
}

/// <https://w3c.github.io/IndexedDB/#request-source>
#[derive(Clone)]
pub enum IDBRequestSource {
    ObjectStore(Rc<IDBObjectStore>),
    Index(Rc<IDBIndex>),
    Cursor(Rc<IDBCursor>),
}

impl IDBRequestSource {
    fn transaction(&self) -> Rc<IDBTransaction> {
        match self {
            IDBRequestSource::ObjectStore(store) => store.transaction(),
            IDBRequestSource::Index(index) => index.object_store().transaction(),
            IDBRequestSource::Cursor(cursor) => cursor.transaction(),
        }
    }
}

/// <https://w3c.github.io/IndexedDB/#request-api>
pub struct IDBRequest {
    eventtarget: EventTarget,
    global: Rc<GlobalScope>,
    result: RefCell<IDBRequestResult>,
    error: RefCell<Option<Error>>,
    source: RefCell<Option<IDBRequestSource>>,
    transaction: RefCell<Option<Rc<IDBTransaction>>>,
    ready_state: Cell<IDBRequestReadyState>,
}

impl IDBRequest {
    pub(crate) fn new_inherited(global: &Rc<GlobalScope>) -> IDBRequest {
        IDBRequest {
            eventtarget: EventTarget::new_inherited(),
            global: global.clone(),
            result: Default::default(),
            error: Default::default(),
            source: Default::default(),
            transaction: Default::default(),
            ready_state: Cell::new(IDBRequestReadyState::Pending),
        }
    }

    pub(crate) fn new(global: &Rc<GlobalScope>) -> Rc<IDBRequest> {
        Rc::new(IDBRequest::new_inherited(global))
    }

    pub fn upcast(&self) -> &EventTarget {
        &self.eventtarget
    }

    pub(crate) fn global(&self) -> &Rc<GlobalScope> {
        &self.global
    }

    pub(crate) fn set_result(&self, result: IDBRequestResult) {
        *self.result.borrow_mut() = result;
    }

    pub(crate) fn set_error(&self, error: Option<Error>) {
        *self.error.borrow_mut() = error;
    }

    pub(crate) fn set_transaction(&self, transaction: Option<Rc<IDBTransaction>>) {
        *self.transaction.borrow_mut() = transaction;
    }

    pub(crate) fn set_ready_state_done(&self) {
        self.ready_state.set(IDBRequestReadyState::Done);
    }

    /// <https://w3c.github.io/IndexedDB/#asynchronously-execute-a-request>
    pub(crate) fn execute_async(
        source: IDBRequestSource,
        operation: AsyncOperation,
        request: Option<Rc<IDBRequest>>,
        cursor: Option<Rc<IDBCursor>>,
    ) -> Fallible<Rc<IDBRequest>> {
        // Step 1: Let transaction be the transaction associated with source.
        let transaction = source.transaction();

        // Step 2: Assert: transaction's state is active.
        if !transaction.is_active() {
            return Err(Error::TransactionInactive);
        }

        // Step 3: If request was not given, let request be a new request with source as source.
        let request = request.unwrap_or_else(|| {
            let request = IDBRequest::new(transaction.global());
            *request.source.borrow_mut() = Some(source);
            request
        });
        request.set_transaction(Some(transaction.clone()));
        request.ready_state.set(IDBRequestReadyState::Pending);

        // Step 4: Add request to the end of transaction's request list.
        // Step 5: Run the operation once the transaction has started.
        transaction.add_request(&request, operation, cursor);

        // Step 6: Return request.
        Ok(request)
    }

    /// Delivers the outcome of an operation, in a database task.
    pub(crate) fn handle_outcome(
        self: &Rc<Self>,
        transaction: &Rc<IDBTransaction>,
        outcome: Fallible<OperationOutcome>,
        cursor: Option<Rc<IDBCursor>>,
    ) {
        // An aborted transaction already answered this request.
        if !transaction.take_request(self) {
            return debug!("Dropping the outcome of a request on an aborted transaction");
        }

        // Step 5.5.2: Set request's done flag to true.
        self.ready_state.set(IDBRequestReadyState::Done);

        match outcome {
            Ok(outcome) => {
                let result = match outcome {
                    OperationOutcome::Undefined => IDBRequestResult::Undefined,
                    OperationOutcome::Key(key) => IDBRequestResult::Value(key_type_to_value(&key)),
                    OperationOutcome::Value(value) => IDBRequestResult::Value(value),
                    OperationOutcome::Values(values) => {
                        IDBRequestResult::Value(Value::array(values))
                    },
                    OperationOutcome::Keys(keys) => IDBRequestResult::Value(Value::array(
                        keys.iter().map(key_type_to_value),
                    )),
                    OperationOutcome::Count(count) => {
                        IDBRequestResult::Value(Value::Number(count as f64))
                    },
                    OperationOutcome::Iteration(record) => match (record, cursor) {
                        (Some(record), Some(cursor)) => {
                            cursor.set_iteration_result(record);
                            IDBRequestResult::Cursor(cursor)
                        },
                        (None, Some(cursor)) => {
                            cursor.clear_iteration_result();
                            IDBRequestResult::Value(Value::Null)
                        },
                        (_, None) => IDBRequestResult::Value(Value::Null),
                    },
                };
                // Step 5.5.5: Set request's result to result.
                self.set_result(result);
                self.set_error(None);

                // Step 5.5.6: Fire a success event at request.
                self.fire_success(transaction);
            },
            Err(error) => {
                // Step 5.5.4: Set request's result to undefined, and its error to result.
                self.set_result(IDBRequestResult::Undefined);
                self.set_error(Some(error.clone()));

                // Step 5.5.4.3: Fire an error event at request.
                if self.fire_error(transaction) {
                    // https://w3c.github.io/IndexedDB/#fire-an-error-event
                    // Step 6: If canceled flag is false, abort transaction with the request's error.
                    transaction.abort_transaction(Some(error));
                }
            },
        }

        // If all requests are processed, the transaction may now commit.
        transaction.maybe_commit();
    }

    /// <https://w3c.github.io/IndexedDB/#fire-a-success-event>
    fn fire_success(&self, transaction: &Rc<IDBTransaction>) {
        let event = Event::new(
            "success",
            EventBubbles::DoesNotBubble,
            EventCancelable::NotCancelable,
        );
        transaction.set_active_for_dispatch(|| event.fire(self.upcast()));
    }

    /// <https://w3c.github.io/IndexedDB/#fire-an-error-event>
    ///
    /// Returns true if no listener canceled the event.
    fn fire_error(&self, transaction: &Rc<IDBTransaction>) -> bool {
        let event = Event::new("error", EventBubbles::Bubbles, EventCancelable::Cancelable);
        let database = transaction.db();
        transaction.set_active_for_dispatch(|| {
            event.dispatch(&[self.upcast(), transaction.upcast(), database.upcast()])
        })
    }

    /// <https://w3c.github.io/IndexedDB/#abort-a-transaction>
    /// Step 5: requests still in the transaction's request list fail with an
    /// "AbortError".
    pub(crate) fn abort_pending(&self, transaction: &Rc<IDBTransaction>) {
        self.ready_state.set(IDBRequestReadyState::Done);
        self.set_result(IDBRequestResult::Undefined);
        self.set_error(Some(Error::Abort));
        let event = Event::new("error", EventBubbles::Bubbles, EventCancelable::Cancelable);
        let database = transaction.db();
        event.dispatch(&[self.upcast(), transaction.upcast(), database.upcast()]);
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbrequest-result>
    pub fn result(&self) -> Fallible<IDBRequestResult> {
        if self.ready_state.get() == IDBRequestReadyState::Pending {
            return Err(Error::InvalidState);
        }
        Ok(self.result.borrow().clone())
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbrequest-error>
    pub fn error(&self) -> Fallible<Option<Error>> {
        if self.ready_state.get() == IDBRequestReadyState::Pending {
            return Err(Error::InvalidState);
        }
        Ok(self.error.borrow().clone())
    }

    pub fn source(&self) -> Option<IDBRequestSource> {
        self.source.borrow().clone()
    }

    pub fn transaction(&self) -> Option<Rc<IDBTransaction>> {
        self.transaction.borrow().clone()
    }

    pub fn ready_state(&self) -> IDBRequestReadyState {
        self.ready_state.get()
    }

    // https://w3c.github.io/IndexedDB/#dom-idbrequest-onsuccess
    event_handler!(success, get_onsuccess, set_onsuccess);

    // https://w3c.github.io/IndexedDB/#dom-idbrequest-onerror
    event_handler!(error, get_onerror, set_onerror);
}
