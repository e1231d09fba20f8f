/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::RefCell;
use std::ops::Deref;
use std::rc::Rc;

use log::debug;

use crate::dom::bindings::error::{Error, map_backend_error_to_dom_error};
use crate::dom::event::{Event, EventBubbles, EventCancelable};
use crate::dom::globalscope::GlobalScope;
use crate::dom::idbdatabase::IDBDatabase;
use crate::dom::idbrequest::{IDBRequest, IDBRequestResult};
use crate::dom::idbtransaction::IDBTransaction;
use crate::dom::idbversionchangeevent::IDBVersionChangeEvent;
use crate::indexeddb::{ConnectionCallback, ConnectionMsg, DeleteCallback, DeleteMsg};

/// <https://w3c.github.io/IndexedDB/#idbopendbrequest>
pub struct IDBOpenDBRequest {
    idbrequest: IDBRequest,
    name: String,
    /// The connection this request produced, which also receives
    /// `versionchange` events routed through this request.
    connection: RefCell<Option<Rc<IDBDatabase>>>,
}

impl Deref for IDBOpenDBRequest {
    type Target = IDBRequest;

    fn deref(&self) -> &IDBRequest {
        &self.idbrequest
    }
}

impl IDBOpenDBRequest {
    pub(crate) fn new(global: &Rc<GlobalScope>, name: &str) -> Rc<IDBOpenDBRequest> {
        Rc::new(IDBOpenDBRequest {
            idbrequest: IDBRequest::new_inherited(global),
            name: name.to_owned(),
            connection: Default::default(),
        })
    }

    /// <https://w3c.github.io/IndexedDB/#open-a-database-connection>
    pub(crate) fn open_database(self: &Rc<Self>, version: Option<u64>) {
        let this = self.clone();
        let sender: ConnectionCallback = Rc::new(move |message| this.handle_connection_msg(message));
        let id = self
            .global()
            .indexeddb_manager()
            .open_a_database_connection(sender, &self.name, version);
        debug!("Opening {} as connection {id}", self.name);
    }

    /// <https://w3c.github.io/IndexedDB/#delete-a-database>
    pub(crate) fn delete_database(self: &Rc<Self>) {
        let this = self.clone();
        let sender: DeleteCallback = Rc::new(move |message| this.handle_delete_msg(message));
        self.global()
            .indexeddb_manager()
            .delete_database(sender, &self.name);
    }

    fn handle_connection_msg(self: &Rc<Self>, message: ConnectionMsg) {
        match message {
            ConnectionMsg::Connection {
                id,
                version,
                upgraded,
            } => self.dispatch_success(id, version, upgraded),
            ConnectionMsg::Upgrade {
                id,
                old_version,
                version,
                transaction,
            } => self.upgrade_needed(id, old_version, version, transaction),
            ConnectionMsg::VersionError { .. } => self.dispatch_error(Error::Version),
            ConnectionMsg::AbortError { .. } => {
                // https://w3c.github.io/IndexedDB/#abort-an-upgrade-transaction
                if let Some(connection) = self.connection.borrow_mut().take() {
                    connection.mark_closed();
                }
                self.set_transaction(None);
                self.dispatch_error(Error::Abort);
            },
            ConnectionMsg::DatabaseError { error, .. } => {
                self.dispatch_error(map_backend_error_to_dom_error(error))
            },
            ConnectionMsg::Blocked {
                old_version,
                version,
                ..
            } => {
                let event = IDBVersionChangeEvent::new("blocked", old_version, Some(version));
                event.fire(self.upcast());
            },
            ConnectionMsg::VersionChange {
                id,
                old_version,
                version,
            } => {
                let connection = self.connection.borrow().clone();
                match connection {
                    Some(connection) if connection.id() == id => {
                        connection.dispatch_versionchange(old_version, version)
                    },
                    _ => debug!("Connection {id} is gone before versionchange"),
                }
                self.global()
                    .indexeddb_manager()
                    .notify_end_of_version_change(&self.name, id);
            },
        }
    }

    fn handle_delete_msg(&self, message: DeleteMsg) {
        match message {
            DeleteMsg::Blocked { old_version } => {
                let event = IDBVersionChangeEvent::new("blocked", old_version, None);
                event.fire(self.upcast());
            },
            DeleteMsg::Done(Ok(old_version)) => {
                // https://w3c.github.io/IndexedDB/#dom-idbfactory-deletedatabase
                // Step 4.3: Set request's result to undefined and fire a version
                // change event named success with oldVersion and null.
                self.set_result(IDBRequestResult::Undefined);
                self.set_ready_state_done();
                let event = IDBVersionChangeEvent::new("success", old_version, None);
                event.fire(self.upcast());
            },
            DeleteMsg::Done(Err(error)) => {
                self.dispatch_error(map_backend_error_to_dom_error(error))
            },
        }
    }

    /// <https://w3c.github.io/IndexedDB/#upgrade-a-database>
    fn upgrade_needed(self: &Rc<Self>, id: u64, old_version: u64, version: u64, serial_number: u64) {
        // Step 1: Let db be connection's database.
        let connection = IDBDatabase::new(self.global(), &self.name, id, version);
        *self.connection.borrow_mut() = Some(connection.clone());

        // Step 2: Let transaction be a new upgrade transaction with connection used as connection.
        let transaction = IDBTransaction::new_upgrade(&connection, serial_number, old_version, self);
        connection.set_upgrade_transaction(Some(transaction.clone()));

        // Step 10.1: Set request's result to connection.
        self.set_result(IDBRequestResult::Database(connection));
        // Step 10.2: Set request's transaction to transaction.
        self.set_transaction(Some(transaction.clone()));
        // Step 10.3: Set request's done flag to true.
        self.set_ready_state_done();

        // Step 10.4-10.6: Fire a version change event named upgradeneeded with
        // old version and version, with the transaction active.
        let event = IDBVersionChangeEvent::new("upgradeneeded", old_version, Some(version));
        transaction.set_active_for_dispatch(|| event.fire(self.upcast()));

        // Step 11: Wait for transaction to finish.
        transaction.maybe_commit();
    }

    /// Fires `success` once the connection is ready, after the upgrade
    /// transaction's `complete` if there was one.
    fn dispatch_success(&self, id: u64, version: u64, upgraded: bool) {
        let connection = if upgraded {
            let Some(connection) = self.connection.borrow().clone() else {
                return debug_assert!(false, "An upgraded connection should exist.");
            };
            self.set_transaction(None);

            // https://w3c.github.io/IndexedDB/#open-a-database-connection
            // Step 10.6: If connection was closed, return a newly created
            // "AbortError" DOMException and abort these steps.
            if connection.is_close_pending() {
                self.connection.borrow_mut().take();
                return self.dispatch_error(Error::Abort);
            }
            connection
        } else {
            let connection = IDBDatabase::new(self.global(), &self.name, id, version);
            *self.connection.borrow_mut() = Some(connection.clone());
            connection
        };

        self.set_result(IDBRequestResult::Database(connection));
        self.set_error(None);
        self.set_ready_state_done();
        let event = Event::new(
            "success",
            EventBubbles::DoesNotBubble,
            EventCancelable::NotCancelable,
        );
        event.fire(self.upcast());
    }

    fn dispatch_error(&self, error: Error) {
        self.set_result(IDBRequestResult::Undefined);
        self.set_error(Some(error));
        self.set_ready_state_done();
        let event = Event::new("error", EventBubbles::Bubbles, EventCancelable::Cancelable);
        event.fire(self.upcast());
    }

    // https://w3c.github.io/IndexedDB/#dom-idbopendbrequest-onblocked
    event_handler!(blocked, get_onblocked, set_onblocked);

    // https://w3c.github.io/IndexedDB/#dom-idbopendbrequest-onupgradeneeded
    event_handler!(upgradeneeded, get_onupgradeneeded, set_onupgradeneeded);
}
