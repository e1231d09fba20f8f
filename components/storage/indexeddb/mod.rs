/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The IndexedDB manager: connection queues, open connections and the
//! transaction scheduler of every database, on top of a storage backend.
//!
//! Everything the manager reports back to script goes through a callback that
//! runs in a queued [`TaskSourceName::DatabaseAccess`] task, never
//! synchronously, so script may call back into the manager from any event
//! handler.

pub mod engines;
mod environment;
pub mod key_codec;
pub(crate) mod operations;

use std::collections::VecDeque;
use std::rc::Rc;

use log::{debug, error};
use rustc_hash::{FxHashMap, FxHashSet};
use storage_traits::indexeddb::{
    BackendError, BackendResult, DatabaseInfo, DatabaseMeta, IndexedDBTxnMode,
};

pub use self::environment::StartCallback;
use self::environment::IndexedDBEnvironment;
use crate::event_loop::{EventLoop, TaskSourceName};
use crate::indexeddb::engines::{IndexedDBBackend, KvsTransaction};

/// Messages sent to the script side of an open request, or of the connection
/// that request produced.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionMsg {
    /// The open request succeeded.
    Connection {
        id: u64,
        version: u64,
        upgraded: bool,
    },
    /// Fire `upgradeneeded`; `transaction` is already started.
    Upgrade {
        id: u64,
        old_version: u64,
        version: u64,
        transaction: u64,
    },
    VersionError {
        id: u64,
    },
    /// The upgrade transaction aborted.
    AbortError {
        id: u64,
    },
    DatabaseError {
        id: u64,
        error: BackendError,
    },
    /// Other connections stayed open after `versionchange`.
    Blocked {
        id: u64,
        old_version: u64,
        version: u64,
    },
    /// Sent to an open connection that another request wants closed.
    /// `version` is `None` when the database is being deleted.
    VersionChange {
        id: u64,
        old_version: u64,
        version: Option<u64>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeleteMsg {
    Blocked { old_version: u64 },
    Done(BackendResult<u64>),
}

pub type ConnectionCallback = Rc<dyn Fn(ConnectionMsg)>;
pub type DeleteCallback = Rc<dyn Fn(DeleteMsg)>;

/// <https://w3c.github.io/IndexedDB/#request-open-request>
/// Used here to implement the
/// <https://w3c.github.io/IndexedDB/#connection-queue>
enum OpenRequest {
    Open {
        sender: ConnectionCallback,
        /// The requested version; settled once the database is opened.
        version: Option<u64>,
        /// Set once the upgrade transaction runs.
        /// Used as <https://w3c.github.io/IndexedDB/#request-processed-flag>
        pending_upgrade: Option<VersionUpgrade>,
        /// Connections this request waits on to close.
        pending_close: FxHashSet<u64>,
        /// Connections that have not yet handled their `versionchange` event.
        pending_versionchange: FxHashSet<u64>,
        id: u64,
    },
    Delete {
        sender: DeleteCallback,
        pending_close: FxHashSet<u64>,
        pending_versionchange: FxHashSet<u64>,
        /// The version reported in `blocked` and in the result.
        old_version: Option<u64>,
        /// <https://w3c.github.io/IndexedDB/#request-processed-flag>
        processed: bool,
    },
}

impl OpenRequest {
    fn is_pending(&self) -> bool {
        match self {
            OpenRequest::Open {
                pending_upgrade,
                pending_close,
                pending_versionchange,
                version,
                ..
            } => {
                version.is_none() ||
                    pending_upgrade.is_some() ||
                    !pending_close.is_empty() ||
                    !pending_versionchange.is_empty()
            },
            OpenRequest::Delete { processed, .. } => !processed,
        }
    }

    fn waiting_on(&mut self) -> (&mut FxHashSet<u64>, &mut FxHashSet<u64>) {
        match self {
            OpenRequest::Open {
                pending_close,
                pending_versionchange,
                ..
            } |
            OpenRequest::Delete {
                pending_close,
                pending_versionchange,
                ..
            } => (pending_close, pending_versionchange),
        }
    }
}

struct VersionUpgrade {
    old: u64,
}

/// <https://w3c.github.io/IndexedDB/#connection>
struct Connection {
    /// <https://w3c.github.io/IndexedDB/#connection-close-pending-flag>
    close_pending: bool,
    sender: ConnectionCallback,
}

pub struct IndexedDBManager {
    backend: Box<dyn IndexedDBBackend>,
    event_loop: EventLoop,
    databases: FxHashMap<String, IndexedDBEnvironment>,

    /// A counter producing unique connection and transaction ids.
    serial_number_counter: u64,

    /// <https://w3c.github.io/IndexedDB/#connection-queue>
    connection_queues: FxHashMap<String, VecDeque<OpenRequest>>,

    /// <https://w3c.github.io/IndexedDB/#connection>
    connections: FxHashMap<String, FxHashMap<u64, Connection>>,
}

impl IndexedDBManager {
    pub fn new(backend: Box<dyn IndexedDBBackend>, event_loop: EventLoop) -> IndexedDBManager {
        debug!("New indexedDBManager");
        IndexedDBManager {
            backend,
            event_loop,
            databases: Default::default(),
            serial_number_counter: 0,
            connection_queues: Default::default(),
            connections: Default::default(),
        }
    }

    fn next_serial_number(&mut self) -> u64 {
        self.serial_number_counter += 1;
        self.serial_number_counter
    }

    fn send(&self, sender: &ConnectionCallback, message: ConnectionMsg) {
        let sender = sender.clone();
        self.event_loop
            .queue_task(TaskSourceName::DatabaseAccess, move || sender(message));
    }

    fn send_delete(&self, sender: &DeleteCallback, message: DeleteMsg) {
        let sender = sender.clone();
        self.event_loop
            .queue_task(TaskSourceName::DatabaseAccess, move || sender(message));
    }

    /// The environment of `name`, opening the database if needed.
    fn environment(&mut self, name: &str) -> BackendResult<&mut IndexedDBEnvironment> {
        if !self.databases.contains_key(name) {
            let engine = self.backend.open(name)?;
            self.databases.insert(
                name.to_owned(),
                IndexedDBEnvironment::new(engine, self.event_loop.clone()),
            );
        }
        self.databases
            .get_mut(name)
            .ok_or(BackendError::DbNotFound)
    }

    fn open_environment(&mut self, name: &str) -> BackendResult<&mut IndexedDBEnvironment> {
        self.databases
            .get_mut(name)
            .ok_or(BackendError::DbNotFound)
    }

    /// <https://w3c.github.io/IndexedDB/#open-a-database-connection>
    ///
    /// Returns the id of the connection the request will produce.
    pub fn open_a_database_connection(
        &mut self,
        sender: ConnectionCallback,
        name: &str,
        version: Option<u64>,
    ) -> u64 {
        let id = self.next_serial_number();
        let open_request = OpenRequest::Open {
            sender,
            version,
            pending_upgrade: None,
            pending_close: Default::default(),
            pending_versionchange: Default::default(),
            id,
        };
        // Step 1: Let queue be the connection queue for storageKey and name.
        // Step 2: Add request to queue.
        self.push_request(name, open_request);
        id
    }

    /// <https://w3c.github.io/IndexedDB/#delete-a-database>
    pub fn delete_database(&mut self, sender: DeleteCallback, name: &str) {
        let delete_request = OpenRequest::Delete {
            sender,
            pending_close: Default::default(),
            pending_versionchange: Default::default(),
            old_version: None,
            processed: false,
        };
        self.push_request(name, delete_request);
    }

    fn push_request(&mut self, name: &str, request: OpenRequest) {
        let should_continue = {
            let queue = self.connection_queues.entry(name.to_owned()).or_default();
            queue.push_back(request);
            queue.len() == 1
        };

        // Step 3: Wait until all previous requests in queue have been processed.
        if should_continue {
            self.advance_connection_queue(name);
        }
    }

    /// Run the requests at the front of the queue until one has to wait.
    fn advance_connection_queue(&mut self, name: &str) {
        loop {
            let is_open = match self.connection_queues.get(name).and_then(VecDeque::front) {
                Some(request) => matches!(request, OpenRequest::Open { .. }),
                None => return,
            };

            if is_open {
                self.open_database(name);
            } else {
                self.delete_database_step(name);
            }

            if !self.maybe_remove_front_from_queue(name) {
                break;
            }
        }
    }

    /// Remove the request at the front if it is not pending.
    fn maybe_remove_front_from_queue(&mut self, name: &str) -> bool {
        let Some(queue) = self.connection_queues.get_mut(name) else {
            return false;
        };
        let pruned = match queue.front() {
            Some(request) if !request.is_pending() => {
                queue.pop_front();
                true
            },
            _ => false,
        };
        if queue.is_empty() {
            self.connection_queues.remove(name);
        }
        pruned
    }

    fn remove_connection(&mut self, name: &str, id: u64) {
        let Some(connections) = self.connections.get_mut(name) else {
            return debug!("Connection already removed.");
        };
        connections.remove(&id);
        if connections.is_empty() {
            self.connections.remove(name);
        }
    }

    /// Sends `versionchange` to every other connection that is not closing and
    /// records the request as waiting on every other connection to close.
    /// Returns false if there was nobody to wait on.
    fn notify_open_connections(
        &mut self,
        name: &str,
        except: Option<u64>,
        old_version: u64,
        version: Option<u64>,
    ) -> bool {
        let others: Vec<(u64, bool, ConnectionCallback)> = self
            .connections
            .get(name)
            .map(|connections| {
                connections
                    .iter()
                    .filter(|(id, _)| Some(**id) != except)
                    .map(|(id, connection)| {
                        (*id, connection.close_pending, connection.sender.clone())
                    })
                    .collect()
            })
            .unwrap_or_default();
        if others.is_empty() {
            return false;
        }
        for (id, _, sender) in others.iter().filter(|(_, closing, _)| !closing) {
            self.send(
                sender,
                ConnectionMsg::VersionChange {
                    id: *id,
                    old_version,
                    version,
                },
            );
        }
        let Some(request) = self
            .connection_queues
            .get_mut(name)
            .and_then(VecDeque::front_mut)
        else {
            debug_assert!(false, "A request should be in the queue.");
            return false;
        };
        let (pending_close, pending_versionchange) = request.waiting_on();
        for (id, closing, _) in others {
            pending_close.insert(id);
            if !closing {
                pending_versionchange.insert(id);
            }
        }

        // Only closing connections remain, so no versionchange event will
        // report back and they are still not closed.
        if pending_versionchange.is_empty() {
            self.fire_blocked(name);
        }
        true
    }

    /// <https://w3c.github.io/IndexedDB/#open-a-database-connection>
    /// The part where the open request is ready for processing.
    fn open_database(&mut self, name: &str) {
        let (sender, requested_version, id) = match self
            .connection_queues
            .get(name)
            .and_then(VecDeque::front)
        {
            Some(OpenRequest::Open {
                sender,
                version,
                id,
                ..
            }) => (sender.clone(), *version, *id),
            _ => {
                return debug_assert!(false, "An open request should be in the queue.");
            },
        };

        // Step 4: Let db be the database named name in storageKey, or null otherwise.
        // Step 6: If db is null, let db be a new database with name name, version 0 (zero),
        // and with no object stores.
        let db_version = match self.environment(name).and_then(|db| db.engine().version()) {
            Ok(version) => version,
            Err(error) => {
                self.send(&sender, ConnectionMsg::DatabaseError { id, error });
                return self.settle_open_request(name, requested_version.unwrap_or(1));
            },
        };

        // Step 5: If version is undefined, let version be 1 if db is null, or db's version otherwise.
        let version = requested_version.unwrap_or(db_version.max(1));
        self.settle_open_request(name, version);

        // Step 7: If db's version is greater than version, return a newly created
        // "VersionError" DOMException and abort these steps.
        if version < db_version {
            return self.send(&sender, ConnectionMsg::VersionError { id });
        }

        // Step 8: Let connection be a new connection to db.
        // Step 9: Set connection's version to version.
        self.connections.entry(name.to_owned()).or_default().insert(
            id,
            Connection {
                close_pending: false,
                sender: sender.clone(),
            },
        );

        // Step 10: If db's version is less than version, then:
        if db_version < version {
            // Step 10.1-10.2: Fire versionchange at every other open connection.
            // Step 10.3: Wait for all of the events to be fired.
            if self.notify_open_connections(name, Some(id), db_version, Some(version)) {
                return;
            }

            // Step 10.6: Run upgrade a database using connection, version and request.
            return self.upgrade_database(name, version);
        }

        // Step 11: Return connection.
        self.send(
            &sender,
            ConnectionMsg::Connection {
                id,
                version: db_version,
                upgraded: false,
            },
        );
    }

    fn settle_open_request(&mut self, name: &str, settled: u64) {
        if let Some(OpenRequest::Open { version, .. }) = self
            .connection_queues
            .get_mut(name)
            .and_then(VecDeque::front_mut)
        {
            *version = Some(settled);
        }
    }

    /// <https://w3c.github.io/IndexedDB/#upgrade-a-database>
    fn upgrade_database(&mut self, name: &str, new_version: u64) {
        let (sender, id) = match self
            .connection_queues
            .get(name)
            .and_then(VecDeque::front)
        {
            Some(OpenRequest::Open { sender, id, .. }) => (sender.clone(), *id),
            _ => return debug_assert!(false, "An open request should be in the queue."),
        };

        // Step 2: Let transaction be a new upgrade transaction with connection used as connection.
        let transaction = self.next_serial_number();

        let started = self.open_environment(name).and_then(|db| {
            // Step 7: Let old version be db's version.
            let old_version = db.engine().version()?;

            // Step 3: Set transaction's scope to connection's object store set.
            // Step 6: Start transaction.
            // Step 8: Set db's version to version. This change is part of the
            // transaction and reverted if it aborts.
            db.register_transaction(
                transaction,
                IndexedDBTxnMode::Versionchange,
                vec![],
                Some(new_version),
                None,
            );
            if !db.is_running(transaction) {
                // Drop the queued record so it cannot hold back later transactions.
                db.abort_transaction(transaction)?;
                return Err(BackendError::DbErr(
                    "the upgrade transaction did not start".to_owned(),
                ));
            }
            Ok(old_version)
        });
        let old_version = match started {
            Ok(old_version) => old_version,
            Err(error) => {
                error!("Failed to upgrade {name}: {error}");
                self.remove_connection(name, id);
                self.settle_open_request(name, new_version);
                return self.send(&sender, ConnectionMsg::DatabaseError { id, error });
            },
        };

        // Step 9: Set request's processed flag to true.
        if let Some(OpenRequest::Open {
            pending_upgrade, ..
        }) = self
            .connection_queues
            .get_mut(name)
            .and_then(VecDeque::front_mut)
        {
            *pending_upgrade = Some(VersionUpgrade { old: old_version });
        }

        // Step 10: Queue a database task to fire upgradeneeded.
        // Step 11: Wait for transaction to finish.
        self.send(
            &sender,
            ConnectionMsg::Upgrade {
                id,
                old_version,
                version: new_version,
                transaction,
            },
        );
    }

    /// The upgrade transaction of connection `id` committed.
    pub fn upgrade_finished(&mut self, name: &str, id: u64) {
        let front = self.connection_queues.get_mut(name).and_then(VecDeque::pop_front);
        let Some(OpenRequest::Open {
            sender,
            version: Some(version),
            pending_upgrade: Some(_),
            id: request_id,
            ..
        }) = front
        else {
            return debug_assert!(false, "A pending version upgrade should exist.");
        };
        debug_assert_eq!(request_id, id);
        self.send(
            &sender,
            ConnectionMsg::Connection {
                id,
                version,
                upgraded: true,
            },
        );
        self.prune_empty_queue(name);
        self.advance_connection_queue(name);
    }

    /// <https://w3c.github.io/IndexedDB/#abort-an-upgrade-transaction>
    ///
    /// The backend already reverted the version when the transaction aborted.
    pub fn abort_pending_upgrade(&mut self, name: &str, id: u64) {
        let front = self.connection_queues.get_mut(name).and_then(VecDeque::pop_front);
        match front {
            Some(OpenRequest::Open {
                sender,
                id: request_id,
                ..
            }) if request_id == id => {
                self.send(&sender, ConnectionMsg::AbortError { id });
            },
            Some(other) => {
                debug_assert!(false, "Open request to abort should be at the head of the queue.");
                if let Some(queue) = self.connection_queues.get_mut(name) {
                    queue.push_front(other);
                }
                return;
            },
            None => return debug_assert!(false, "There should be an open request to upgrade."),
        }
        self.remove_connection(name, id);
        self.prune_empty_queue(name);
        self.advance_connection_queue(name);
    }

    fn prune_empty_queue(&mut self, name: &str) {
        if self
            .connection_queues
            .get(name)
            .is_some_and(VecDeque::is_empty)
        {
            self.connection_queues.remove(name);
        }
    }

    /// A connection finished handling its `versionchange` event.
    ///
    /// <https://w3c.github.io/IndexedDB/#open-a-database-connection>
    /// <https://w3c.github.io/IndexedDB/#delete-a-database>
    pub fn notify_end_of_version_change(&mut self, name: &str, from_id: u64) {
        let Some(request) = self
            .connection_queues
            .get_mut(name)
            .and_then(VecDeque::front_mut)
        else {
            return;
        };
        let (pending_close, pending_versionchange) = request.waiting_on();
        if !pending_versionchange.remove(&from_id) || !pending_versionchange.is_empty() {
            return;
        }
        let still_open = !pending_close.is_empty();

        // Step 10.4: If any of the connections in openConnections are still not closed,
        // queue a database task to fire a version change event named blocked at request.
        if still_open {
            return self.fire_blocked(name);
        }
        self.continue_front_request(name);
    }

    /// Fires `blocked` at the request at the front of the queue.
    fn fire_blocked(&mut self, name: &str) {
        let old_version = self
            .databases
            .get(name)
            .and_then(|db| db.engine().version().ok())
            .unwrap_or(0);
        match self.connection_queues.get(name).and_then(VecDeque::front) {
            Some(OpenRequest::Open {
                sender,
                id,
                version: Some(version),
                ..
            }) => {
                let message = ConnectionMsg::Blocked {
                    id: *id,
                    old_version,
                    version: *version,
                };
                let sender = sender.clone();
                self.send(&sender, message);
            },
            Some(OpenRequest::Delete { sender, .. }) => {
                let sender = sender.clone();
                self.send_delete(&sender, DeleteMsg::Blocked { old_version });
            },
            Some(OpenRequest::Open { .. }) => {
                debug_assert!(false, "An upgrade version should have been determined by now.")
            },
            None => debug_assert!(false, "A request should be in the queue."),
        }
    }

    /// Resumes the request at the front once nothing blocks it anymore.
    fn continue_front_request(&mut self, name: &str) {
        let next = match self.connection_queues.get(name).and_then(VecDeque::front) {
            Some(OpenRequest::Open {
                version: Some(version),
                pending_upgrade: None,
                ..
            }) => Some(*version),
            Some(OpenRequest::Delete {
                processed: false, ..
            }) => None,
            _ => return,
        };
        match next {
            // Step 10.6: Run upgrade a database using connection, version and request.
            Some(version) => self.upgrade_database(name, version),
            None => self.delete_database_step(name),
        }
        if self.maybe_remove_front_from_queue(name) {
            self.advance_connection_queue(name);
        }
    }

    /// <https://w3c.github.io/IndexedDB/#delete-a-database>
    fn delete_database_step(&mut self, name: &str) {
        let Some(OpenRequest::Delete {
            sender,
            pending_close,
            pending_versionchange,
            old_version,
            ..
        }) = self
            .connection_queues
            .get(name)
            .and_then(VecDeque::front)
        else {
            return debug_assert!(false, "A delete request should be in the queue.");
        };
        if !pending_close.is_empty() || !pending_versionchange.is_empty() {
            return;
        }
        let sender = sender.clone();
        let first_pass = old_version.is_none();

        if first_pass {
            let version = self
                .databases
                .get(name)
                .map(|db| db.engine().version())
                .transpose();
            let version = match version {
                Ok(version) => version,
                Err(e) => {
                    self.finish_delete(name, &sender, Err(e));
                    return;
                },
            };
            if let Some(OpenRequest::Delete { old_version, .. }) = self
                .connection_queues
                .get_mut(name)
                .and_then(VecDeque::front_mut)
            {
                *old_version = Some(version.unwrap_or(0));
            }

            // Step 5-6: Fire versionchange at every connection that is not closing.
            // Step 7: Wait for all of the events to be fired.
            if let Some(version) = version {
                if self.notify_open_connections(name, None, version, None) {
                    return;
                }
            }
        }

        // Step 10-11: Delete db and return its version.
        self.databases.remove(name);
        let result = self.backend.delete_database(name);
        self.finish_delete(name, &sender, result);
    }

    fn finish_delete(&mut self, name: &str, sender: &DeleteCallback, result: BackendResult<u64>) {
        if let Some(OpenRequest::Delete { processed, .. }) = self
            .connection_queues
            .get_mut(name)
            .and_then(VecDeque::front_mut)
        {
            *processed = true;
        }
        self.send_delete(sender, DeleteMsg::Done(result));
    }

    /// Sets the close pending flag of a connection.
    pub fn close_pending(&mut self, name: &str, id: u64) {
        if let Some(connection) = self
            .connections
            .get_mut(name)
            .and_then(|connections| connections.get_mut(&id))
        {
            connection.close_pending = true;
        }
    }

    /// <https://w3c.github.io/IndexedDB/#closing-connection>
    ///
    /// Called once every transaction of the connection has finished.
    pub fn close_database(&mut self, name: &str, id: u64) {
        self.remove_connection(name, id);

        // Continue an open or delete request waiting for connections to close.
        let Some(request) = self
            .connection_queues
            .get_mut(name)
            .and_then(VecDeque::front_mut)
        else {
            return;
        };
        let (pending_close, pending_versionchange) = request.waiting_on();
        if !pending_close.remove(&id) {
            return;
        }
        // Step 10.3: Wait for all of the events to be fired.
        // Step 10.5: Wait until all connections in openConnections are closed.
        if pending_close.is_empty() && pending_versionchange.is_empty() {
            self.continue_front_request(name);
        }
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbfactory-databases>
    pub fn databases(&self) -> BackendResult<Vec<DatabaseInfo>> {
        self.backend.databases()
    }

    pub fn metadata(&self, name: &str) -> BackendResult<DatabaseMeta> {
        self.databases
            .get(name)
            .ok_or(BackendError::DbNotFound)?
            .engine()
            .metadata()
    }

    pub fn version(&self, name: &str) -> BackendResult<u64> {
        self.databases
            .get(name)
            .ok_or(BackendError::DbNotFound)?
            .engine()
            .version()
    }

    /// Queues a transaction for scheduling and returns its serial number.
    /// `on_start` runs in a database task once it started.
    pub fn register_transaction(
        &mut self,
        name: &str,
        mode: IndexedDBTxnMode,
        scope: Vec<String>,
        on_start: StartCallback,
    ) -> BackendResult<u64> {
        let serial_number = self.next_serial_number();
        self.open_environment(name)?.register_transaction(
            serial_number,
            mode,
            scope,
            None,
            Some(on_start),
        );
        Ok(serial_number)
    }

    pub fn with_transaction<R>(
        &mut self,
        name: &str,
        serial_number: u64,
        callback: impl FnOnce(&mut dyn KvsTransaction) -> R,
    ) -> BackendResult<R> {
        self.open_environment(name)?
            .with_transaction(serial_number, callback)
    }

    pub fn commit_transaction(&mut self, name: &str, serial_number: u64) -> BackendResult<()> {
        self.open_environment(name)?
            .commit_transaction(serial_number)
    }

    pub fn abort_transaction(&mut self, name: &str, serial_number: u64) -> BackendResult<()> {
        self.open_environment(name)?.abort_transaction(serial_number)
    }

    pub fn has_transactions(&self, name: &str) -> bool {
        self.databases
            .get(name)
            .is_some_and(IndexedDBEnvironment::has_transactions)
    }
}
