/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! One open database and the transactions running against it.

use std::rc::Rc;

use indexmap::IndexMap;
use log::{debug, error, warn};
use storage_traits::indexeddb::{BackendError, BackendResult, IndexedDBTxnMode};

use crate::event_loop::{EventLoop, TaskSourceName};
use crate::indexeddb::engines::{KvsEngine, KvsTransaction};

/// Called in a database task once the backend transaction has started.
pub type StartCallback = Box<dyn FnOnce(BackendResult<()>)>;

enum TransactionState {
    Queued,
    Running(Box<dyn KvsTransaction>),
}

struct TransactionRecord {
    mode: IndexedDBTxnMode,
    scope: Vec<String>,
    state: TransactionState,
    /// The version staged when an upgrade transaction starts.
    upgrade_to: Option<u64>,
    on_start: Option<StartCallback>,
}

impl TransactionRecord {
    fn overlaps(&self, other: &TransactionRecord) -> bool {
        self.mode == IndexedDBTxnMode::Versionchange ||
            other.mode == IndexedDBTxnMode::Versionchange ||
            self.scope.iter().any(|name| other.scope.contains(name))
    }

    fn writes(&self) -> bool {
        self.mode != IndexedDBTxnMode::Readonly
    }
}

pub(crate) struct IndexedDBEnvironment {
    engine: Rc<dyn KvsEngine>,
    event_loop: EventLoop,
    /// Unfinished transactions, in creation order.
    transactions: IndexMap<u64, TransactionRecord>,
}

impl IndexedDBEnvironment {
    pub(crate) fn new(engine: Rc<dyn KvsEngine>, event_loop: EventLoop) -> IndexedDBEnvironment {
        IndexedDBEnvironment {
            engine,
            event_loop,
            transactions: IndexMap::new(),
        }
    }

    pub(crate) fn engine(&self) -> &Rc<dyn KvsEngine> {
        &self.engine
    }

    pub(crate) fn has_transactions(&self) -> bool {
        !self.transactions.is_empty()
    }

    /// Adds a transaction behind every transaction created before it, and
    /// starts it right away if nothing it overlaps is still running or queued.
    pub(crate) fn register_transaction(
        &mut self,
        serial_number: u64,
        mode: IndexedDBTxnMode,
        scope: Vec<String>,
        upgrade_to: Option<u64>,
        on_start: Option<StartCallback>,
    ) {
        self.transactions.insert(
            serial_number,
            TransactionRecord {
                mode,
                scope,
                state: TransactionState::Queued,
                upgrade_to,
                on_start,
            },
        );
        self.schedule_transactions();
    }

    pub(crate) fn is_running(&self, serial_number: u64) -> bool {
        matches!(
            self.transactions.get(&serial_number),
            Some(TransactionRecord {
                state: TransactionState::Running(_),
                ..
            })
        )
    }

    /// <https://w3c.github.io/IndexedDB/#transaction-scheduling>
    ///
    /// A transaction can start once no transaction created before it that is
    /// still unfinished overlaps its scope, unless both are read-only. Engines
    /// that cannot hold two writers open also queue writers behind any
    /// earlier writer.
    fn can_start(&self, index: usize) -> bool {
        let Some((_, candidate)) = self.transactions.get_index(index) else {
            return false;
        };
        let serialize_writers = !self.engine.allows_concurrent_writers();
        self.transactions
            .values()
            .take(index)
            .filter(|earlier| {
                earlier.overlaps(candidate) ||
                    (serialize_writers && earlier.writes() && candidate.writes())
            })
            .all(|earlier| !earlier.writes() && !candidate.writes())
    }

    pub(crate) fn schedule_transactions(&mut self) {
        let mut index = 0;
        while index < self.transactions.len() {
            let queued = matches!(
                self.transactions[index].state,
                TransactionState::Queued
            );
            if queued && self.can_start(index) {
                if !self.start_transaction(index) {
                    // The record was removed, so the next one is now at `index`.
                    continue;
                }
            }
            index += 1;
        }
    }

    /// Returns false if the transaction failed to start and was dropped.
    fn start_transaction(&mut self, index: usize) -> bool {
        let engine = self.engine.clone();
        let Some((&serial_number, record)) = self.transactions.get_index_mut(index) else {
            return false;
        };
        debug!(
            "Starting {:?} transaction {} on {}",
            record.mode,
            serial_number,
            engine.name()
        );

        let started = engine
            .begin_transaction(&record.scope, record.mode)
            .and_then(|transaction| {
                if let Some(version) = record.upgrade_to {
                    engine.set_version(version)?;
                }
                Ok(transaction)
            });
        let on_start = record.on_start.take();
        let result = match started {
            Ok(transaction) => {
                record.state = TransactionState::Running(transaction);
                Ok(())
            },
            Err(e) => {
                warn!("Failed to start transaction {serial_number}: {e}");
                self.transactions.shift_remove_index(index);
                Err(e)
            },
        };
        let keep = result.is_ok();

        // https://w3c.github.io/IndexedDB/#transaction-lifecycle
        // The implementation must queue a database task to start the transaction asynchronously.
        if let Some(on_start) = on_start {
            self.event_loop
                .queue_task(TaskSourceName::DatabaseAccess, move || on_start(result));
        }
        keep
    }

    /// Runs `callback` against a started transaction.
    pub(crate) fn with_transaction<R>(
        &mut self,
        serial_number: u64,
        callback: impl FnOnce(&mut dyn KvsTransaction) -> R,
    ) -> BackendResult<R> {
        match self.transactions.get_mut(&serial_number) {
            Some(TransactionRecord {
                state: TransactionState::Running(transaction),
                ..
            }) => Ok(callback(transaction.as_mut())),
            Some(_) => Err(BackendError::DbErr(format!(
                "transaction {serial_number} has not started"
            ))),
            None => Err(BackendError::DbErr(format!(
                "transaction {serial_number} is finished"
            ))),
        }
    }

    /// <https://w3c.github.io/IndexedDB/#commit-a-transaction>
    pub(crate) fn commit_transaction(&mut self, serial_number: u64) -> BackendResult<()> {
        let Some(record) = self.transactions.shift_remove(&serial_number) else {
            return Err(BackendError::DbErr(format!(
                "transaction {serial_number} is finished"
            )));
        };
        let result = match record.state {
            TransactionState::Running(transaction) => {
                let version = match record.mode {
                    IndexedDBTxnMode::Versionchange => self.engine.commit_version(),
                    _ => Ok(()),
                };
                match version {
                    Ok(()) => transaction.commit(),
                    Err(e) => {
                        if let Err(abort_error) = transaction.abort() {
                            error!("Failed to abort after a failed commit: {abort_error}");
                        }
                        Err(e)
                    },
                }
            },
            TransactionState::Queued => Err(BackendError::DbErr(format!(
                "transaction {serial_number} committed before it started"
            ))),
        };
        debug!("Committed transaction {serial_number}: {result:?}");
        self.schedule_transactions();
        result
    }

    /// <https://w3c.github.io/IndexedDB/#abort-a-transaction>
    pub(crate) fn abort_transaction(&mut self, serial_number: u64) -> BackendResult<()> {
        let Some(record) = self.transactions.shift_remove(&serial_number) else {
            return Ok(());
        };
        debug!("Aborting transaction {serial_number}");
        let result = match record.state {
            TransactionState::Running(transaction) => transaction.abort(),
            TransactionState::Queued => Ok(()),
        };
        self.schedule_transactions();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::indexeddb::engines::{IndexedDBBackend, MemoryBackend, SqliteBackend};

    fn environment() -> (IndexedDBEnvironment, EventLoop) {
        let event_loop = EventLoop::new();
        let backend = MemoryBackend::new();
        let engine = backend.open("db").unwrap();
        (IndexedDBEnvironment::new(engine, event_loop.clone()), event_loop)
    }

    fn register(
        environment: &mut IndexedDBEnvironment,
        serial_number: u64,
        mode: IndexedDBTxnMode,
        scope: &[&str],
        log: &Rc<RefCell<Vec<u64>>>,
    ) {
        let log = log.clone();
        environment.register_transaction(
            serial_number,
            mode,
            scope.iter().map(|name| name.to_string()).collect(),
            None,
            Some(Box::new(move |result| {
                assert!(result.is_ok());
                log.borrow_mut().push(serial_number);
            })),
        );
    }

    #[test]
    fn readers_share_and_writers_wait() {
        let (mut environment, event_loop) = environment();
        let log = Rc::new(RefCell::new(vec![]));
        register(&mut environment, 1, IndexedDBTxnMode::Readonly, &["a"], &log);
        register(&mut environment, 2, IndexedDBTxnMode::Readonly, &["a"], &log);
        register(&mut environment, 3, IndexedDBTxnMode::Readwrite, &["a", "b"], &log);
        register(&mut environment, 4, IndexedDBTxnMode::Readwrite, &["c"], &log);
        register(&mut environment, 5, IndexedDBTxnMode::Readonly, &["b"], &log);
        event_loop.run_until_idle();
        assert_eq!(*log.borrow(), [1, 2, 4]);

        environment.commit_transaction(1).unwrap();
        environment.commit_transaction(2).unwrap();
        event_loop.run_until_idle();
        assert_eq!(*log.borrow(), [1, 2, 4, 3]);

        environment.abort_transaction(3).unwrap();
        event_loop.run_until_idle();
        assert_eq!(*log.borrow(), [1, 2, 4, 3, 5]);
    }

    #[test]
    fn versionchange_blocks_everything() {
        let (mut environment, event_loop) = environment();
        let log = Rc::new(RefCell::new(vec![]));
        register(&mut environment, 1, IndexedDBTxnMode::Versionchange, &[], &log);
        register(&mut environment, 2, IndexedDBTxnMode::Readonly, &["a"], &log);
        event_loop.run_until_idle();
        assert_eq!(*log.borrow(), [1]);
        assert!(!environment.is_running(2));
        environment.commit_transaction(1).unwrap();
        assert!(environment.is_running(2));
    }

    #[test]
    fn disjoint_writers_wait_for_each_other_on_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path());
        let event_loop = EventLoop::new();
        let mut environment =
            IndexedDBEnvironment::new(backend.open("db").unwrap(), event_loop.clone());
        let log = Rc::new(RefCell::new(vec![]));
        register(&mut environment, 1, IndexedDBTxnMode::Readwrite, &["a"], &log);
        register(&mut environment, 2, IndexedDBTxnMode::Readwrite, &["b"], &log);
        register(&mut environment, 3, IndexedDBTxnMode::Readonly, &["c"], &log);
        event_loop.run_until_idle();
        assert_eq!(*log.borrow(), [1, 3]);

        environment.commit_transaction(1).unwrap();
        event_loop.run_until_idle();
        assert_eq!(*log.borrow(), [1, 3, 2]);
        environment.commit_transaction(2).unwrap();
        environment.commit_transaction(3).unwrap();
    }
}
