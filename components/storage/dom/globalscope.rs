/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::{RefCell, RefMut};
use std::rc::Rc;

use crate::dom::idbfactory::IDBFactory;
use crate::event_loop::EventLoop;
use crate::indexeddb::IndexedDBManager;
use crate::indexeddb::engines::IndexedDBBackend;

/// The environment the IndexedDB objects live in: one event loop and the
/// manager of the databases reachable from it.
pub struct GlobalScope {
    event_loop: EventLoop,
    indexeddb_manager: RefCell<IndexedDBManager>,
}

impl GlobalScope {
    pub fn new(backend: Box<dyn IndexedDBBackend>) -> Rc<GlobalScope> {
        let event_loop = EventLoop::new();
        Rc::new(GlobalScope {
            indexeddb_manager: RefCell::new(IndexedDBManager::new(backend, event_loop.clone())),
            event_loop,
        })
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// The manager never calls back into script synchronously, so this borrow
    /// must only be held for the duration of a single manager call.
    pub(crate) fn indexeddb_manager(&self) -> RefMut<'_, IndexedDBManager> {
        self.indexeddb_manager.borrow_mut()
    }

    /// <https://w3c.github.io/IndexedDB/#dom-windoworworkerglobalscope-indexeddb>
    pub fn indexed_db(self: &Rc<Self>) -> IDBFactory {
        IDBFactory::new(self)
    }
}
