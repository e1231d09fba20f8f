/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cmp::Ordering;
use std::rc::Rc;

use storage_traits::indexeddb::DatabaseInfo;

use crate::dom::bindings::error::{Error, Fallible, map_backend_error_to_dom_error};
use crate::dom::bindings::value::Value;
use crate::dom::globalscope::GlobalScope;
use crate::dom::idbopendbrequest::IDBOpenDBRequest;
use crate::indexed_db::validate_key;

/// <https://w3c.github.io/IndexedDB/#factory-interface>
pub struct IDBFactory {
    global: Rc<GlobalScope>,
}

impl IDBFactory {
    pub fn new(global: &Rc<GlobalScope>) -> IDBFactory {
        IDBFactory {
            global: global.clone(),
        }
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbfactory-open>
    pub fn open(&self, name: &str, version: Option<u64>) -> Fallible<Rc<IDBOpenDBRequest>> {
        // Step 1: If version is 0 (zero), throw a TypeError.
        if version == Some(0) {
            return Err(Error::Type(
                "The version must be an integer >= 1".to_owned(),
            ));
        };

        // Step 4: Let request be a new open request.
        let request = IDBOpenDBRequest::new(&self.global, name);

        // Step 5: Runs in parallel
        request.open_database(version);

        // Step 6: Return a new IDBOpenDBRequest object for request.
        Ok(request)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbfactory-deletedatabase>
    pub fn delete_database(&self, name: &str) -> Fallible<Rc<IDBOpenDBRequest>> {
        // Step 3: Let request be a new open request
        let request = IDBOpenDBRequest::new(&self.global, name);

        // Step 4: Runs in parallel
        request.delete_database();

        // Step 5: Return request
        Ok(request)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbfactory-databases>
    ///
    /// Only databases whose version change committed are listed.
    pub fn databases(&self) -> Fallible<Vec<DatabaseInfo>> {
        self.global
            .indexeddb_manager()
            .databases()
            .map_err(map_backend_error_to_dom_error)
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbfactory-cmp>
    pub fn cmp(&self, first: &Value, second: &Value) -> Fallible<i16> {
        let first_key = validate_key(first)?;
        let second_key = validate_key(second)?;
        Ok(match first_key.cmp(&second_key) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        })
    }
}
