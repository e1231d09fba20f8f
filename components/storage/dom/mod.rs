/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The script-facing IndexedDB interfaces.

#[macro_use]
mod macros;

pub mod bindings;
pub mod event;
pub mod eventtarget;
pub mod globalscope;
pub mod idbcursor;
pub mod idbdatabase;
pub mod idbfactory;
pub mod idbindex;
pub mod idbkeyrange;
pub mod idbobjectstore;
pub mod idbopendbrequest;
pub mod idbrequest;
pub mod idbtransaction;
pub mod idbversionchangeevent;
