/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use crate::dom::event::{Event, EventBubbles, EventCancelable};

/// <https://w3c.github.io/IndexedDB/#events>
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IDBVersionChangeEvent {
    old_version: u64,
    new_version: Option<u64>,
}

impl IDBVersionChangeEvent {
    pub fn new_inherited(old_version: u64, new_version: Option<u64>) -> IDBVersionChangeEvent {
        IDBVersionChangeEvent {
            old_version,
            new_version,
        }
    }

    /// <https://w3c.github.io/IndexedDB/#fire-a-version-change-event>
    pub fn new(type_: &str, old_version: u64, new_version: Option<u64>) -> Event {
        Event::new(type_, EventBubbles::DoesNotBubble, EventCancelable::NotCancelable)
            .with_version_change(Self::new_inherited(old_version, new_version))
    }

    pub fn old_version(&self) -> u64 {
        self.old_version
    }

    /// `None` when the database is being deleted.
    pub fn new_version(&self) -> Option<u64> {
        self.new_version
    }
}
