/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::Cell;

use log::trace;

use crate::dom::eventtarget::EventTarget;
use crate::dom::idbversionchangeevent::IDBVersionChangeEvent;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventBubbles {
    Bubbles,
    DoesNotBubble,
}

impl From<EventBubbles> for bool {
    fn from(bubbles: EventBubbles) -> Self {
        matches!(bubbles, EventBubbles::Bubbles)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventCancelable {
    Cancelable,
    NotCancelable,
}

impl From<EventCancelable> for bool {
    fn from(cancelable: EventCancelable) -> Self {
        matches!(cancelable, EventCancelable::Cancelable)
    }
}

/// <https://dom.spec.whatwg.org/#interface-event>
#[derive(Debug)]
pub struct Event {
    type_: String,
    bubbles: bool,
    cancelable: bool,
    canceled: Cell<bool>,
    stop_propagation: Cell<bool>,
    stop_immediate: Cell<bool>,
    dispatching: Cell<bool>,
    version_change: Option<IDBVersionChangeEvent>,
}

impl Event {
    pub fn new(type_: &str, bubbles: EventBubbles, cancelable: EventCancelable) -> Event {
        Event {
            type_: type_.to_owned(),
            bubbles: bubbles.into(),
            cancelable: cancelable.into(),
            canceled: Cell::new(false),
            stop_propagation: Cell::new(false),
            stop_immediate: Cell::new(false),
            dispatching: Cell::new(false),
            version_change: None,
        }
    }

    pub(crate) fn with_version_change(mut self, version_change: IDBVersionChangeEvent) -> Event {
        self.version_change = Some(version_change);
        self
    }

    pub fn type_(&self) -> &str {
        &self.type_
    }

    pub fn bubbles(&self) -> bool {
        self.bubbles
    }

    pub fn cancelable(&self) -> bool {
        self.cancelable
    }

    /// <https://dom.spec.whatwg.org/#dom-event-preventdefault>
    pub fn prevent_default(&self) {
        if self.cancelable {
            self.canceled.set(true);
        }
    }

    pub fn default_prevented(&self) -> bool {
        self.canceled.get()
    }

    pub fn stop_propagation(&self) {
        self.stop_propagation.set(true);
    }

    pub fn stop_immediate_propagation(&self) {
        self.stop_immediate.set(true);
        self.stop_propagation.set(true);
    }

    pub(crate) fn immediate_propagation_stopped(&self) -> bool {
        self.stop_immediate.get()
    }

    /// The `oldVersion` and `newVersion` of an `IDBVersionChangeEvent`.
    pub fn as_version_change(&self) -> Option<&IDBVersionChangeEvent> {
        self.version_change.as_ref()
    }

    /// <https://dom.spec.whatwg.org/#concept-event-dispatch>
    ///
    /// `path` starts with the target, followed by the parents the event bubbles
    /// through. Returns false if the event was canceled.
    pub fn dispatch(&self, path: &[&EventTarget]) -> bool {
        debug_assert!(!self.dispatching.get(), "Event dispatched twice");
        self.dispatching.set(true);
        trace!("Dispatching {} event", self.type_);

        let targets = if self.bubbles { path } else { &path[..path.len().min(1)] };
        for target in targets {
            target.invoke(self);
            if self.stop_propagation.get() {
                break;
            }
        }

        self.dispatching.set(false);
        !self.canceled.get()
    }

    /// Dispatches at a single target.
    pub fn fire(&self, target: &EventTarget) -> bool {
        self.dispatch(&[target])
    }
}
