/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::dom::event::Event;

pub type EventHandler = Rc<dyn Fn(&Event)>;

/// Wraps a closure for use as an event handler or listener.
pub fn event_handler(handler: impl Fn(&Event) + 'static) -> Option<EventHandler> {
    Some(Rc::new(handler))
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum ListenerKind {
    /// An `on<event>` attribute, which keeps the position it was first set at.
    Inline,
    Additive,
}

struct EventListenerEntry {
    type_: String,
    kind: ListenerKind,
    listener: EventHandler,
}

/// <https://dom.spec.whatwg.org/#interface-eventtarget>
#[derive(Default)]
pub struct EventTarget {
    listeners: RefCell<Vec<EventListenerEntry>>,
}

impl fmt::Debug for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTarget")
            .field("listeners", &self.listeners.borrow().len())
            .finish()
    }
}

impl EventTarget {
    pub fn new_inherited() -> EventTarget {
        EventTarget::default()
    }

    /// <https://dom.spec.whatwg.org/#dom-eventtarget-addeventlistener>
    pub fn add_event_listener(&self, type_: &str, listener: impl Fn(&Event) + 'static) {
        self.listeners.borrow_mut().push(EventListenerEntry {
            type_: type_.to_owned(),
            kind: ListenerKind::Additive,
            listener: Rc::new(listener),
        });
    }

    pub fn get_event_handler_common(&self, type_: &str) -> Option<EventHandler> {
        self.listeners
            .borrow()
            .iter()
            .find(|entry| entry.kind == ListenerKind::Inline && entry.type_ == type_)
            .map(|entry| entry.listener.clone())
    }

    /// <https://html.spec.whatwg.org/multipage/#event-handler-attributes>
    pub fn set_event_handler_common(&self, type_: &str, listener: Option<EventHandler>) {
        let mut listeners = self.listeners.borrow_mut();
        let position = listeners
            .iter()
            .position(|entry| entry.kind == ListenerKind::Inline && entry.type_ == type_);
        match (position, listener) {
            (Some(position), Some(listener)) => listeners[position].listener = listener,
            (Some(position), None) => {
                listeners.remove(position);
            },
            (None, Some(listener)) => listeners.push(EventListenerEntry {
                type_: type_.to_owned(),
                kind: ListenerKind::Inline,
                listener,
            }),
            (None, None) => {},
        }
    }

    /// <https://dom.spec.whatwg.org/#concept-event-listener-inner-invoke>
    pub(crate) fn invoke(&self, event: &Event) {
        // Listeners may add or remove listeners, so work on a snapshot.
        let listeners: Vec<EventHandler> = self
            .listeners
            .borrow()
            .iter()
            .filter(|entry| entry.type_ == event.type_())
            .map(|entry| entry.listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
            if event.immediate_propagation_stopped() {
                break;
            }
        }
    }
}
