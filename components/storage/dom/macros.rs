/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

/// Generates the getter and setter of an `on<event>` attribute.
/// The type needs an `upcast()` returning its `EventTarget`.
macro_rules! event_handler(
    ($event_type: ident, $getter: ident, $setter: ident) => (
        pub fn $getter(&self) -> Option<$crate::dom::eventtarget::EventHandler> {
            self.upcast().get_event_handler_common(stringify!($event_type))
        }

        pub fn $setter(&self, listener: Option<$crate::dom::eventtarget::EventHandler>) {
            self.upcast().set_event_handler_common(stringify!($event_type), listener)
        }
    )
);
