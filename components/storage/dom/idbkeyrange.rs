/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use storage_traits::indexeddb::IndexedDBKeyRange;

use crate::dom::bindings::error::{Error, Fallible};
use crate::dom::bindings::value::Value;
use crate::indexed_db::{key_type_to_value, validate_key};

/// <https://w3c.github.io/IndexedDB/#keyrange>
#[derive(Clone, Debug, PartialEq)]
pub struct IDBKeyRange {
    inner: IndexedDBKeyRange,
}

impl IDBKeyRange {
    fn new(inner: IndexedDBKeyRange) -> IDBKeyRange {
        IDBKeyRange { inner }
    }

    pub(crate) fn inner(&self) -> &IndexedDBKeyRange {
        &self.inner
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbkeyrange-only>
    pub fn only(value: &Value) -> Fallible<IDBKeyRange> {
        // Step 1: Let key be the result of converting a value to a key with value.
        // Step 2: If key is invalid, throw a "DataError" DOMException.
        let key = validate_key(value)?;
        // Step 3: Create and return a new key range containing only key.
        Ok(IDBKeyRange::new(IndexedDBKeyRange::only(key)))
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbkeyrange-lowerbound>
    pub fn lower_bound(lower: &Value, open: bool) -> Fallible<IDBKeyRange> {
        let key = validate_key(lower)?;
        Ok(IDBKeyRange::new(IndexedDBKeyRange::lower_bound(key, open)))
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbkeyrange-upperbound>
    pub fn upper_bound(upper: &Value, open: bool) -> Fallible<IDBKeyRange> {
        let key = validate_key(upper)?;
        Ok(IDBKeyRange::new(IndexedDBKeyRange::upper_bound(key, open)))
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbkeyrange-bound>
    pub fn bound(
        lower: &Value,
        upper: &Value,
        lower_open: bool,
        upper_open: bool,
    ) -> Fallible<IDBKeyRange> {
        // Step 1-4: Convert lower and upper to keys, throwing a "DataError" on failure.
        let lower = validate_key(lower)?;
        let upper = validate_key(upper)?;

        // Step 5: If lowerKey is greater than upperKey, throw a "DataError" DOMException.
        if lower > upper {
            return Err(Error::Data);
        }

        // An empty range, such as [1, 1), is rejected the same way.
        if lower == upper && (lower_open || upper_open) {
            return Err(Error::Data);
        }

        // Step 6: Create and return a new key range.
        Ok(IDBKeyRange::new(IndexedDBKeyRange::new(
            Some(lower),
            Some(upper),
            lower_open,
            upper_open,
        )))
    }

    /// <https://w3c.github.io/IndexedDB/#dom-idbkeyrange-includes>
    pub fn includes(&self, value: &Value) -> Fallible<bool> {
        let key = validate_key(value)?;
        Ok(self.inner.contains(&key))
    }

    pub fn lower(&self) -> Value {
        self.inner
            .lower
            .as_ref()
            .map_or(Value::Undefined, key_type_to_value)
    }

    pub fn upper(&self) -> Value {
        self.inner
            .upper
            .as_ref()
            .map_or(Value::Undefined, key_type_to_value)
    }

    pub fn lower_open(&self) -> bool {
        self.inner.lower_open
    }

    pub fn upper_open(&self) -> bool {
        self.inner.upper_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_rejects_inverted_and_empty_ranges() {
        assert_eq!(
            IDBKeyRange::bound(&Value::from(5), &Value::from(1), false, false),
            Err(Error::Data)
        );
        assert_eq!(
            IDBKeyRange::bound(&Value::from(1), &Value::from(1), true, false),
            Err(Error::Data)
        );
        assert!(IDBKeyRange::bound(&Value::from(1), &Value::from(1), false, false).is_ok());
    }

    #[test]
    fn includes_honors_open_ends() {
        let range = IDBKeyRange::bound(&Value::from(2), &Value::from(4), true, false).unwrap();
        assert_eq!(range.includes(&Value::from(2)), Ok(false));
        assert_eq!(range.includes(&Value::from(3)), Ok(true));
        assert_eq!(range.includes(&Value::from(4)), Ok(true));
        assert_eq!(range.includes(&Value::Null), Err(Error::Data));
    }

    #[test]
    fn unbounded_side_reads_as_undefined() {
        let range = IDBKeyRange::lower_bound(&Value::from("a"), false).unwrap();
        assert!(range.upper().is_undefined());
        assert!(range.upper_open());
        assert!(!range.lower_open());
    }
}
